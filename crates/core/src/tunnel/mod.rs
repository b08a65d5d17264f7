//! UDP tunnel to the VPN server

mod backoff;
pub mod device;
pub mod frame;
mod manager;

pub use backoff::Backoff;
pub use device::{netmask, InterfaceFactory, VirtualInterface};
#[cfg(target_os = "linux")]
pub use device::TunFactory;
pub use frame::{ClientFrame, FrameError, ServerFrame};
pub use manager::{TunnelError, TunnelSettings, TunnelState, VpnTunnelManager};
