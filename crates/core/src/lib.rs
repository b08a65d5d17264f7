pub mod network;
pub mod rotation;
pub mod tunnel;

pub use network::{
    HandleId, HandleState, ManualProvider, NetworkEvent, NetworkHandle, NetworkManager,
    NetworkProvider, NetworkSnapshot, RadioStatus,
};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use network::InterfaceProvider;

pub use rotation::{
    AirplaneToggle, AttemptId, AttemptOutcome, CellularReconnect, IpRotationManager,
    RadioToggle, RotationAttempt, RotationContext, RotationError, RotationReport,
    RotationStrategy, RotationTimings, ShellToggle, ToggleConfirmation,
};

pub use tunnel::{
    InterfaceFactory, TunnelError, TunnelSettings, TunnelState, VirtualInterface,
    VpnTunnelManager,
};
#[cfg(target_os = "linux")]
pub use tunnel::TunFactory;
