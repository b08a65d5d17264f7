//! Virtual network interface seam.
//!
//! One read returns one IP packet, one write injects one IP packet.

use async_trait::async_trait;
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A packet device, such as a TUN interface.
pub trait VirtualInterface: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> VirtualInterface for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Creates the virtual interface once the server has assigned an address.
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    async fn create(
        &self,
        address: Ipv4Addr,
        prefix_len: u8,
        mtu: u16,
    ) -> io::Result<Box<dyn VirtualInterface>>;
}

pub fn netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix_len.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

#[cfg(target_os = "linux")]
pub use linux::TunFactory;

#[cfg(target_os = "linux")]
mod linux {
    use super::{netmask, InterfaceFactory, VirtualInterface};
    use async_trait::async_trait;
    use std::io;
    use std::net::Ipv4Addr;
    use tracing::{info, warn};

    /// TUN device via the `tun` crate
    pub struct TunFactory {
        name: String,
        routes: Vec<String>,
    }

    impl TunFactory {
        pub fn new(name: impl Into<String>, routes: Vec<String>) -> Self {
            Self {
                name: name.into(),
                routes,
            }
        }

        async fn add_route(&self, route: &str) -> io::Result<()> {
            let status = tokio::process::Command::new("ip")
                .args(["route", "replace", route, "dev", self.name.as_str()])
                .status()
                .await?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("ip route replace {} exited with {}", route, status),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl InterfaceFactory for TunFactory {
        async fn create(
            &self,
            address: Ipv4Addr,
            prefix_len: u8,
            mtu: u16,
        ) -> io::Result<Box<dyn VirtualInterface>> {
            let mut config = tun::Configuration::default();
            config
                .name(&self.name)
                .address(address)
                .netmask(netmask(prefix_len))
                .mtu(i32::from(mtu))
                .up();

            let device = tun::create_as_async(&config)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            info!("Tunnel: {} up with {}/{}", self.name, address, prefix_len);

            for route in &self.routes {
                if let Err(e) = self.add_route(route).await {
                    warn!("Tunnel: failed to add route {}: {}", route, e);
                }
            }

            Ok(Box::new(device))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(netmask(20), Ipv4Addr::new(255, 255, 240, 0));
    }
}
