//! Provider backed by named host interfaces (Linux and Android).
//!
//! Each radio maps to one interface name, e.g. `rmnet_data0` for cellular and
//! `wlan0` for WiFi. Liveness is polled from `getifaddrs`; sockets are pinned
//! with `SO_BINDTODEVICE`.

use super::{NetworkEvent, NetworkHandle, NetworkProvider, RegistrationId};
use mobileproxy_common::{NetworkConfig, RadioKind};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use socket2::Socket;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct InterfaceSpec {
    name: String,
    dns: Vec<IpAddr>,
}

pub struct InterfaceProvider {
    specs: Arc<HashMap<RadioKind, InterfaceSpec>>,
    poll_interval: Duration,
    next_id: AtomicU64,
    watchers: Mutex<HashMap<RegistrationId, JoinHandle<()>>>,
}

impl InterfaceProvider {
    pub fn new(config: &NetworkConfig) -> Self {
        let mut specs = HashMap::new();
        for kind in RadioKind::ALL {
            let dns = config
                .dns_for(kind)
                .iter()
                .filter_map(|server| match server.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!("Network: ignoring invalid {} DNS server {}", kind, server);
                        None
                    }
                })
                .collect();
            specs.insert(
                kind,
                InterfaceSpec {
                    name: config.interface_for(kind).to_string(),
                    dns,
                },
            );
        }

        Self {
            specs: Arc::new(specs),
            poll_interval: config.poll_interval(),
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
        }
    }
}

/// Reads the current attachment for `kind` from the interface table.
fn lookup_interface(kind: RadioKind, spec: &InterfaceSpec) -> Option<NetworkHandle> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("Network: getifaddrs failed: {}", e);
            return None;
        }
    };

    let mut up = false;
    let mut v4 = None;
    let mut v6 = None;
    for entry in addrs.filter(|entry| entry.interface_name == spec.name) {
        if entry
            .flags
            .contains(InterfaceFlags::IFF_UP | InterfaceFlags::IFF_RUNNING)
        {
            up = true;
        }
        let Some(address) = entry.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            v4.get_or_insert(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            let ip = *SocketAddrV6::from(*sin6).ip();
            // link-local addresses cannot carry egress traffic
            if (ip.segments()[0] & 0xffc0) != 0xfe80 {
                v6.get_or_insert(IpAddr::V6(ip));
            }
        }
    }

    let local_addr = v4.or(v6);
    if !up || local_addr.is_none() {
        return None;
    }

    let index = if_nametoindex(spec.name.as_str()).ok()?;
    Some(NetworkHandle {
        id: u64::from(index),
        kind,
        interface: spec.name.clone(),
        local_addr,
        dns_servers: spec.dns.clone(),
    })
}

impl NetworkProvider for InterfaceProvider {
    fn register(
        &self,
        kind: RadioKind,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> io::Result<RegistrationId> {
        let spec = self
            .specs
            .get(&kind)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no interface configured"))?;
        if spec.name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {} interface configured", kind),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let poll_interval = self.poll_interval;
        let watcher = tokio::spawn(async move {
            let mut last: Option<NetworkHandle> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let current = lookup_interface(kind, &spec);
                let event = match (&last, &current) {
                    (None, Some(handle)) => Some(NetworkEvent::Available(handle.clone())),
                    (Some(prev), None) => Some(NetworkEvent::Lost(prev.id)),
                    (Some(prev), Some(handle)) if prev.id != handle.id => {
                        Some(NetworkEvent::Available(handle.clone()))
                    }
                    (Some(prev), Some(handle)) if prev != handle => {
                        Some(NetworkEvent::Changed(handle.clone()))
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                last = current;
            }
        });

        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, watcher);
        Ok(id)
    }

    fn unregister(&self, id: RegistrationId) {
        let watcher = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if let Some(watcher) = watcher {
            watcher.abort();
        }
    }

    fn scan(&self) -> Vec<NetworkHandle> {
        self.specs
            .iter()
            .filter(|(_, spec)| !spec.name.is_empty())
            .filter_map(|(kind, spec)| lookup_interface(*kind, spec))
            .collect()
    }

    fn bind_socket(&self, handle: &NetworkHandle, socket: &Socket) -> io::Result<()> {
        socket.bind_device(Some(handle.interface.as_bytes()))
    }
}

impl Drop for InterfaceProvider {
    fn drop(&mut self) {
        let watchers = self
            .watchers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, watcher) in watchers.drain() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            cellular_interface: "lo".to_string(),
            wifi_interface: String::new(),
            cellular_dns: vec!["192.0.2.53".to_string(), "bogus".to_string()],
            poll_interval_ms: 20,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn test_lookup_loopback() {
        let provider = InterfaceProvider::new(&loopback_config());
        let spec = provider.specs.get(&RadioKind::Cellular).unwrap();
        let handle = lookup_interface(RadioKind::Cellular, spec).expect("lo should be up");
        assert_eq!(handle.interface, "lo");
        assert!(handle.local_addr.unwrap().is_loopback());
        assert_eq!(handle.dns_servers, vec!["192.0.2.53".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_missing_interface_is_absent() {
        let spec = InterfaceSpec {
            name: "does-not-exist0".to_string(),
            dns: Vec::new(),
        };
        assert!(lookup_interface(RadioKind::Wifi, &spec).is_none());
    }

    #[tokio::test]
    async fn test_register_reports_available() {
        let provider = InterfaceProvider::new(&loopback_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = provider.register(RadioKind::Cellular, tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, NetworkEvent::Available(ref h) if h.interface == "lo"));

        provider.unregister(id);
        assert!(provider.watchers.lock().unwrap().is_empty());

        // wifi has no interface configured
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(provider.register(RadioKind::Wifi, tx).is_err());
    }
}
