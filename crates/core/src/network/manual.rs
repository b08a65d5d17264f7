//! Provider whose networks are announced by the caller
//!
//! Useful on hosts without radio discovery and as a test double. Socket
//! binding pins the source address to the handle's local IP.

use super::{HandleId, NetworkEvent, NetworkHandle, NetworkProvider, RegistrationId};
use mobileproxy_common::RadioKind;
use socket2::{SockAddr, Socket};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct ManualState {
    networks: HashMap<RadioKind, NetworkHandle>,
    listeners: HashMap<RegistrationId, (RadioKind, mpsc::UnboundedSender<NetworkEvent>)>,
}

pub struct ManualProvider {
    next_id: AtomicU64,
    state: Mutex<ManualState>,
}

impl Default for ManualProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualProvider {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(ManualState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Brings up a network for `kind`, replacing any previous one.
    pub fn announce(
        &self,
        kind: RadioKind,
        interface: &str,
        local_addr: Option<IpAddr>,
    ) -> NetworkHandle {
        self.announce_with_dns(kind, interface, local_addr, Vec::new())
    }

    pub fn announce_with_dns(
        &self,
        kind: RadioKind,
        interface: &str,
        local_addr: Option<IpAddr>,
        dns_servers: Vec<IpAddr>,
    ) -> NetworkHandle {
        let handle = NetworkHandle {
            id: self.next_id(),
            kind,
            interface: interface.to_string(),
            local_addr,
            dns_servers,
        };

        let mut state = self.state();
        if let Some(previous) = state.networks.insert(kind, handle.clone()) {
            notify(&mut state, kind, NetworkEvent::Lost(previous.id));
        }
        notify(&mut state, kind, NetworkEvent::Available(handle.clone()));
        handle
    }

    /// Takes the network for `kind` down.
    pub fn withdraw(&self, kind: RadioKind) {
        let mut state = self.state();
        if let Some(previous) = state.networks.remove(&kind) {
            notify(&mut state, kind, NetworkEvent::Lost(previous.id));
        }
    }

    pub fn registration_count(&self) -> usize {
        self.state().listeners.len()
    }
}

fn notify(state: &mut ManualState, kind: RadioKind, event: NetworkEvent) {
    state
        .listeners
        .retain(|_, (listener_kind, tx)| *listener_kind != kind || tx.send(event.clone()).is_ok());
}

impl NetworkProvider for ManualProvider {
    fn register(
        &self,
        kind: RadioKind,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> io::Result<RegistrationId> {
        let id = self.next_id();
        let mut state = self.state();
        if let Some(handle) = state.networks.get(&kind) {
            // matches the OS behavior of calling back right away for live networks
            let _ = events.send(NetworkEvent::Available(handle.clone()));
        }
        state.listeners.insert(id, (kind, events));
        Ok(id)
    }

    fn unregister(&self, id: RegistrationId) {
        self.state().listeners.remove(&id);
    }

    fn scan(&self) -> Vec<NetworkHandle> {
        self.state().networks.values().cloned().collect()
    }

    fn bind_socket(&self, handle: &NetworkHandle, socket: &Socket) -> io::Result<()> {
        match handle.local_addr {
            Some(ip) => socket.bind(&SockAddr::from(SocketAddr::new(ip, 0))),
            None => Ok(()),
        }
    }
}
