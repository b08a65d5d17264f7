//! Dual-radio network management
//!
//! Keeps a cellular and a WiFi attachment tracked at the same time, publishes
//! their liveness on per-radio watch channels, and creates sockets pinned to
//! a chosen radio. Everything OS specific sits behind [`NetworkProvider`].

mod manual;
mod resolver;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod interface;

pub use manual::ManualProvider;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use interface::InterfaceProvider;

use mobileproxy_common::{ProxyError, RadioKind, TargetAddr};
use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type HandleId = u64;
pub type RegistrationId = u64;

/// Reference to one radio's active attachment.
///
/// Consumers re-fetch it per operation instead of caching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkHandle {
    /// Unique per provider
    pub id: HandleId,
    pub kind: RadioKind,
    pub interface: String,
    /// Source address of the attachment, when known
    pub local_addr: Option<IpAddr>,
    /// Resolvers reachable over this attachment
    pub dns_servers: Vec<IpAddr>,
}

/// Liveness of one radio slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    Unavailable,
    Acquiring,
    Available(NetworkHandle),
    Lost,
}

impl HandleState {
    pub fn handle(&self) -> Option<&NetworkHandle> {
        match self {
            Self::Available(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Acquiring => "acquiring",
            Self::Available(_) => "available",
            Self::Lost => "lost",
        }
    }
}

/// Callback events a provider delivers for one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkHandle),
    /// Same attachment, new address or DNS servers
    Changed(NetworkHandle),
    Lost(HandleId),
}

/// OS connectivity service seen by the NetworkManager
pub trait NetworkProvider: Send + Sync + 'static {
    /// Starts delivering events for `kind` until unregistered.
    fn register(
        &self,
        kind: RadioKind,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> io::Result<RegistrationId>;

    fn unregister(&self, id: RegistrationId);

    /// Every attachment the OS currently reports, regardless of registrations.
    fn scan(&self) -> Vec<NetworkHandle>;

    /// Routes all traffic of `socket` through `handle`.
    fn bind_socket(&self, handle: &NetworkHandle, socket: &Socket) -> io::Result<()>;
}

struct Registration {
    id: RegistrationId,
    observer: JoinHandle<()>,
}

struct RadioSlot {
    state: Arc<watch::Sender<HandleState>>,
    registration: Mutex<Option<Registration>>,
}

impl RadioSlot {
    fn new() -> Self {
        let (state, _) = watch::channel(HandleState::Unavailable);
        Self {
            state: Arc::new(state),
            registration: Mutex::new(None),
        }
    }

    fn registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-radio status for telemetry
#[derive(Debug, Clone, Serialize)]
pub struct RadioStatus {
    pub state: &'static str,
    pub interface: Option<String>,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkSnapshot {
    pub cellular: RadioStatus,
    pub wifi: RadioStatus,
}

/// Owner of the cellular and WiFi handles
pub struct NetworkManager {
    provider: Arc<dyn NetworkProvider>,
    cellular: RadioSlot,
    wifi: RadioSlot,
    resolvers: resolver::ResolverCache,
    detach_delay: Duration,
}

impl NetworkManager {
    pub fn new(provider: Arc<dyn NetworkProvider>) -> Self {
        Self {
            provider,
            cellular: RadioSlot::new(),
            wifi: RadioSlot::new(),
            resolvers: resolver::ResolverCache::default(),
            detach_delay: Duration::from_millis(
                mobileproxy_common::config::rotation::DETACH_DELAY_MS,
            ),
        }
    }

    pub fn with_detach_delay(mut self, delay: Duration) -> Self {
        self.detach_delay = delay;
        self
    }

    fn slot(&self, kind: RadioKind) -> &RadioSlot {
        match kind {
            RadioKind::Cellular => &self.cellular,
            RadioKind::Wifi => &self.wifi,
        }
    }

    /// Requests both radios. Idempotent; state arrives on the watch channels.
    ///
    /// Must be called from within a tokio runtime.
    pub fn acquire_networks(&self) {
        self.acquire(RadioKind::Cellular);
        self.acquire(RadioKind::Wifi);
    }

    /// Releases both radios. Safe when nothing is held.
    pub fn release_networks(&self) {
        self.release(RadioKind::Cellular);
        self.release(RadioKind::Wifi);
    }

    fn acquire(&self, kind: RadioKind) {
        let slot = self.slot(kind);
        let mut registration = slot.registration();
        if registration.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        slot.state.send_replace(HandleState::Acquiring);

        let id = match self.provider.register(kind, tx) {
            Ok(id) => id,
            Err(e) => {
                warn!("Network: failed to request {} network: {}", kind, e);
                slot.state.send_replace(HandleState::Unavailable);
                return;
            }
        };

        let own = slot.state.clone();
        let other = self.slot(kind.other()).state.clone();
        let observer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                apply_event(kind, &own, &other, event);
            }
        });

        debug!("Network: requested {} network (registration {})", kind, id);
        *registration = Some(Registration { id, observer });
    }

    fn release(&self, kind: RadioKind) {
        let slot = self.slot(kind);
        if let Some(registration) = slot.registration().take() {
            self.provider.unregister(registration.id);
            registration.observer.abort();
            debug!("Network: released {} network", kind);
        }
        slot.state.send_replace(HandleState::Unavailable);
    }

    /// Releases and reacquires only the cellular radio.
    pub async fn reconnect_cellular(&self) {
        info!("Network: reconnecting cellular");
        self.release(RadioKind::Cellular);
        tokio::time::sleep(self.detach_delay).await;
        self.acquire(RadioKind::Cellular);
    }

    pub fn subscribe(&self, kind: RadioKind) -> watch::Receiver<HandleState> {
        self.slot(kind).state.subscribe()
    }

    pub fn state(&self, kind: RadioKind) -> HandleState {
        self.slot(kind).state.borrow().clone()
    }

    /// Current handle for `kind`, scanning the OS when the callback has not fired yet.
    pub fn handle(&self, kind: RadioKind) -> Option<NetworkHandle> {
        if let HandleState::Available(handle) = &*self.slot(kind).state.borrow() {
            return Some(handle.clone());
        }

        let other_id = self.state(kind.other()).handle().map(|h| h.id);
        let found = self
            .provider
            .scan()
            .into_iter()
            .find(|h| h.kind == kind && Some(h.id) != other_id);
        if let Some(handle) = &found {
            debug!(
                "Network: found {} network {} by scan",
                kind, handle.interface
            );
        }
        found
    }

    pub fn cellular_handle(&self) -> Option<NetworkHandle> {
        self.handle(RadioKind::Cellular)
    }

    pub fn wifi_handle(&self) -> Option<NetworkHandle> {
        self.handle(RadioKind::Wifi)
    }

    /// Waits until `kind` is attached, up to `timeout`.
    pub async fn wait_for_attachment(
        &self,
        kind: RadioKind,
        timeout: Duration,
    ) -> Option<NetworkHandle> {
        let mut rx = self.subscribe(kind);
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(HandleState::is_available)
                .await
                .ok()
                .and_then(|state| state.handle().cloned())
        })
        .await;
        waited.ok().flatten()
    }

    /// Binds `socket` to the radio; false means it stays on the default network.
    pub fn bind_socket_to(&self, kind: RadioKind, socket: &Socket) -> bool {
        let Some(handle) = self.handle(kind) else {
            debug!("Network: no {} network, using default route", kind);
            return false;
        };

        match self.provider.bind_socket(&handle, socket) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Network: failed to bind socket to {} ({}): {}",
                    kind, handle.interface, e
                );
                false
            }
        }
    }

    pub fn bind_socket_to_cellular(&self, socket: &Socket) -> bool {
        self.bind_socket_to(RadioKind::Cellular, socket)
    }

    /// Connects a TCP stream whose traffic leaves through cellular.
    pub async fn create_cellular_socket(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if !self.bind_socket_to_cellular(&socket) {
            debug!("Network: connecting to {} over default network", addr);
        }
        socket.set_nonblocking(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        socket.connect(addr).await
    }

    /// Resolves `target` over cellular DNS and connects within `timeout`.
    pub async fn connect_via_cellular(
        &self,
        target: &TargetAddr,
        timeout: Duration,
    ) -> Result<TcpStream, ProxyError> {
        let addr = self.resolve_target(target).await?;
        match tokio::time::timeout(timeout, self.create_cellular_socket(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::Io(e)),
            Err(_) => Err(ProxyError::Timeout),
        }
    }

    /// Unconnected datagram socket on cellular, for the address family of `peer`.
    pub fn create_cellular_udp_socket(&self, peer: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
        self.bind_socket_to_cellular(&socket);
        finish_udp_socket(socket, peer)
    }

    /// Datagram socket for the tunnel: pinned to a physical radio, never to the tunnel itself.
    ///
    /// Tries `preferred`, then the other radio, then the default network.
    pub fn create_protected_udp_socket(
        &self,
        preferred: RadioKind,
        peer: SocketAddr,
        buffer_bytes: usize,
    ) -> io::Result<(UdpSocket, Option<RadioKind>)> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;

        let radio = [preferred, preferred.other()]
            .into_iter()
            .find(|kind| self.bind_socket_to(*kind, &socket));
        if radio.is_none() {
            warn!("Network: tunnel socket not pinned to any radio");
        }

        if let Err(e) = socket.set_send_buffer_size(buffer_bytes) {
            debug!("Network: send buffer size not applied: {}", e);
        }
        if let Err(e) = socket.set_recv_buffer_size(buffer_bytes) {
            debug!("Network: receive buffer size not applied: {}", e);
        }

        Ok((finish_udp_socket(socket, peer)?, radio))
    }

    /// Resolves through the cellular DNS servers, falling back to system DNS.
    pub async fn resolve_dns_via_cellular(&self, host: &str) -> Result<Vec<IpAddr>, ProxyError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(handle) = self.cellular_handle() {
            if !handle.dns_servers.is_empty() {
                match self.resolvers.lookup(&handle, host).await {
                    Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                    Ok(_) => debug!("Network: cellular DNS returned nothing for {}", host),
                    Err(e) => warn!("Network: cellular DNS failed for {}: {}", host, e),
                }
            }
        }

        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ProxyError::dns(format!("{}: {}", host, e)))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            return Err(ProxyError::dns(format!("{}: no addresses", host)));
        }
        Ok(addrs)
    }

    /// Single socket address for `target`, preferring IPv4 results.
    pub async fn resolve_target(&self, target: &TargetAddr) -> Result<SocketAddr, ProxyError> {
        match target {
            TargetAddr::Socket(addr) => Ok(*addr),
            TargetAddr::Domain { host, port } => {
                let addrs = self.resolve_dns_via_cellular(host).await?;
                let ip = addrs
                    .iter()
                    .find(|ip| ip.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
                    .ok_or_else(|| ProxyError::dns(format!("{}: no addresses", host)))?;
                Ok(SocketAddr::new(ip, *port))
            }
        }
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let status = |kind: RadioKind| {
            let state = self.state(kind);
            RadioStatus {
                state: state.label(),
                interface: state.handle().map(|h| h.interface.clone()),
                address: state.handle().and_then(|h| h.local_addr),
            }
        };

        NetworkSnapshot {
            cellular: status(RadioKind::Cellular),
            wifi: status(RadioKind::Wifi),
        }
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        self.release_networks();
    }
}

fn apply_event(
    kind: RadioKind,
    own: &watch::Sender<HandleState>,
    other: &watch::Sender<HandleState>,
    event: NetworkEvent,
) {
    match event {
        NetworkEvent::Available(handle) | NetworkEvent::Changed(handle) => {
            if handle.kind != kind {
                warn!("Network: ignoring {} handle on {} slot", handle.kind, kind);
                return;
            }
            if other.borrow().handle().map(|h| h.id) == Some(handle.id) {
                warn!(
                    "Network: handle {} already live as {}, ignoring",
                    handle.id,
                    kind.other()
                );
                return;
            }
            info!(
                "Network: {} available on {} ({:?})",
                kind, handle.interface, handle.local_addr
            );
            own.send_replace(HandleState::Available(handle));
        }
        NetworkEvent::Lost(id) => {
            let current = own.borrow().handle().map(|h| h.id);
            if current == Some(id) {
                info!("Network: {} lost", kind);
                own.send_replace(HandleState::Lost);
            }
        }
    }
}

/// Ensures the socket has a local address, then hands it to tokio.
fn finish_udp_socket(socket: Socket, peer: SocketAddr) -> io::Result<UdpSocket> {
    let bound = socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .map(|addr| addr.port() != 0)
        .unwrap_or(false);

    if !bound {
        let any: IpAddr = match peer {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        socket.bind(&SockAddr::from(SocketAddr::new(any, 0)))?;
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn manager_with(provider: &Arc<ManualProvider>) -> NetworkManager {
        NetworkManager::new(provider.clone()).with_detach_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_acquire_publishes_available() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", Some("127.0.0.1".parse().unwrap()));
        let manager = manager_with(&provider);

        manager.acquire_networks();
        let handle = manager
            .wait_for_attachment(RadioKind::Cellular, Duration::from_secs(1))
            .await
            .expect("cellular should attach");
        assert_eq!(handle.interface, "rmnet0");
        assert_eq!(manager.state(RadioKind::Wifi), HandleState::Acquiring);
    }

    #[tokio::test]
    async fn test_acquire_then_release_leaves_no_registrations() {
        let provider = Arc::new(ManualProvider::new());
        let manager = manager_with(&provider);

        manager.acquire_networks();
        manager.acquire_networks();
        assert_eq!(provider.registration_count(), 2);

        manager.release_networks();
        assert_eq!(provider.registration_count(), 0);
        assert_eq!(manager.state(RadioKind::Cellular), HandleState::Unavailable);

        // releasing twice is harmless
        manager.release_networks();
    }

    #[tokio::test]
    async fn test_handles_are_distinct_per_radio() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", None);
        provider.announce(RadioKind::Wifi, "wlan0", None);
        let manager = manager_with(&provider);
        manager.acquire_networks();

        let cell = manager
            .wait_for_attachment(RadioKind::Cellular, Duration::from_secs(1))
            .await
            .unwrap();
        let wifi = manager
            .wait_for_attachment(RadioKind::Wifi, Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(cell.id, wifi.id);
        assert_ne!(cell.kind, wifi.kind);
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let (own, _) = watch::channel(HandleState::Unavailable);
        let shared = NetworkHandle {
            id: 7,
            kind: RadioKind::Cellular,
            interface: "wlan0".to_string(),
            local_addr: None,
            dns_servers: Vec::new(),
        };
        let (other, _) = watch::channel(HandleState::Available(NetworkHandle {
            kind: RadioKind::Wifi,
            ..shared.clone()
        }));

        apply_event(RadioKind::Cellular, &own, &other, NetworkEvent::Available(shared));
        assert_eq!(*own.borrow(), HandleState::Unavailable);
    }

    #[tokio::test]
    async fn test_scan_fallback_before_callback() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", None);
        let manager = manager_with(&provider);

        // nothing acquired yet, the scan still finds it
        let handle = manager.cellular_handle().expect("scan should find cellular");
        assert_eq!(handle.interface, "rmnet0");
        assert!(manager.wifi_handle().is_none());
    }

    #[tokio::test]
    async fn test_lost_event_updates_state() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Wifi, "wlan0", None);
        let manager = manager_with(&provider);
        manager.acquire_networks();
        manager
            .wait_for_attachment(RadioKind::Wifi, Duration::from_secs(1))
            .await
            .unwrap();

        let mut rx = manager.subscribe(RadioKind::Wifi);
        provider.withdraw(RadioKind::Wifi);
        let state = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|s| *s == HandleState::Lost),
        )
        .await;
        assert!(state.is_ok());
    }

    #[tokio::test]
    async fn test_bind_without_cellular_falls_back() {
        let provider = Arc::new(ManualProvider::new());
        let manager = manager_with(&provider);
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        assert!(!manager.bind_socket_to_cellular(&socket));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cellular_socket_uses_cellular_source() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", Some("127.0.0.2".parse().unwrap()));
        let manager = manager_with(&provider);
        manager.acquire_networks();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = manager.create_cellular_socket(addr);
        let (stream, accepted) = tokio::join!(connect, listener.accept());

        let stream = stream.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(peer.ip(), "127.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(stream.local_addr().unwrap().ip(), peer.ip());
    }

    #[tokio::test]
    async fn test_reconnect_cellular_reacquires() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", None);
        let manager = manager_with(&provider);
        manager.acquire_networks();
        manager
            .wait_for_attachment(RadioKind::Cellular, Duration::from_secs(1))
            .await
            .unwrap();

        manager.reconnect_cellular().await;
        assert_eq!(provider.registration_count(), 2);
        let handle = manager
            .wait_for_attachment(RadioKind::Cellular, Duration::from_secs(1))
            .await;
        assert!(handle.is_some());
    }

    #[tokio::test]
    async fn test_resolve_literal_and_localhost() {
        let provider = Arc::new(ManualProvider::new());
        let manager = manager_with(&provider);

        let addrs = manager.resolve_dns_via_cellular("10.1.2.3").await.unwrap();
        assert_eq!(addrs, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);

        let target = TargetAddr::Domain {
            host: "localhost".to_string(),
            port: 80,
        };
        let resolved = manager.resolve_target(&target).await.unwrap();
        assert!(resolved.ip().is_loopback());
        assert_eq!(resolved.port(), 80);
    }

    #[tokio::test]
    async fn test_protected_udp_socket_prefers_radio() {
        let provider = Arc::new(ManualProvider::new());
        provider.announce(RadioKind::Cellular, "rmnet0", Some("127.0.0.1".parse().unwrap()));
        let manager = manager_with(&provider);
        manager.acquire_networks();

        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (socket, radio) = manager
            .create_protected_udp_socket(RadioKind::Wifi, peer, 64 * 1024)
            .unwrap();
        // wifi is absent so the socket falls over to cellular
        assert_eq!(radio, Some(RadioKind::Cellular));
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
