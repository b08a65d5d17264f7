/// SOCKS5 UDP relay
///
/// One socket serves every association. A datagram from an unknown source is
/// matched against pending associations by client IP (and port, when the
/// client announced one); after that the source address owns a session with
/// its own cellular-bound target sockets.

use super::socks5::{write_socket_addr, DOMAIN_NAME, IPV4_ADDRESS, IPV6_ADDRESS};
use super::ProxyContext;
use dashmap::DashMap;
use mobileproxy_common::config::socks::{UDP_BUFFER_SIZE, UDP_SWEEP_INTERVAL_SECS};
use mobileproxy_common::TargetAddr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UdpHeaderError {
    #[error("datagram too short")]
    TooShort,

    #[error("fragmented datagram (FRAG {0})")]
    Fragmented(u8),

    #[error("unsupported address type {0}")]
    UnknownAddressType(u8),

    #[error("domain name is not UTF-8")]
    InvalidDomain,
}

/// Splits `RSV RSV FRAG ATYP DST.ADDR DST.PORT DATA` into target and payload.
pub fn parse_udp_datagram(datagram: &[u8]) -> Result<(TargetAddr, &[u8]), UdpHeaderError> {
    if datagram.len() < 4 {
        return Err(UdpHeaderError::TooShort);
    }
    if datagram[2] != 0 {
        return Err(UdpHeaderError::Fragmented(datagram[2]));
    }

    let rest = &datagram[4..];
    let (target, consumed) = match datagram[3] {
        IPV4_ADDRESS => {
            let addr: [u8; 4] = take(rest, 0)?;
            let port = u16::from_be_bytes(take(rest, 4)?);
            (
                TargetAddr::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port)),
                6,
            )
        }
        IPV6_ADDRESS => {
            let addr: [u8; 16] = take(rest, 0)?;
            let port = u16::from_be_bytes(take(rest, 16)?);
            (
                TargetAddr::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port)),
                18,
            )
        }
        DOMAIN_NAME => {
            let len = usize::from(*rest.first().ok_or(UdpHeaderError::TooShort)?);
            let host = rest.get(1..1 + len).ok_or(UdpHeaderError::TooShort)?;
            let host = std::str::from_utf8(host).map_err(|_| UdpHeaderError::InvalidDomain)?;
            let port = u16::from_be_bytes(take(rest, 1 + len)?);
            (TargetAddr::from_host(host, port), 1 + len + 2)
        }
        other => return Err(UdpHeaderError::UnknownAddressType(other)),
    };

    Ok((target, &rest[consumed..]))
}

fn take<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], UdpHeaderError> {
    buf.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(UdpHeaderError::TooShort)
}

/// Wraps a reply from `source` for the client.
pub fn build_udp_datagram(source: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(payload.len() + 22);
    datagram.extend_from_slice(&[0x00, 0x00, 0x00]);
    write_socket_addr(&mut datagram, canonical_addr(source));
    datagram.extend_from_slice(payload);
    datagram
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(canonical_ip(addr.ip()), addr.port())
}

type AssociationId = u64;

struct PendingAssociation {
    id: AssociationId,
    client_ip: IpAddr,
    client_port: Option<u16>,
}

/// Lives as long as the client's control connection
pub struct Association {
    id: AssociationId,
    relay: Weak<UdpRelay>,
    evicted: Arc<Notify>,
}

impl Association {
    pub fn id(&self) -> AssociationId {
        self.id
    }

    /// Resolves once the relay has dropped this association's session for inactivity.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.release(self.id);
        }
    }
}

struct UdpSession {
    association: AssociationId,
    client: SocketAddr,
    last_activity: Mutex<Instant>,
    ipv4: OnceCell<Arc<UdpSocket>>,
    ipv6: OnceCell<Arc<UdpSocket>>,
    reply_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpSession {
    fn new(association: AssociationId, client: SocketAddr) -> Self {
        Self {
            association,
            client,
            last_activity: Mutex::new(Instant::now()),
            ipv4: OnceCell::new(),
            ipv6: OnceCell::new(),
            reply_tasks: Mutex::new(Vec::new()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    /// Target socket for the family of `target`, created on first use.
    async fn target_socket(
        self: &Arc<Self>,
        target: SocketAddr,
        relay_socket: &Arc<UdpSocket>,
        ctx: &Arc<ProxyContext>,
    ) -> io::Result<Arc<UdpSocket>> {
        let cell = if target.is_ipv4() {
            &self.ipv4
        } else {
            &self.ipv6
        };

        cell.get_or_try_init(|| async {
            let socket = Arc::new(ctx.network.create_cellular_udp_socket(target)?);
            let task = tokio::spawn(reply_loop(
                socket.clone(),
                relay_socket.clone(),
                Arc::downgrade(self),
                ctx.clone(),
            ));
            self.reply_tasks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(task);
            Ok::<_, io::Error>(socket)
        })
        .await
        .cloned()
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        let tasks = self.reply_tasks.get_mut().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Target → client direction of one session
async fn reply_loop(
    target_socket: Arc<UdpSocket>,
    relay_socket: Arc<UdpSocket>,
    session: Weak<UdpSession>,
    ctx: Arc<ProxyContext>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let (n, from) = match target_socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("SOCKS5: UDP target socket error: {}", e);
                continue;
            }
        };
        let Some(session) = session.upgrade() else {
            break;
        };

        session.touch();
        let datagram = build_udp_datagram(from, &buf[..n]);
        match relay_socket.send_to(&datagram, session.client).await {
            Ok(_) => ctx.counters.add_in(n as u64),
            Err(e) => debug!("SOCKS5: UDP reply to {} failed: {}", session.client, e),
        }
    }
}

/// The shared relay socket and its sessions
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    idle_timeout: Duration,
    sessions: DashMap<SocketAddr, Arc<UdpSession>>,
    pending: Mutex<Vec<PendingAssociation>>,
    evictions: DashMap<AssociationId, Arc<Notify>>,
    next_association: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpRelay {
    /// Takes ownership of a bound socket and starts the receive loop and the idle sweeper.
    pub fn start(
        socket: UdpSocket,
        ctx: Arc<ProxyContext>,
        idle_timeout: Duration,
    ) -> io::Result<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let relay = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            ctx,
            idle_timeout,
            sessions: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            evictions: DashMap::new(),
            next_association: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });

        let receiver = tokio::spawn(receive_loop(socket, Arc::downgrade(&relay)));
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&relay), idle_timeout));
        relay
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([receiver, sweeper]);

        debug!("SOCKS5: UDP relay on {}", local_addr);
        Ok(relay)
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers an association for datagrams from `client_ip` (and `client_port` if known).
    pub fn associate(self: &Arc<Self>, client_ip: IpAddr, client_port: Option<u16>) -> Association {
        let id = self.next_association.fetch_add(1, Ordering::Relaxed);
        let evicted = Arc::new(Notify::new());
        self.evictions.insert(id, evicted.clone());
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(PendingAssociation {
                id,
                client_ip: canonical_ip(client_ip),
                client_port,
            });

        Association {
            id,
            relay: Arc::downgrade(self),
            evicted,
        }
    }

    fn release(&self, id: AssociationId) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|p| p.id != id);
        self.sessions.retain(|_, session| session.association != id);
        self.evictions.remove(&id);
        debug!("SOCKS5: UDP association {} released", id);
    }

    /// Stops the relay tasks and wakes every control connection.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.sessions.clear();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        for entry in self.evictions.iter() {
            entry.value().notify_one();
        }
    }

    /// Binds an unknown source to the best pending association: exact port first, then any.
    fn claim(&self, source: SocketAddr) -> Option<AssociationId> {
        let ip = canonical_ip(source.ip());
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let position = pending
            .iter()
            .position(|p| p.client_ip == ip && p.client_port == Some(source.port()))
            .or_else(|| {
                pending
                    .iter()
                    .position(|p| p.client_ip == ip && p.client_port.is_none())
            })?;
        Some(pending.remove(position).id)
    }

    fn session_for(&self, source: SocketAddr) -> Option<Arc<UdpSession>> {
        if let Some(session) = self.sessions.get(&source).map(|s| s.value().clone()) {
            return Some(session);
        }

        let association = self.claim(source)?;
        let session = Arc::new(UdpSession::new(association, source));
        self.sessions.insert(source, session.clone());
        debug!(
            "SOCKS5: UDP session for {} (association {})",
            source, association
        );
        Some(session)
    }

    async fn dispatch(self: &Arc<Self>, datagram: &[u8], source: SocketAddr) {
        let Some(session) = self.session_for(source) else {
            debug!("SOCKS5: dropping datagram from unassociated {}", source);
            return;
        };

        let (target, payload) = match parse_udp_datagram(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("SOCKS5: dropping datagram from {}: {}", source, e);
                return;
            }
        };
        session.touch();

        match target {
            TargetAddr::Socket(addr) => self.forward(&session, addr, payload).await,
            TargetAddr::Domain { .. } => {
                let relay = self.clone();
                let payload = payload.to_vec();
                tokio::spawn(async move {
                    match relay.ctx.network.resolve_target(&target).await {
                        Ok(addr) => relay.forward(&session, addr, &payload).await,
                        Err(e) => debug!("SOCKS5: UDP target {} unresolved: {}", target, e),
                    }
                });
            }
        }
    }

    async fn forward(&self, session: &Arc<UdpSession>, target: SocketAddr, payload: &[u8]) {
        let socket = match session.target_socket(target, &self.socket, &self.ctx).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("SOCKS5: no UDP socket for {}: {}", target, e);
                return;
            }
        };

        match socket.send_to(payload, target).await {
            Ok(n) => self.ctx.counters.add_out(n as u64),
            Err(e) => debug!("SOCKS5: UDP send to {} failed: {}", target, e),
        }
    }

    /// Drops sessions idle past the timeout and signals their control connections.
    fn sweep(&self) {
        let expired: Vec<(SocketAddr, AssociationId)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.idle_timeout)
            .map(|entry| (*entry.key(), entry.value().association))
            .collect();

        for (source, association) in expired {
            self.sessions.remove(&source);
            if let Some(evicted) = self.evictions.get(&association) {
                evicted.value().notify_one();
            }
            debug!("SOCKS5: UDP session for {} idle, evicted", source);
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, relay: Weak<UdpRelay>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let (n, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("SOCKS5: UDP relay receive error: {}", e);
                continue;
            }
        };
        let Some(relay) = relay.upgrade() else {
            break;
        };
        relay.dispatch(&buf[..n], source).await;
    }
}

async fn sweep_loop(relay: Weak<UdpRelay>, idle_timeout: Duration) {
    let every = Duration::from_secs(UDP_SWEEP_INTERVAL_SECS)
        .min(idle_timeout)
        .max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let Some(relay) = relay.upgrade() else {
            break;
        };
        relay.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobileproxy_common::ProxyConfig;
    use mobileproxy_core::{ManualProvider, NetworkManager};

    #[test]
    fn test_parse_ipv4_datagram() {
        let datagram = [0, 0, 0, 1, 8, 8, 8, 8, 0, 53, b'q', b'?'];
        let (target, payload) = parse_udp_datagram(&datagram).unwrap();
        assert_eq!(target, TargetAddr::Socket("8.8.8.8:53".parse().unwrap()));
        assert_eq!(payload, b"q?");
    }

    #[test]
    fn test_parse_domain_datagram() {
        let mut datagram = vec![0, 0, 0, 3, 11];
        datagram.extend_from_slice(b"example.com");
        datagram.extend_from_slice(&443u16.to_be_bytes());
        datagram.extend_from_slice(b"quic");

        let (target, payload) = parse_udp_datagram(&datagram).unwrap();
        assert_eq!(
            target,
            TargetAddr::Domain {
                host: "example.com".to_string(),
                port: 443
            }
        );
        assert_eq!(payload, b"quic");
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        assert_eq!(parse_udp_datagram(&[0, 0]), Err(UdpHeaderError::TooShort));
        assert_eq!(
            parse_udp_datagram(&[0, 0, 1, 1, 1, 2, 3, 4, 0, 53]),
            Err(UdpHeaderError::Fragmented(1))
        );
        assert_eq!(
            parse_udp_datagram(&[0, 0, 0, 7, 1, 2]),
            Err(UdpHeaderError::UnknownAddressType(7))
        );
        assert_eq!(
            parse_udp_datagram(&[0, 0, 0, 1, 1, 2, 3]),
            Err(UdpHeaderError::TooShort)
        );
        assert_eq!(
            parse_udp_datagram(&[0, 0, 0, 3, 9, b'a']),
            Err(UdpHeaderError::TooShort)
        );
    }

    #[test]
    fn test_build_unmaps_ipv4_sources() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:5353".parse().unwrap();
        let datagram = build_udp_datagram(mapped, b"x");
        assert_eq!(datagram, [0, 0, 0, 1, 10, 0, 0, 1, 0x14, 0xE9, b'x']);

        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let wire = build_udp_datagram(v6, b"y");
        let (source, payload) = parse_udp_datagram(&wire).unwrap();
        assert_eq!(source, TargetAddr::Socket(v6));
        assert_eq!(payload, b"y");
    }

    async fn relay() -> Arc<UdpRelay> {
        let network = Arc::new(NetworkManager::new(Arc::new(ManualProvider::new())));
        let ctx = Arc::new(ProxyContext::new(network, &ProxyConfig::default()));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        UdpRelay::start(socket, ctx, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_claim_prefers_exact_port() {
        let relay = relay().await;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let wildcard = relay.associate(ip, None);
        let pinned = relay.associate(ip, Some(4000));

        assert_eq!(relay.claim("127.0.0.1:4000".parse().unwrap()), Some(pinned.id()));
        assert_eq!(relay.claim("127.0.0.1:4001".parse().unwrap()), Some(wildcard.id()));
        assert_eq!(relay.claim("127.0.0.1:4002".parse().unwrap()), None);
        assert_eq!(relay.claim("10.0.0.9:4000".parse().unwrap()), None);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_dropping_association_releases_session() {
        let relay = relay().await;
        let association = relay.associate("127.0.0.1".parse().unwrap(), None);
        let source: SocketAddr = "127.0.0.1:4500".parse().unwrap();

        assert!(relay.session_for(source).is_some());
        assert_eq!(relay.session_count(), 1);

        drop(association);
        assert_eq!(relay.session_count(), 0);
        assert!(relay.session_for(source).is_none());
        relay.shutdown();
    }
}
