/// SOCKS5 proxy server (RFC 1928)
///
/// NO-AUTH only. CONNECT relays over a cellular-bound socket; UDP ASSOCIATE
/// hands datagrams to the shared [`UdpRelay`], which listens on the same
/// port number as the TCP listener.

use super::relay::{relay_bidirectional, ProxySession, SessionPhase};
use super::udp::UdpRelay;
use super::{spawn_accept_loop, ProxyContext, ServerHandle};
use mobileproxy_common::{ProxyError, TargetAddr, TrafficSnapshot};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// SOCKS5 protocol constants
pub(crate) const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_REQUIRED: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const CONNECT_COMMAND: u8 = 0x01;
const UDP_ASSOCIATE_COMMAND: u8 = 0x03;

pub(crate) const IPV4_ADDRESS: u8 = 0x01;
pub(crate) const DOMAIN_NAME: u8 = 0x03;
pub(crate) const IPV6_ADDRESS: u8 = 0x04;

/// Reply codes
const SUCCESS: u8 = 0x00;
const GENERAL_FAILURE: u8 = 0x01;
const NETWORK_UNREACHABLE: u8 = 0x03;
const HOST_UNREACHABLE: u8 = 0x04;
const CONNECTION_REFUSED: u8 = 0x05;
const COMMAND_NOT_SUPPORTED: u8 = 0x07;
const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const UNSPECIFIED: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

struct Running {
    server: ServerHandle,
    relay: Arc<UdpRelay>,
}

/// SOCKS5 proxy server
pub struct Socks5ProxyServer {
    ctx: Arc<ProxyContext>,
    udp_idle_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl Socks5ProxyServer {
    pub fn new(ctx: Arc<ProxyContext>, udp_idle_timeout: Duration) -> Self {
        Self {
            ctx,
            udp_idle_timeout,
            running: Mutex::new(None),
        }
    }

    /// Binds TCP and UDP on `addr` and starts serving. Returns the bound address.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Ok(current.server.local_addr());
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let udp = UdpSocket::bind(local_addr).await?;
        let relay = UdpRelay::start(udp, self.ctx.clone(), self.udp_idle_timeout)?;

        let ctx = self.ctx.clone();
        let handler_relay = relay.clone();
        let server = spawn_accept_loop("SOCKS5", listener, move |stream, peer| {
            handle_client(stream, peer, ctx.clone(), handler_relay.clone())
        })?;

        *running = Some(Running { server, relay });
        Ok(local_addr)
    }

    /// Closes the listener, the UDP relay and every in-flight session.
    pub async fn stop(&self) {
        if let Some(current) = self.running.lock().await.take() {
            current.relay.shutdown();
            current.server.stop().await;
            info!("SOCKS5: stopped");
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.server.local_addr())
    }

    pub async fn udp_session_count(&self) -> usize {
        self.running
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.relay.session_count())
    }

    pub fn counters(&self) -> TrafficSnapshot {
        self.ctx.counters.snapshot()
    }
}

/// Handle a SOCKS5 client connection
async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    relay: Arc<UdpRelay>,
) -> Result<(), ProxyError> {
    let mut session = ProxySession::new("SOCKS5", ctx.next_session_id(), peer);

    // 1. Method negotiation
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {}",
            greeting[0]
        )));
    }

    let mut methods = vec![0u8; usize::from(greeting[1])];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH_REQUIRED) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(ProxyError::AuthenticationFailed(
            "no acceptable auth method".to_string(),
        ));
    }
    stream.write_all(&[SOCKS_VERSION, NO_AUTH_REQUIRED]).await?;

    // 2. Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ProxyError::protocol("invalid SOCKS version in request"));
    }

    let Some(target) = read_target(&mut stream, request[3]).await? else {
        send_reply(&mut stream, ADDRESS_TYPE_NOT_SUPPORTED, UNSPECIFIED).await?;
        return Err(ProxyError::protocol(format!(
            "unsupported address type {}",
            request[3]
        )));
    };

    match request[1] {
        CONNECT_COMMAND => connect(stream, target, &mut session, &ctx).await,
        UDP_ASSOCIATE_COMMAND => associate(stream, peer, target, &mut session, &relay).await,
        command => {
            send_reply(&mut stream, COMMAND_NOT_SUPPORTED, UNSPECIFIED).await?;
            Err(ProxyError::protocol(format!(
                "unsupported command {}",
                command
            )))
        }
    }
}

async fn connect(
    mut stream: TcpStream,
    target: TargetAddr,
    session: &mut ProxySession,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    debug!("SOCKS5: CONNECT {} (session {})", target, session.id);

    let upstream = match ctx
        .network
        .connect_via_cellular(&target, ctx.connect_timeout)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("SOCKS5: failed to connect to {}: {}", target, e);
            send_reply(&mut stream, reply_code(&e), UNSPECIFIED).await?;
            return Err(e);
        }
    };
    session.advance(SessionPhase::Connected);

    let bound = upstream.local_addr()?;
    send_reply(&mut stream, SUCCESS, bound).await?;

    session.advance(SessionPhase::Relaying);
    let result = relay_bidirectional(stream, upstream, &ctx.counters, ctx.idle_timeout).await;
    session.close(result.as_ref().ok().copied());
    result.map(|_| ()).map_err(ProxyError::from)
}

/// Keeps the association alive for as long as the control connection is open.
async fn associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    requested: TargetAddr,
    session: &mut ProxySession,
    relay: &Arc<UdpRelay>,
) -> Result<(), ProxyError> {
    // a nonzero DST.PORT pins the client's UDP source port
    let client_port = Some(requested.port()).filter(|port| *port != 0);
    let association = relay.associate(peer.ip(), client_port);

    let advertised = SocketAddr::new(stream.local_addr()?.ip(), relay.port());
    send_reply(&mut stream, SUCCESS, advertised).await?;
    debug!(
        "SOCKS5: UDP ASSOCIATE {} for {} via {}",
        association.id(),
        peer,
        advertised
    );
    session.advance(SessionPhase::Relaying);

    let mut buf = [0u8; 512];
    let result = loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) => break Err(ProxyError::from(e)),
            },
            _ = association.evicted() => {
                debug!("SOCKS5: UDP association {} idle, closing", association.id());
                break Ok(());
            }
        }
    };

    drop(association);
    session.close(None);
    result
}

/// Reads DST.ADDR and DST.PORT. `None` for an unknown address type.
async fn read_target<R: AsyncRead + Unpin>(
    stream: &mut R,
    address_type: u8,
) -> Result<Option<TargetAddr>, ProxyError> {
    let target = match address_type {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
        }
        DOMAIN_NAME => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; usize::from(len)];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::protocol("domain name is not UTF-8"))?;
            TargetAddr::from_host(&domain, port)
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
        }
        _ => return Ok(None),
    };
    Ok(Some(target))
}

/// Appends ATYP, address and port.
pub(crate) fn write_socket_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(IPV4_ADDRESS);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(IPV6_ADDRESS);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Send a SOCKS5 reply: VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
async fn send_reply(stream: &mut TcpStream, reply_code: u8, bound: SocketAddr) -> io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, reply_code, 0x00];
    write_socket_addr(&mut reply, bound);
    stream.write_all(&reply).await
}

fn reply_code(err: &ProxyError) -> u8 {
    match err {
        ProxyError::Timeout | ProxyError::Dns(_) => HOST_UNREACHABLE,
        ProxyError::Io(e) => match e.kind() {
            io::ErrorKind::ConnectionRefused => CONNECTION_REFUSED,
            io::ErrorKind::NetworkUnreachable => NETWORK_UNREACHABLE,
            io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => HOST_UNREACHABLE,
            _ => GENERAL_FAILURE,
        },
        _ => GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::udp::{build_udp_datagram, parse_udp_datagram};
    use mobileproxy_common::ProxyConfig;
    use mobileproxy_core::{ManualProvider, NetworkManager};

    async fn start_proxy(udp_idle: Duration) -> (Socks5ProxyServer, SocketAddr) {
        let network = Arc::new(NetworkManager::new(Arc::new(ManualProvider::new())));
        let ctx = Arc::new(ProxyContext::new(network, &ProxyConfig::default()));
        let server = Socks5ProxyServer::new(ctx, udp_idle);
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (server, addr)
    }

    async fn negotiate(proxy: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);
        client
    }

    /// Reads a reply and returns (REP, BND address).
    async fn read_reply(client: &mut TcpStream) -> (u8, SocketAddr) {
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], SOCKS_VERSION);
        let target = read_target(client, head[3]).await.unwrap().unwrap();
        match target {
            TargetAddr::Socket(addr) => (head[1], addr),
            other => panic!("unexpected bound address {}", other),
        }
    }

    fn connect_request(target: SocketAddr) -> Vec<u8> {
        let mut request = vec![0x05, CONNECT_COMMAND, 0x00];
        write_socket_addr(&mut request, target);
        request
    }

    #[tokio::test]
    async fn test_rejects_without_no_auth() {
        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
        assert_eq!(client.read(&mut choice).await.unwrap(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_by_domain_relays() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let mut client = negotiate(proxy).await;
        let mut request = vec![0x05, CONNECT_COMMAND, 0x00, DOMAIN_NAME, 9];
        request.extend_from_slice(b"localhost");
        request.extend_from_slice(&echo_port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let (code, bound) = read_reply(&mut client).await;
        assert_eq!(code, SUCCESS);
        assert!(bound.ip().is_loopback());
        assert_ne!(bound.port(), 0);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_by_ipv6_literal_relays() {
        // hosts without an IPv6 loopback cannot run this
        let Ok(echo) = TcpListener::bind("[::1]:0").await else {
            return;
        };
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let mut client = negotiate(proxy).await;
        let request = connect_request(echo_addr);
        assert_eq!(request[3], IPV6_ADDRESS);
        assert_eq!(request.len(), 4 + 16 + 2);
        client.write_all(&request).await.unwrap();

        let (code, bound) = read_reply(&mut client).await;
        assert_eq!(code, SUCCESS);
        assert!(bound.is_ipv6());
        assert!(bound.ip().is_loopback());

        client.write_all(b"six!").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"six!");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_refused_maps_reply_code() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let mut client = negotiate(proxy).await;
        client.write_all(&connect_request(closed_addr)).await.unwrap();

        let (code, _) = read_reply(&mut client).await;
        assert_eq!(code, CONNECTION_REFUSED);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_and_unknown_address_type_are_rejected() {
        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;

        let mut client = negotiate(proxy).await;
        client
            .write_all(&[0x05, 0x02, 0x00, IPV4_ADDRESS, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await.0, COMMAND_NOT_SUPPORTED);

        let mut client = negotiate(proxy).await;
        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();
        assert_eq!(read_reply(&mut client).await.0, ADDRESS_TYPE_NOT_SUPPORTED);
        server.stop().await;
    }

    #[test]
    fn test_reply_code_mapping() {
        let io_err = |kind| ProxyError::Io(io::Error::new(kind, "x"));
        assert_eq!(reply_code(&io_err(io::ErrorKind::ConnectionRefused)), CONNECTION_REFUSED);
        assert_eq!(reply_code(&io_err(io::ErrorKind::NetworkUnreachable)), NETWORK_UNREACHABLE);
        assert_eq!(reply_code(&ProxyError::Timeout), HOST_UNREACHABLE);
        assert_eq!(reply_code(&ProxyError::dns("nx")), HOST_UNREACHABLE);
        assert_eq!(reply_code(&io_err(io::ErrorKind::Other)), GENERAL_FAILURE);
    }

    async fn udp_associate(proxy: SocketAddr, client_udp: SocketAddr) -> (TcpStream, SocketAddr) {
        let mut control = negotiate(proxy).await;
        let mut request = vec![0x05, UDP_ASSOCIATE_COMMAND, 0x00];
        write_socket_addr(&mut request, client_udp);
        control.write_all(&request).await.unwrap();
        let (code, relay) = read_reply(&mut control).await;
        assert_eq!(code, SUCCESS);
        (control, relay)
    }

    #[tokio::test]
    async fn test_udp_associate_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (control, relay) = udp_associate(proxy, client.local_addr().unwrap()).await;
        assert_eq!(relay, proxy);

        client
            .send_to(&build_udp_datagram(echo_addr, b"dns query"), relay)
            .await
            .unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, relay);

        let (source, payload) = parse_udp_datagram(&buf[..n]).unwrap();
        assert_eq!(source, TargetAddr::Socket(echo_addr));
        assert_eq!(payload, b"dns query");
        assert_eq!(server.udp_session_count().await, 1);

        // closing the control connection ends the association
        drop(control);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.udp_session_count().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "session not evicted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_udp_associate_carries_large_datagrams() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (n, from) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let (server, proxy) = start_proxy(Duration::from_secs(60)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_control, relay) = udp_associate(proxy, client.local_addr().unwrap()).await;

        // header plus payload stays under the 65507-byte IPv4 limit
        let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
        client
            .send_to(&build_udp_datagram(echo_addr, &payload), relay)
            .await
            .unwrap();

        let mut buf = vec![0u8; 65535];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (source, echoed) = parse_udp_datagram(&buf[..n]).unwrap();
        assert_eq!(source, TargetAddr::Socket(echo_addr));
        assert_eq!(echoed.len(), payload.len());
        assert_eq!(echoed, &payload[..]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_idle_udp_session_closes_control_connection() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();

        let (server, proxy) = start_proxy(Duration::from_millis(100)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (mut control, relay) = udp_associate(proxy, client.local_addr().unwrap()).await;

        client
            .send_to(&build_udp_datagram(sink_addr, b"once"), relay)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let closed = tokio::time::timeout(Duration::from_secs(2), control.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(closed.unwrap_or(0), 0);
        assert_eq!(server.udp_session_count().await, 0);
        server.stop().await;
    }
}
