//! VPN tunnel manager
//!
//! Authenticates to the tunnel server over UDP, brings up the virtual
//! interface with the assigned address, and moves packets both ways. A
//! connection runs four loops (tun→udp, udp→tun, keepalive, watchdog) that
//! are torn down together; the supervisor then reconnects with backoff until
//! `disconnect()` clears the run flag.

use super::backoff::Backoff;
use super::device::{InterfaceFactory, VirtualInterface};
use super::frame::{check_packet, ClientFrame, FrameError, ServerFrame};
use crate::network::NetworkManager;
use mobileproxy_common::config::tunnel as consts;
use mobileproxy_common::{DeviceId, ProxyError, RadioKind, TargetAddr, TunnelConfig};
use serde::Serialize;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65535;

/// Lifecycle of the tunnel connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    New,
    Authenticating,
    Connected { ip: Ipv4Addr },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Closed,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot resolve tunnel server: {0}")]
    Resolve(String),
    #[error("authentication rejected by server")]
    AuthRejected,
    #[error("no AUTH_OK within {0:?}")]
    AuthTimeout(Duration),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no PONG for {0:?}")]
    PongTimeout(Duration),
    #[error("virtual interface unavailable: {0}")]
    Interface(io::Error),
    #[error("tunnel stopped")]
    Stopped,
}

impl TunnelError {
    /// Failures that a retry cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interface(_))
    }
}

/// Resolved tunnel parameters
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub server: TargetAddr,
    pub device_id: DeviceId,
    pub egress: RadioKind,
    pub mtu: u16,
    pub keepalive_interval: Duration,
    pub pong_timeout: Duration,
    pub auth_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub socket_buffer: usize,
}

impl TunnelSettings {
    pub fn new(server: TargetAddr, device_id: DeviceId) -> Self {
        Self {
            server,
            device_id,
            egress: RadioKind::Wifi,
            mtu: consts::MTU,
            keepalive_interval: Duration::from_millis(consts::KEEPALIVE_INTERVAL_MS),
            pong_timeout: Duration::from_millis(consts::PONG_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(consts::AUTH_TIMEOUT_MS),
            reconnect_base: Duration::from_millis(consts::RECONNECT_BASE_MS),
            reconnect_max: Duration::from_millis(consts::RECONNECT_MAX_MS),
            socket_buffer: consts::SOCKET_BUFFER_BYTES,
        }
    }

    pub fn from_config(config: &TunnelConfig, device_id: DeviceId) -> Result<Self, ProxyError> {
        let server = TargetAddr::parse_authority(&config.server, 0)?;
        if server.port() == 0 {
            return Err(ProxyError::config(format!(
                "tunnel.server '{}' needs a port",
                config.server
            )));
        }

        Ok(Self {
            egress: config.egress.into(),
            mtu: config.mtu,
            keepalive_interval: config.keepalive_interval(),
            pong_timeout: config.pong_timeout(),
            auth_timeout: config.auth_timeout(),
            reconnect_base: config.reconnect_base(),
            reconnect_max: config.reconnect_max(),
            ..Self::new(server, device_id)
        })
    }
}

struct Shared {
    settings: TunnelSettings,
    network: Arc<NetworkManager>,
    interfaces: Arc<dyn InterfaceFactory>,
    should_run: AtomicBool,
    /// Bumped by every connect and disconnect; a connect only installs its
    /// supervisor if nothing else happened while it was establishing.
    generation: AtomicU64,
    state: watch::Sender<TunnelState>,
}

impl Shared {
    fn should_run(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, state: TunnelState) {
        self.state.send_replace(state);
    }
}

/// An authenticated connection with its interface
struct Connection {
    socket: Arc<UdpSocket>,
    device: Box<dyn VirtualInterface>,
    ip: Ipv4Addr,
}

pub struct VpnTunnelManager {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VpnTunnelManager {
    pub fn new(
        settings: TunnelSettings,
        network: Arc<NetworkManager>,
        interfaces: Arc<dyn InterfaceFactory>,
    ) -> Self {
        let (state, _) = watch::channel(TunnelState::New);
        Self {
            shared: Arc::new(Shared {
                settings,
                network,
                interfaces,
                should_run: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state,
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts the tunnel and keeps it up until `disconnect()`.
    ///
    /// Only a virtual interface failure on the first attempt is returned;
    /// network and auth failures are retried in the background.
    pub async fn connect(&self) -> Result<(), ProxyError> {
        if self.shared.should_run.swap(true, Ordering::SeqCst) {
            debug!("Tunnel: already running");
            return Ok(());
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!("Tunnel: connecting to {}", self.shared.settings.server);
        let first = match establish(&self.shared).await {
            Ok(conn) => Some(conn),
            Err(e) if e.is_fatal() => {
                let _supervisor = self.supervisor.lock().await;
                if self.shared.is_current(generation) {
                    self.shared.should_run.store(false, Ordering::SeqCst);
                    self.shared.publish(TunnelState::Closed);
                }
                return Err(ProxyError::tunnel(e.to_string()));
            }
            Err(e) => {
                warn!("Tunnel: initial connect failed: {}", e);
                None
            }
        };

        let mut supervisor = self.supervisor.lock().await;
        if !self.shared.should_run() || !self.shared.is_current(generation) {
            // superseded by disconnect() or a newer connect(); dropping `first` closes it
            debug!("Tunnel: connect attempt {} superseded", generation);
            return Ok(());
        }
        if let Some(stale) = supervisor.take() {
            stale.abort();
        }

        let backoff = Backoff::new(
            self.shared.settings.reconnect_base,
            self.shared.settings.reconnect_max,
        );
        *supervisor = Some(tokio::spawn(supervise(self.shared.clone(), first, backoff)));
        Ok(())
    }

    /// Stops the tunnel. Idempotent, safe during an in-progress connect.
    pub async fn disconnect(&self) {
        let was_running = self.shared.should_run.swap(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.shared.publish(TunnelState::Closed);
        if was_running {
            info!("Tunnel: disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state.borrow(), TunnelState::Connected { .. })
    }

    pub fn vpn_ip(&self) -> Option<Ipv4Addr> {
        match *self.shared.state.borrow() {
            TunnelState::Connected { ip } => Some(ip),
            _ => None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.shared.state.subscribe()
    }
}

impl Drop for VpnTunnelManager {
    fn drop(&mut self) {
        self.shared.should_run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

/// Socket, AUTH handshake, then the virtual interface.
async fn establish(shared: &Shared) -> Result<Connection, TunnelError> {
    let settings = &shared.settings;
    shared.publish(TunnelState::Authenticating);

    let server = shared
        .network
        .resolve_target(&settings.server)
        .await
        .map_err(|e| TunnelError::Resolve(e.to_string()))?;

    let (socket, radio) =
        shared
            .network
            .create_protected_udp_socket(settings.egress, server, settings.socket_buffer)?;
    socket.connect(server).await?;
    debug!("Tunnel: socket to {} via {:?}", server, radio);

    socket
        .send(&ClientFrame::Auth(settings.device_id).encode())
        .await?;

    let ip = tokio::time::timeout(settings.auth_timeout, await_auth(&socket))
        .await
        .map_err(|_| TunnelError::AuthTimeout(settings.auth_timeout))??;
    info!("Tunnel: authenticated, assigned {}", ip);

    let device = shared
        .interfaces
        .create(ip, consts::PREFIX_LEN, settings.mtu)
        .await
        .map_err(TunnelError::Interface)?;

    Ok(Connection {
        socket: Arc::new(socket),
        device,
        ip,
    })
}

async fn await_auth(socket: &UdpSocket) -> Result<Ipv4Addr, TunnelError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = socket.recv(&mut buf).await?;
        match ServerFrame::decode(&buf[..n]) {
            Ok(ServerFrame::AuthOk(ip)) => return Ok(ip),
            Ok(ServerFrame::AuthFail) => return Err(TunnelError::AuthRejected),
            Ok(other) => debug!("Tunnel: ignoring {:?} before auth", other),
            Err(FrameError::InvalidAddress) => return Err(TunnelError::AuthRejected),
            Err(e) => debug!("Tunnel: ignoring frame before auth: {}", e),
        }
    }
}

async fn supervise(shared: Arc<Shared>, first: Option<Connection>, mut backoff: Backoff) {
    let mut next = first;

    loop {
        if let Some(conn) = next.take() {
            if !shared.should_run() {
                break;
            }
            backoff.reset();
            shared.publish(TunnelState::Connected { ip: conn.ip });

            let reason = run_connection(&shared, conn).await;
            if !shared.should_run() {
                break;
            }
            warn!("Tunnel: connection lost: {}", reason);
        }

        if !shared.should_run() {
            break;
        }
        let delay = backoff.next_delay();
        shared.publish(TunnelState::Reconnecting {
            attempt: backoff.attempts(),
            delay_ms: delay.as_millis() as u64,
        });
        info!(
            "Tunnel: reconnecting in {:?} (attempt {})",
            delay,
            backoff.attempts()
        );
        tokio::time::sleep(delay).await;
        if !shared.should_run() {
            break;
        }

        match establish(&shared).await {
            Ok(conn) => next = Some(conn),
            Err(e) => warn!("Tunnel: reconnect failed: {}", e),
        }
    }

    shared.publish(TunnelState::Closed);
}

/// Runs the four loops until the first one ends, then cancels the rest.
async fn run_connection(shared: &Arc<Shared>, conn: Connection) -> TunnelError {
    let settings = &shared.settings;
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let (reader, writer) = tokio::io::split(conn.device);

    let mut loops = JoinSet::new();
    loops.spawn(tun_to_udp(reader, conn.socket.clone(), usize::from(settings.mtu)));
    loops.spawn(udp_to_tun(conn.socket.clone(), writer, last_pong.clone()));
    loops.spawn(keepalive(
        conn.socket.clone(),
        settings.keepalive_interval,
        shared.clone(),
    ));
    loops.spawn(watchdog(
        last_pong,
        settings.pong_timeout,
        settings.keepalive_interval.min(settings.pong_timeout),
    ));

    let reason = match loops.join_next().await {
        Some(Ok(Err(e))) => e,
        Some(Ok(Ok(()))) => TunnelError::Stopped,
        Some(Err(e)) => TunnelError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())),
        None => TunnelError::Stopped,
    };

    loops.abort_all();
    while loops.join_next().await.is_some() {}
    reason
}

async fn tun_to_udp(
    mut device: ReadHalf<Box<dyn VirtualInterface>>,
    socket: Arc<UdpSocket>,
    mtu: usize,
) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = device.read(&mut buf).await?;
        if n == 0 {
            return Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "virtual interface closed",
            )));
        }
        let packet = &buf[..n];
        if let Err(e) = check_packet(packet, mtu) {
            debug!("Tunnel: dropping outbound packet: {}", e);
            continue;
        }
        socket.send(&ClientFrame::Data(packet).encode()).await?;
    }
}

async fn udp_to_tun(
    socket: Arc<UdpSocket>,
    mut device: WriteHalf<Box<dyn VirtualInterface>>,
    last_pong: Arc<Mutex<Instant>>,
) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = socket.recv(&mut buf).await?;
        match ServerFrame::decode(&buf[..n]) {
            Ok(ServerFrame::Data(packet)) if !packet.is_empty() => {
                device.write_all(packet).await?;
            }
            Ok(ServerFrame::Pong) => {
                *last_pong.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
            }
            Ok(other) => debug!("Tunnel: ignoring {:?}", other),
            Err(e) => debug!("Tunnel: ignoring frame: {}", e),
        }
    }
}

async fn keepalive(
    socket: Arc<UdpSocket>,
    interval: Duration,
    shared: Arc<Shared>,
) -> Result<(), TunnelError> {
    let ping = ClientFrame::Ping.encode();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        if !shared.should_run() {
            return Ok(());
        }
        socket.send(&ping).await?;
    }
}

async fn watchdog(
    last_pong: Arc<Mutex<Instant>>,
    timeout: Duration,
    check_every: Duration,
) -> Result<(), TunnelError> {
    loop {
        tokio::time::sleep(check_every).await;
        let silent = last_pong.lock().unwrap_or_else(|p| p.into_inner()).elapsed();
        if silent > timeout {
            return Err(TunnelError::PongTimeout(silent));
        }
    }
}
