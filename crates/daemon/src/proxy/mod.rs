/// Local proxy servers whose upstream traffic leaves over cellular
///
/// The HTTP proxy listens on `base_port + 0` and the SOCKS5 proxy (TCP and
/// its UDP relay) on `base_port + 1`.

mod http;
mod relay;
mod socks5;
mod udp;

pub use http::HttpProxyServer;
pub use relay::{relay_bidirectional, ProxySession, RelayStats, SessionPhase};
pub use socks5::Socks5ProxyServer;
pub use udp::{build_udp_datagram, parse_udp_datagram, Association, UdpHeaderError, UdpRelay};

use mobileproxy_common::{ProxyConfig, ProxyError, TrafficCounters, TrafficSnapshot};
use mobileproxy_core::NetworkManager;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// State shared by every session of one server
pub struct ProxyContext {
    pub network: Arc<NetworkManager>,
    pub counters: TrafficCounters,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    next_session: AtomicU64,
}

impl ProxyContext {
    pub fn new(network: Arc<NetworkManager>, config: &ProxyConfig) -> Self {
        Self {
            network,
            counters: TrafficCounters::new(),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// A running accept loop. Aborting it drops every session task with it.
pub(crate) struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Spawns the accept loop; each connection runs in its own task owned by the loop.
pub(crate) fn spawn_accept_loop<F, Fut>(
    protocol: &'static str,
    listener: TcpListener,
    handler: F,
) -> Result<ServerHandle, ProxyError>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ProxyError>> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!("{}: listening on {}", protocol, local_addr);

    let task = tokio::spawn(async move {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = handler(stream, peer);
                        sessions.spawn(async move {
                            if let Err(e) = session.await {
                                debug!("{}: session from {} ended: {}", protocol, peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("{}: accept failed: {}", protocol, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
    });

    Ok(ServerHandle { local_addr, task })
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyAddrs {
    pub http: SocketAddr,
    pub socks5: SocketAddr,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyCounters {
    pub http: TrafficSnapshot,
    pub socks5: TrafficSnapshot,
    pub total: TrafficSnapshot,
}

/// Runs both proxies off one base port
pub struct ProxyManager {
    config: ProxyConfig,
    http: HttpProxyServer,
    socks5: Socks5ProxyServer,
}

impl ProxyManager {
    pub fn new(network: Arc<NetworkManager>, config: ProxyConfig) -> Self {
        let http = HttpProxyServer::new(Arc::new(ProxyContext::new(network.clone(), &config)));
        let socks5 = Socks5ProxyServer::new(
            Arc::new(ProxyContext::new(network, &config)),
            config.udp_idle_timeout(),
        );
        Self {
            config,
            http,
            socks5,
        }
    }

    /// Starts both servers; a bind failure on either stops the other.
    pub async fn start(&self) -> Result<ProxyAddrs, ProxyError> {
        let http = self.http.start(self.config.http_addr()?).await?;
        let socks5 = match self.socks5.start(self.config.socks5_addr()?).await {
            Ok(addr) => addr,
            Err(e) => {
                self.http.stop().await;
                return Err(e);
            }
        };
        Ok(ProxyAddrs { http, socks5 })
    }

    pub async fn stop(&self) {
        self.http.stop().await;
        self.socks5.stop().await;
        info!("Proxy: stopped");
    }

    pub async fn addrs(&self) -> Option<ProxyAddrs> {
        Some(ProxyAddrs {
            http: self.http.local_addr().await?,
            socks5: self.socks5.local_addr().await?,
        })
    }

    pub fn counters(&self) -> ProxyCounters {
        let http = self.http.counters();
        let socks5 = self.socks5.counters();
        ProxyCounters {
            http,
            socks5,
            total: http + socks5,
        }
    }
}
