/// Byte relay shared by the HTTP and SOCKS5 proxies

use mobileproxy_common::config::proxy::BUFFER_SIZE;
use mobileproxy_common::TrafficCounters;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    Connected,
    Relaying,
    Closed,
}

/// One accepted client connection
#[derive(Debug)]
pub struct ProxySession {
    pub id: u64,
    pub peer: SocketAddr,
    protocol: &'static str,
    phase: SessionPhase,
    started: Instant,
}

impl ProxySession {
    pub fn new(protocol: &'static str, id: u64, peer: SocketAddr) -> Self {
        debug!("{}: session {} from {}", protocol, id, peer);
        Self {
            id,
            peer,
            protocol,
            phase: SessionPhase::Handshaking,
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn advance(&mut self, phase: SessionPhase) {
        debug!(
            "{}: session {} {:?} -> {:?}",
            self.protocol, self.id, self.phase, phase
        );
        self.phase = phase;
    }

    pub fn close(&mut self, stats: Option<RelayStats>) {
        self.phase = SessionPhase::Closed;
        match stats {
            Some(stats) => debug!(
                "{}: session {} closed after {:?} ({} bytes out, {} bytes in)",
                self.protocol,
                self.id,
                self.started.elapsed(),
                stats.to_upstream,
                stats.to_client
            ),
            None => debug!("{}: session {} closed", self.protocol, self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_upstream: u64,
    pub to_client: u64,
}

/// Copies both directions until both reach EOF, either side errors, or the
/// session has been silent for `idle_timeout`.
///
/// EOF on one side shuts down the write half of the other.
pub async fn relay_bidirectional(
    client: TcpStream,
    upstream: TcpStream,
    counters: &TrafficCounters,
    idle_timeout: Duration,
) -> io::Result<RelayStats> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let last_activity = Mutex::new(Instant::now());

    let outbound = copy_direction(
        &mut client_read,
        &mut upstream_write,
        &last_activity,
        idle_timeout,
        |n| counters.add_out(n),
    );
    let inbound = copy_direction(
        &mut upstream_read,
        &mut client_write,
        &last_activity,
        idle_timeout,
        |n| counters.add_in(n),
    );

    let (to_upstream, to_client) = tokio::try_join!(outbound, inbound)?;
    Ok(RelayStats {
        to_upstream,
        to_client,
    })
}

async fn copy_direction<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    last_activity: &Mutex<Instant>,
    idle_timeout: Duration,
    count: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                let silent = last_activity
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .elapsed();
                if silent >= idle_timeout {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle"));
                }
                // the other direction is still moving
                continue;
            }
        };

        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        count(n as u64);
        *last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_preserves_bytes_and_half_close() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let counters = TrafficCounters::new();

        let relay = relay_bidirectional(
            client_side,
            upstream_side,
            &counters,
            Duration::from_secs(5),
        );
        let peers = async {
            client.write_all(b"ping from client").await.unwrap();
            client.shutdown().await.unwrap();

            let mut request = Vec::new();
            upstream.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"ping from client");

            // the client's half-close still lets the reply through
            upstream.write_all(b"reply").await.unwrap();
            upstream.shutdown().await.unwrap();

            let mut reply = Vec::new();
            client.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, b"reply");
        };

        let (stats, ()) = tokio::join!(relay, peers);
        let stats = stats.unwrap();
        assert_eq!(stats.to_upstream, 16);
        assert_eq!(stats.to_client, 5);
        assert_eq!(counters.bytes_out(), 16);
        assert_eq!(counters.bytes_in(), 5);
    }

    #[tokio::test]
    async fn test_idle_session_times_out() {
        let (_client, client_side) = pair().await;
        let (upstream_side, _upstream) = pair().await;
        let counters = TrafficCounters::new();

        let err = relay_bidirectional(
            client_side,
            upstream_side,
            &counters,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_session_phases() {
        let mut session = ProxySession::new("HTTP", 1, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(session.phase(), SessionPhase::Handshaking);
        session.advance(SessionPhase::Connected);
        session.advance(SessionPhase::Relaying);
        session.close(Some(RelayStats::default()));
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}
