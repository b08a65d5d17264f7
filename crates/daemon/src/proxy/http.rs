/// HTTP proxy server
///
/// `CONNECT host:port` opens a cellular-bound tunnel; any other method is
/// forwarded as plain HTTP with the request target rewritten to origin form.

use super::relay::{relay_bidirectional, ProxySession, SessionPhase};
use super::{spawn_accept_loop, ProxyContext, ServerHandle};
use mobileproxy_common::config::proxy::MAX_HEADER_BYTES;
use mobileproxy_common::{ProxyError, TargetAddr, TrafficSnapshot};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// HTTP proxy server
pub struct HttpProxyServer {
    ctx: Arc<ProxyContext>,
    running: Mutex<Option<ServerHandle>>,
}

impl HttpProxyServer {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self {
            ctx,
            running: Mutex::new(None),
        }
    }

    /// Binds `addr` and starts accepting. Returns the bound address.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.local_addr());
        }

        let listener = TcpListener::bind(addr).await?;
        let ctx = self.ctx.clone();
        let server = spawn_accept_loop("HTTP", listener, move |stream, peer| {
            handle_client(stream, peer, ctx.clone())
        })?;

        let local_addr = server.local_addr();
        *running = Some(server);
        Ok(local_addr)
    }

    /// Closes the listener and every in-flight session.
    pub async fn stop(&self) {
        if let Some(server) = self.running.lock().await.take() {
            server.stop().await;
            info!("HTTP: stopped");
        }
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.local_addr())
    }

    pub fn counters(&self) -> TrafficSnapshot {
        self.ctx.counters.snapshot()
    }
}

#[derive(Debug)]
enum HeadError {
    /// Client went away before sending anything
    Closed,
    TooLarge,
    Malformed(String),
    Io(io::Error),
}

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(lines: &[String]) -> Result<Self, HeadError> {
        let (request_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| HeadError::Malformed("empty request".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HeadError::Malformed(format!(
                "bad request line: {}",
                request_line
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(HeadError::Malformed(format!("bad version: {}", version)));
        }

        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HeadError::Malformed(format!("bad header: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Upstream target and origin-form path of a plain HTTP request.
    fn upstream(&self) -> Result<(TargetAddr, String), ProxyError> {
        let lower = self.target.to_ascii_lowercase();
        let (rest, default_port) = if lower.starts_with("http://") {
            (&self.target["http://".len()..], 80)
        } else if lower.starts_with("https://") {
            (&self.target["https://".len()..], 443)
        } else {
            let host = self
                .header("Host")
                .ok_or_else(|| ProxyError::protocol("no absolute URI and no Host header"))?;
            let target = TargetAddr::parse_authority(host, 80)?;
            return Ok((target, self.target.clone()));
        };

        let (authority, path) = match rest.find(|c: char| c == '/' || c == '?') {
            Some(i) if rest[i..].starts_with('/') => (&rest[..i], rest[i..].to_string()),
            Some(i) => (&rest[..i], format!("/{}", &rest[i..])),
            None => (rest, "/".to_string()),
        };
        // drop userinfo
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let target = TargetAddr::parse_authority(authority, default_port)?;
        Ok((target, path))
    }

    /// Request head as sent to the origin server.
    fn to_origin(&self, path: &str) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Proxy-Connection")
                || name.eq_ignore_ascii_case("Proxy-Authorization")
            {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Reads the request line and headers, up to `MAX_HEADER_BYTES`.
async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<String>, HeadError> {
    let mut lines = Vec::new();
    let mut total = 0usize;

    loop {
        let mut line = String::new();
        let remaining = (MAX_HEADER_BYTES - total) as u64;
        let n = (&mut *reader)
            .take(remaining)
            .read_line(&mut line)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => HeadError::Malformed("non UTF-8 header".to_string()),
                _ => HeadError::Io(e),
            })?;

        if n == 0 {
            return Err(match (lines.is_empty(), total >= MAX_HEADER_BYTES) {
                (_, true) => HeadError::TooLarge,
                (true, false) => HeadError::Closed,
                (false, false) => HeadError::Malformed("truncated header".to_string()),
            });
        }
        total += n;
        if !line.ends_with('\n') {
            return Err(if total >= MAX_HEADER_BYTES {
                HeadError::TooLarge
            } else {
                HeadError::Malformed("truncated header".to_string())
            });
        }

        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        if line.is_empty() {
            if lines.is_empty() {
                // tolerate stray CRLF before the request line
                continue;
            }
            return Ok(lines);
        }
        lines.push(line.to_string());
    }
}

async fn send_status(stream: &mut TcpStream, code: u16, reason: &str) -> io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Handle an HTTP proxy client connection
async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    let mut session = ProxySession::new("HTTP", ctx.next_session_id(), peer);
    let mut reader = BufReader::new(stream);

    let request = match read_head(&mut reader).await.and_then(|l| RequestHead::parse(&l)) {
        Ok(request) => request,
        Err(HeadError::Closed) => {
            session.close(None);
            return Ok(());
        }
        Err(HeadError::Io(e)) => return Err(e.into()),
        Err(HeadError::TooLarge) => {
            let _ = send_status(reader.get_mut(), 431, "Request Header Fields Too Large").await;
            return Err(ProxyError::protocol("request header too large"));
        }
        Err(HeadError::Malformed(reason)) => {
            let _ = send_status(reader.get_mut(), 400, "Bad Request").await;
            return Err(ProxyError::protocol(reason));
        }
    };

    let (target, origin_head) = if request.is_connect() {
        match TargetAddr::parse_authority(&request.target, 443) {
            Ok(target) => (target, None),
            Err(e) => {
                let _ = send_status(reader.get_mut(), 400, "Bad Request").await;
                return Err(e.into());
            }
        }
    } else {
        match request.upstream() {
            Ok((target, path)) => (target, Some(request.to_origin(&path))),
            Err(e) => {
                let _ = send_status(reader.get_mut(), 400, "Bad Request").await;
                return Err(e);
            }
        }
    };
    debug!("HTTP: {} {} (session {})", request.method, target, session.id);

    let mut upstream = match ctx
        .network
        .connect_via_cellular(&target, ctx.connect_timeout)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("HTTP: failed to connect to {}: {}", target, e);
            let _ = send_status(reader.get_mut(), 502, "Bad Gateway").await;
            return Err(e);
        }
    };
    session.advance(SessionPhase::Connected);

    match origin_head {
        None => {
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await?;
        }
        Some(head) => {
            upstream.write_all(&head).await?;
            ctx.counters.add_out(head.len() as u64);
        }
    }

    // bytes the client sent behind the header block
    let pipelined = reader.buffer().to_vec();
    let client = reader.into_inner();
    if !pipelined.is_empty() {
        upstream.write_all(&pipelined).await?;
        ctx.counters.add_out(pipelined.len() as u64);
    }

    session.advance(SessionPhase::Relaying);
    let result = relay_bidirectional(client, upstream, &ctx.counters, ctx.idle_timeout).await;
    session.close(result.as_ref().ok().copied());
    result.map(|_| ()).map_err(ProxyError::from)
}
