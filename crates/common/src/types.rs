use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::DomainError;

/// Physical radio a network handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioKind {
    Cellular,
    Wifi,
}

impl RadioKind {
    pub const ALL: [RadioKind; 2] = [RadioKind::Cellular, RadioKind::Wifi];

    pub fn other(&self) -> RadioKind {
        match self {
            Self::Cellular => Self::Wifi,
            Self::Wifi => Self::Cellular,
        }
    }
}

impl std::fmt::Display for RadioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cellular => write!(f, "cellular"),
            Self::Wifi => write!(f, "wifi"),
        }
    }
}

/// Destination requested by a proxy client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
    /// Literal IP + port
    Socket(SocketAddr),
    /// Domain name + port, resolved over cellular DNS
    Domain { host: String, port: u16 },
}

impl TargetAddr {
    /// Builds a target from a host string, turning IP literals into socket addresses.
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Self::Socket(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain {
                host: trimmed.to_string(),
                port,
            },
        }
    }

    /// Parses `host:port`, `[v6]:port` or a bare host (which gets `default_port`).
    pub fn parse_authority(authority: &str, default_port: u16) -> Result<Self, DomainError> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(DomainError::InvalidTarget("empty authority".to_string()));
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| DomainError::InvalidTarget(authority.to_string()))?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => default_port,
                tail => parse_port(tail.strip_prefix(':').unwrap_or(tail))?,
            };
            let ip = host
                .parse::<IpAddr>()
                .map_err(|_| DomainError::InvalidTarget(authority.to_string()))?;
            return Ok(Self::Socket(SocketAddr::new(ip, port)));
        }

        // A bare IPv6 literal has several colons and no port
        if authority.matches(':').count() > 1 {
            let ip = authority
                .parse::<IpAddr>()
                .map_err(|_| DomainError::InvalidTarget(authority.to_string()))?;
            return Ok(Self::Socket(SocketAddr::new(ip, default_port)));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::from_host(host, parse_port(port)?)),
            Some(_) => Err(DomainError::InvalidTarget(authority.to_string())),
            None => Ok(Self::from_host(authority, default_port)),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(addr) => addr.port(),
            Self::Domain { port, .. } => *port,
        }
    }
}

fn parse_port(s: &str) -> Result<u16, DomainError> {
    s.parse::<u16>()
        .map_err(|_| DomainError::InvalidPort(s.to_string()))
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Domain { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Byte counters shared by every relay task of one proxy server.
///
/// `bytes_out` counts client → target, `bytes_in` counts target → client.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in(),
            bytes_out: self.bytes_out(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl std::ops::Add for TrafficSnapshot {
    type Output = TrafficSnapshot;

    fn add(self, other: TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in + other.bytes_in,
            bytes_out: self.bytes_out + other.bytes_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_authority_parsing() {
        assert_eq!(
            TargetAddr::parse_authority("example.com:8443", 443).unwrap(),
            TargetAddr::Domain {
                host: "example.com".to_string(),
                port: 8443
            }
        );
        assert_eq!(
            TargetAddr::parse_authority("example.com", 443).unwrap().port(),
            443
        );
        assert_eq!(
            TargetAddr::parse_authority("10.0.0.1:80", 443).unwrap(),
            TargetAddr::Socket("10.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse_authority("[::1]:8080", 443).unwrap(),
            TargetAddr::Socket("[::1]:8080".parse().unwrap())
        );
        assert_eq!(
            TargetAddr::parse_authority("[2001:db8::1]", 443).unwrap().port(),
            443
        );
    }

    #[test]
    fn test_authority_rejects_bad_input() {
        assert!(TargetAddr::parse_authority("", 80).is_err());
        assert!(TargetAddr::parse_authority(":80", 80).is_err());
        assert!(matches!(
            TargetAddr::parse_authority("host:99999", 80),
            Err(DomainError::InvalidPort(_))
        ));
        assert!(TargetAddr::parse_authority("[::1", 80).is_err());
    }

    #[test]
    fn test_target_display() {
        let v6 = TargetAddr::from_host("::1", 53);
        assert_eq!(v6.to_string(), "[::1]:53");
        let domain = TargetAddr::from_host("example.com", 443);
        assert_eq!(domain.to_string(), "example.com:443");
    }

    #[test]
    fn test_counters_accumulate_across_threads() {
        let counters = Arc::new(TrafficCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.add_in(2);
                        counters.add_out(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.bytes_in, 8000);
        assert_eq!(snapshot.bytes_out, 4000);
    }

    #[test]
    fn test_radio_kind_other() {
        assert_eq!(RadioKind::Cellular.other(), RadioKind::Wifi);
        assert_eq!(RadioKind::Wifi.to_string(), "wifi");
    }
}
