/// API Response types

use crate::proxy::ProxyCounters;
use mobileproxy_core::{NetworkSnapshot, RotationAttempt, RotationReport, TunnelState};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};

/// GET /api/status
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub device_id: Option<String>,
    pub version: &'static str,
    pub networks: NetworkSnapshot,
    pub proxy: ProxyStatus,
    pub tunnel: TunnelStatus,
    pub rotation: RotationStatus,
}

#[derive(Debug, Serialize)]
pub struct ProxyStatus {
    /// Whether both listeners are bound
    pub running: bool,
    pub http: Option<SocketAddr>,
    pub socks5: Option<SocketAddr>,
    pub counters: ProxyCounters,
}

#[derive(Debug, Serialize)]
pub struct TunnelStatus {
    pub enabled: bool,
    pub connected: bool,
    pub vpn_ip: Option<Ipv4Addr>,
    pub state: Option<TunnelState>,
}

#[derive(Debug, Serialize)]
pub struct RotationStatus {
    /// Strategy chain in the order it is tried
    pub strategies: Vec<String>,
    /// Most recent attempts, oldest first
    pub recent: Vec<RotationAttempt>,
}

/// POST /api/rotate
#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub success: bool,
    pub attempts: Vec<RotationAttempt>,
}

impl From<RotationReport> for RotateResponse {
    fn from(report: RotationReport) -> Self {
        Self {
            success: report.success,
            attempts: report.attempts,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
