/// API request handlers

use super::responses::*;
use crate::proxy::ProxyManager;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mobileproxy_common::DeviceId;
use mobileproxy_core::{IpRotationManager, NetworkManager, RotationError, VpnTunnelManager};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub device_id: Option<DeviceId>,
    pub network: Arc<NetworkManager>,
    pub proxies: Arc<ProxyManager>,
    pub tunnel: Option<Arc<VpnTunnelManager>>,
    pub rotation: Arc<IpRotationManager>,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    debug!("API: GET /api/status");

    let addrs = state.proxies.addrs().await;
    let tunnel = match &state.tunnel {
        Some(tunnel) => TunnelStatus {
            enabled: true,
            connected: tunnel.is_connected(),
            vpn_ip: tunnel.vpn_ip(),
            state: Some(tunnel.state()),
        },
        None => TunnelStatus {
            enabled: false,
            connected: false,
            vpn_ip: None,
            state: None,
        },
    };

    Ok(Json(StatusResponse {
        device_id: state.device_id.map(|id| id.to_string()),
        version: env!("CARGO_PKG_VERSION"),
        networks: state.network.snapshot(),
        proxy: ProxyStatus {
            running: addrs.is_some(),
            http: addrs.map(|a| a.http),
            socks5: addrs.map(|a| a.socks5),
            counters: state.proxies.counters(),
        },
        tunnel,
        rotation: RotationStatus {
            strategies: state.rotation.strategy_names(),
            recent: state.rotation.history(),
        },
    }))
}

/// Handler for POST /api/rotate
pub async fn post_rotate(State(state): State<AppState>) -> Result<Json<RotateResponse>, AppError> {
    info!("API: POST /api/rotate");

    let report = state.rotation.rotate().await?;
    Ok(Json(report.into()))
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {}", self.message);
        } else {
            debug!("API: {} {}", self.status_code, self.message);
        }

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));

        (self.status_code, body).into_response()
    }
}

impl From<RotationError> for AppError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::InProgress => AppError::conflict(err.to_string()),
            other => AppError::internal(other.to_string()),
        }
    }
}
