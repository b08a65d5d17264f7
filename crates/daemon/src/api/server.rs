/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

/// API Server for exposing device status and triggering rotations
pub struct ApiServer {
    listen_addr: SocketAddr,
    state: AppState,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, state: AppState) -> Self {
        Self { listen_addr, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/status", get(get_status))
            .route("/api/rotate", post(post_rotate))
            // the controller may poll from a browser context
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Serves until the task is aborted.
    pub async fn start(self) -> Result<()> {
        let app = self.router();

        info!("API server starting on {}", self.listen_addr);
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
