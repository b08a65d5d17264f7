//! IP rotation
//!
//! An ordered chain of strategies is tried once per `rotate()` call until one
//! reports success. Radio toggles are driven through the [`RadioToggle`]
//! capability and confirmed on a broadcast channel keyed by attempt id, so a
//! confirmation that arrives after its timeout cannot satisfy a later wait.

mod shell;
mod strategies;

pub use shell::ShellToggle;
pub use strategies::{AirplaneToggle, CellularReconnect};

use crate::network::NetworkManager;
use async_trait::async_trait;
use mobileproxy_common::config::rotation as consts;
use mobileproxy_common::RotationConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub type AttemptId = u64;

/// Published by a toggle once the radio reached the requested state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleConfirmation {
    pub attempt: AttemptId,
    pub enabled: bool,
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("a rotation is already in progress")]
    InProgress,

    #[error("toggle command failed: {0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Timeout,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationAttempt {
    pub id: AttemptId,
    pub strategy: String,
    /// Unix seconds
    pub started_at: u64,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub success: bool,
    pub attempts: Vec<RotationAttempt>,
}

/// External capability that switches airplane mode.
#[async_trait]
pub trait RadioToggle: Send + Sync {
    fn name(&self) -> &str;

    /// False lets the orchestrator skip this toggle without waiting.
    fn is_available(&self) -> bool;

    /// Requests the switch. Confirmation is published on `confirmations`
    /// tagged with `attempt`, possibly after this call returns.
    async fn request_toggle(
        &self,
        attempt: AttemptId,
        enable: bool,
        confirmations: broadcast::Sender<ToggleConfirmation>,
    ) -> Result<(), RotationError>;

    /// Current airplane mode state, when the toggle can tell.
    async fn airplane_mode_enabled(&self) -> Option<bool> {
        None
    }
}

/// One way of changing the public IP
#[async_trait]
pub trait RotationStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    async fn rotate(&self, ctx: &RotationContext) -> AttemptOutcome;
}

#[derive(Debug, Clone)]
pub struct RotationTimings {
    pub toggle_timeout: Duration,
    pub settle_delay: Duration,
    pub reattach_timeout: Duration,
    pub disable_retry_delay: Duration,
}

impl Default for RotationTimings {
    fn default() -> Self {
        Self {
            toggle_timeout: Duration::from_millis(consts::TOGGLE_TIMEOUT_MS),
            settle_delay: Duration::from_millis(consts::SETTLE_DELAY_MS),
            reattach_timeout: Duration::from_millis(consts::REATTACH_TIMEOUT_MS),
            disable_retry_delay: Duration::from_millis(consts::DISABLE_RETRY_DELAY_MS),
        }
    }
}

impl From<&RotationConfig> for RotationTimings {
    fn from(config: &RotationConfig) -> Self {
        Self {
            toggle_timeout: config.toggle_timeout(),
            settle_delay: config.settle_delay(),
            reattach_timeout: config.reattach_timeout(),
            disable_retry_delay: config.disable_retry_delay(),
        }
    }
}

/// What a strategy gets to work with
pub struct RotationContext {
    network: Arc<NetworkManager>,
    timings: RotationTimings,
    next_attempt: AtomicU64,
    confirmations: broadcast::Sender<ToggleConfirmation>,
}

impl RotationContext {
    pub fn new(network: Arc<NetworkManager>, timings: RotationTimings) -> Self {
        let (confirmations, _) = broadcast::channel(16);
        Self {
            network,
            timings,
            next_attempt: AtomicU64::new(1),
            confirmations,
        }
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    pub fn timings(&self) -> &RotationTimings {
        &self.timings
    }

    /// Monotonically increasing, shared by rotation attempts and toggle requests.
    pub fn next_attempt_id(&self) -> AttemptId {
        self.next_attempt.fetch_add(1, Ordering::Relaxed)
    }

    pub fn confirmations(&self) -> broadcast::Sender<ToggleConfirmation> {
        self.confirmations.clone()
    }

    pub fn subscribe_confirmations(&self) -> broadcast::Receiver<ToggleConfirmation> {
        self.confirmations.subscribe()
    }
}

pub struct IpRotationManager {
    ctx: RotationContext,
    strategies: Vec<Arc<dyn RotationStrategy>>,
    history: Mutex<VecDeque<RotationAttempt>>,
    running: tokio::sync::Mutex<()>,
}

impl IpRotationManager {
    /// Empty chain; add strategies with [`with_strategy`](Self::with_strategy).
    pub fn new(network: Arc<NetworkManager>, timings: RotationTimings) -> Self {
        Self {
            ctx: RotationContext::new(network, timings),
            strategies: Vec::new(),
            history: Mutex::new(VecDeque::with_capacity(consts::HISTORY_LEN)),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Cellular reconnect first, then one airplane toggle per configured command set.
    pub fn from_config(network: Arc<NetworkManager>, config: &RotationConfig) -> Self {
        let mut manager =
            Self::new(network, RotationTimings::from(config)).with_strategy(Arc::new(CellularReconnect));
        for toggle in &config.toggles {
            manager = manager.with_strategy(Arc::new(AirplaneToggle::new(Arc::new(
                ShellToggle::new(toggle.clone()),
            ))));
        }
        manager
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RotationStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn context(&self) -> &RotationContext {
        &self.ctx
    }

    /// Tries each available strategy once, in order, stopping at the first success.
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| RotationError::InProgress)?;

        info!("Rotation: starting");
        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            if !strategy.is_available() {
                debug!("Rotation: skipping unavailable strategy {}", strategy.name());
                continue;
            }

            let id = self.ctx.next_attempt_id();
            let started_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let started = Instant::now();
            info!("Rotation: attempt {} via {}", id, strategy.name());

            let outcome = strategy.rotate(&self.ctx).await;
            let attempt = RotationAttempt {
                id,
                strategy: strategy.name().to_string(),
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                outcome,
            };
            self.record(attempt.clone());
            attempts.push(attempt);

            if outcome == AttemptOutcome::Success {
                info!("Rotation: {} succeeded", strategy.name());
                return Ok(RotationReport {
                    success: true,
                    attempts,
                });
            }
            warn!("Rotation: {} ended with {:?}", strategy.name(), outcome);
        }

        warn!("Rotation: all strategies exhausted");
        Ok(RotationReport {
            success: false,
            attempts,
        })
    }

    /// Rotates every `every` until the task is aborted.
    pub async fn run_periodic(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            match self.rotate().await {
                Ok(report) if report.success => {}
                Ok(_) => warn!("Rotation: scheduled rotation failed"),
                Err(e) => debug!("Rotation: scheduled rotation skipped: {}", e),
            }
        }
    }

    fn record(&self, attempt: RotationAttempt) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.len() == consts::HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(attempt);
    }

    /// Recent attempts, oldest first.
    pub fn history(&self) -> Vec<RotationAttempt> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
