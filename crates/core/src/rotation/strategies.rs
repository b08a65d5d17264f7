use super::{
    AttemptId, AttemptOutcome, RadioToggle, RotationContext, RotationError, RotationStrategy,
};
use async_trait::async_trait;
use mobileproxy_common::RadioKind;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Releases and reacquires the cellular network.
///
/// Cheap, but the carrier often hands back the same address; an unchanged
/// address counts as a failure so the chain moves on.
pub struct CellularReconnect;

#[async_trait]
impl RotationStrategy for CellularReconnect {
    fn name(&self) -> &str {
        "cellular-reconnect"
    }

    async fn rotate(&self, ctx: &RotationContext) -> AttemptOutcome {
        let network = ctx.network();
        let before = network.cellular_handle().and_then(|h| h.local_addr);

        network.reconnect_cellular().await;
        let Some(handle) = network
            .wait_for_attachment(RadioKind::Cellular, ctx.timings().reattach_timeout)
            .await
        else {
            warn!("Rotation: cellular did not reattach");
            return AttemptOutcome::Timeout;
        };

        match (before, handle.local_addr) {
            (Some(old), Some(new)) if old == new => {
                info!("Rotation: cellular address unchanged ({})", old);
                AttemptOutcome::Failed
            }
            (old, new) => {
                info!("Rotation: cellular address {:?} -> {:?}", old, new);
                AttemptOutcome::Success
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ToggleResult {
    Confirmed,
    TimedOut,
    Failed,
}

/// Airplane mode on, settle, airplane mode off, wait for cellular.
pub struct AirplaneToggle {
    toggle: Arc<dyn RadioToggle>,
}

impl AirplaneToggle {
    pub fn new(toggle: Arc<dyn RadioToggle>) -> Self {
        Self { toggle }
    }

    async fn set_airplane_mode(&self, ctx: &RotationContext, enable: bool) -> ToggleResult {
        let attempt = ctx.next_attempt_id();
        let mut confirmations = ctx.subscribe_confirmations();
        debug!(
            "Rotation: {} requesting airplane mode {} (attempt {})",
            self.toggle.name(),
            enable,
            attempt
        );

        let requested = tokio::time::timeout(ctx.timings().toggle_timeout, async {
            self.toggle
                .request_toggle(attempt, enable, ctx.confirmations())
                .await?;
            wait_confirmation(&mut confirmations, attempt).await
        })
        .await;

        match requested {
            Ok(Ok(state)) if state == enable => ToggleResult::Confirmed,
            Ok(Ok(state)) => {
                warn!(
                    "Rotation: {} reported airplane mode {} instead of {}",
                    self.toggle.name(),
                    state,
                    enable
                );
                ToggleResult::Failed
            }
            Ok(Err(e)) => {
                warn!("Rotation: {} failed: {}", self.toggle.name(), e);
                ToggleResult::Failed
            }
            Err(_) => {
                // the switch may have happened without a confirmation
                if self.toggle.airplane_mode_enabled().await == Some(enable) {
                    info!(
                        "Rotation: {} timed out but airplane mode is {}",
                        self.toggle.name(),
                        enable
                    );
                    ToggleResult::Confirmed
                } else {
                    warn!(
                        "Rotation: {} confirmation timed out (attempt {})",
                        self.toggle.name(),
                        attempt
                    );
                    ToggleResult::TimedOut
                }
            }
        }
    }
}

/// Waits for the confirmation tagged `attempt`; others are stale and dropped.
async fn wait_confirmation(
    confirmations: &mut broadcast::Receiver<super::ToggleConfirmation>,
    attempt: AttemptId,
) -> Result<bool, RotationError> {
    loop {
        match confirmations.recv().await {
            Ok(confirmation) if confirmation.attempt == attempt => {
                return Ok(confirmation.enabled)
            }
            Ok(stale) => debug!("Rotation: discarding confirmation for attempt {}", stale.attempt),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Rotation: confirmation channel lagged by {}", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(RotationError::Command(
                    "confirmation channel closed".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl RotationStrategy for AirplaneToggle {
    fn name(&self) -> &str {
        self.toggle.name()
    }

    fn is_available(&self) -> bool {
        self.toggle.is_available()
    }

    async fn rotate(&self, ctx: &RotationContext) -> AttemptOutcome {
        match self.set_airplane_mode(ctx, true).await {
            ToggleResult::Confirmed => {}
            ToggleResult::TimedOut => return AttemptOutcome::Timeout,
            ToggleResult::Failed => return AttemptOutcome::Failed,
        }

        tokio::time::sleep(ctx.timings().settle_delay).await;

        if self.set_airplane_mode(ctx, false).await != ToggleResult::Confirmed {
            // never leave the radio off
            tokio::time::sleep(ctx.timings().disable_retry_delay).await;
            if self.set_airplane_mode(ctx, false).await != ToggleResult::Confirmed {
                warn!("Rotation: {} could not disable airplane mode", self.toggle.name());
            }
            return AttemptOutcome::Failed;
        }

        if ctx
            .network()
            .wait_for_attachment(RadioKind::Cellular, ctx.timings().reattach_timeout)
            .await
            .is_none()
        {
            warn!("Rotation: cellular not back after {}", self.toggle.name());
        }
        AttemptOutcome::Success
    }
}
