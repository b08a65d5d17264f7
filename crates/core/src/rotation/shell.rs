//! Radio toggle backed by external commands
//!
//! Each configured command is an argv vector, e.g.
//! `["settings", "put", "global", "airplane_mode_on", "1"]`. When a query
//! command is set, its output is polled until it reports the requested
//! state; otherwise a zero exit status is taken as confirmation.

use super::{AttemptId, RadioToggle, RotationError, ToggleConfirmation};
use async_trait::async_trait;
use mobileproxy_common::ToggleCommandConfig;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::debug;

const QUERY_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ShellToggle {
    config: ToggleCommandConfig,
}

impl ShellToggle {
    pub fn new(config: ToggleCommandConfig) -> Self {
        Self { config }
    }

    async fn run(argv: &[String]) -> Result<String, RotationError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RotationError::Command("empty command".to_string()))?;

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RotationError::Command(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query(&self) -> Option<bool> {
        let argv = self.config.query.as_ref()?;
        match Self::run(argv).await {
            Ok(output) => parse_state(&output),
            Err(e) => {
                debug!("Rotation: {} query failed: {}", self.config.name, e);
                None
            }
        }
    }
}

/// Accepts `1`/`0`, `true`/`false`, `on`/`off`, `enabled`/`disabled`.
fn parse_state(output: &str) -> Option<bool> {
    match output.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "enabled" => Some(true),
        "0" | "false" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl RadioToggle for ShellToggle {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_available(&self) -> bool {
        !self.config.enable.is_empty() && !self.config.disable.is_empty()
    }

    async fn request_toggle(
        &self,
        attempt: AttemptId,
        enable: bool,
        confirmations: broadcast::Sender<ToggleConfirmation>,
    ) -> Result<(), RotationError> {
        let argv = if enable {
            &self.config.enable
        } else {
            &self.config.disable
        };
        Self::run(argv).await?;

        // the caller's timeout bounds this loop
        if self.config.query.is_some() {
            while self.query().await != Some(enable) {
                tokio::time::sleep(QUERY_POLL_INTERVAL).await;
            }
        }

        let _ = confirmations.send(ToggleConfirmation {
            attempt,
            enabled: enable,
        });
        Ok(())
    }

    async fn airplane_mode_enabled(&self) -> Option<bool> {
        self.query().await
    }
}
