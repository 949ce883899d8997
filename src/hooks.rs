//! Outcome listeners
//!
//! Every day that reaches a terminal outcome is reported exactly once to the
//! registered listeners: a log line always, and optionally a shell command
//! (a sound, a notification, a healthcheck ping).

use crate::config::HooksConfig;
use crate::controller::{DeliveryReport, Outcome};
use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Receives the outcome signal for each completed day
pub trait OutcomeListener: Send + Sync {
    fn on_delivery_outcome(&self, report: &DeliveryReport);
}

/// Logs one line per day
#[derive(Debug, Default)]
pub struct LogListener;

impl OutcomeListener for LogListener {
    fn on_delivery_outcome(&self, report: &DeliveryReport) {
        match &report.outcome {
            Outcome::Sent => info!(
                "Daily message for {} delivered after {} attempt(s)",
                report.date, report.attempts
            ),
            Outcome::FailedFinal(reason) => error!(
                "Daily message for {} not delivered after {} attempt(s): {}",
                report.date, report.attempts, reason
            ),
        }
    }
}

/// Runs the configured shell command for the day's outcome
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    on_sent: Option<String>,
    on_failed: Option<String>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CommandHook {
    pub fn new(config: &HooksConfig) -> Self {
        Self {
            on_sent: config.on_sent.clone(),
            on_failed: config.on_failed.clone(),
            pending: Arc::default(),
        }
    }

    /// Wait for hooks started by [`OutcomeListener::on_delivery_outcome`]
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_sent.is_none() && self.on_failed.is_none()
    }

    fn command_for(&self, outcome: &Outcome) -> Option<&str> {
        match outcome {
            Outcome::Sent => self.on_sent.as_deref(),
            Outcome::FailedFinal(_) => self.on_failed.as_deref(),
        }
    }

    /// Run the hook for `report` and wait for it
    pub async fn run(&self, report: &DeliveryReport) -> Result<()> {
        let Some(script) = self.command_for(&report.outcome) else {
            return Ok(());
        };

        let status = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("DISPATCH_DATE", report.date.to_string())
            .env("DISPATCH_OUTCOME", report.outcome.to_string())
            .env("DISPATCH_ATTEMPTS", report.attempts.to_string())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::CommandFailed(format!("hook '{}': {}", script, e)))?;

        if !status.success() {
            return Err(Error::CommandFailed(format!(
                "hook '{}' exited with {}",
                script, status
            )));
        }
        Ok(())
    }
}

impl OutcomeListener for CommandHook {
    fn on_delivery_outcome(&self, report: &DeliveryReport) {
        if self.command_for(&report.outcome).is_none() {
            return;
        }
        let hook = self.clone();
        let report = report.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = hook.run(&report).await {
                warn!("Outcome hook failed: {}", e);
            }
        });
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }
}

/// Fan a report out to several listeners
pub fn notify_all(listeners: &[Arc<dyn OutcomeListener>], report: &DeliveryReport) {
    for listener in listeners {
        listener.on_delivery_outcome(report);
    }
}
