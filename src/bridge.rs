//! Transport over an external bridge executable
//!
//! The bridge owns pairing, credentials and the wire protocol. We drive it
//! with three subcommands:
//!
//! - `status` - exit 0 when the session is open, exit 2 when logged out
//! - `groups` - JSON array of `{"id": ..., "subject": ...}`
//! - `send <id> <text>` - send one message

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::session::{GroupInfo, Transport, TransportEvent};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exit code the bridge uses for revoked credentials
pub const EXIT_LOGGED_OUT: i32 = 2;

/// Session status as reported by `bridge status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    Open,
    LoggedOut(String),
    Closed(String),
}

#[derive(Debug, Deserialize)]
struct BridgeGroup {
    id: String,
    subject: String,
}

/// Program plus fixed leading arguments
#[derive(Debug, Clone)]
struct BridgeCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl BridgeCommand {
    async fn run(&self, subcommand: &[&str]) -> Result<Output> {
        Command::new(&self.program)
            .args(&self.args)
            .args(subcommand)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::CommandFailed(format!("{} {}: {}", self.program.display(), subcommand[0], e))
            })
    }

    async fn status(&self) -> Result<BridgeStatus> {
        let output = self.run(&["status"]).await?;
        let detail = describe_failure(&output);

        Ok(match output.status.code() {
            Some(0) => BridgeStatus::Open,
            Some(EXIT_LOGGED_OUT) => BridgeStatus::LoggedOut(detail),
            _ => BridgeStatus::Closed(detail),
        })
    }

    async fn groups(&self) -> Result<Vec<GroupInfo>> {
        let output = self.run(&["groups"]).await?;
        check_exit(&output, "groups")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let groups: Vec<BridgeGroup> = serde_json::from_str(&stdout)
            .map_err(|e| Error::CommandFailed(format!("groups JSON: {}", e)))?;

        Ok(groups
            .into_iter()
            .map(|g| GroupInfo {
                address: g.id,
                name: g.subject,
            })
            .collect())
    }

    async fn send(&self, address: &str, text: &str) -> Result<()> {
        let output = self.run(&["send", address, text]).await?;
        check_exit(&output, "send")
    }
}

fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    match output.status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn check_exit(output: &Output, subcommand: &str) -> Result<()> {
    match output.status.code() {
        Some(0) => Ok(()),
        Some(EXIT_LOGGED_OUT) => Err(Error::Auth(describe_failure(output))),
        _ => Err(Error::Send(format!(
            "{}: {}",
            subcommand,
            describe_failure(output)
        ))),
    }
}

/// [`Transport`] backed by a bridge executable
pub struct CommandTransport {
    command: BridgeCommand,
    keepalive: Duration,
    watcher: Mutex<Option<CancellationToken>>,
}

impl CommandTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: BridgeCommand {
                program: config.command.clone(),
                args: config.args.clone(),
            },
            keepalive: Duration::from_secs(config.keepalive_seconds.max(1)),
            watcher: Mutex::new(None),
        }
    }

    /// One-off status check
    pub async fn status(&self) -> Result<BridgeStatus> {
        self.command.status().await
    }

    /// Replace the keepalive watcher, cancelling the previous connection's
    fn install_watcher(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

impl Drop for CommandTransport {
    fn drop(&mut self) {
        if let Ok(guard) = self.watcher.lock() {
            if let Some(token) = guard.as_ref() {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn open(&self, generation: u64, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let token = self.install_watcher();

        let initial = self.command.status().await?;
        if let BridgeStatus::LoggedOut(reason) = initial {
            token.cancel();
            return Err(Error::Auth(reason));
        }

        tokio::spawn(watch_connection(
            self.command.clone(),
            self.keepalive,
            generation,
            initial,
            events,
            token,
        ));
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        self.command.groups().await
    }

    async fn send_text(&self, address: &str, text: &str) -> Result<()> {
        self.command.send(address, text).await
    }
}

/// Poll `status` and report transitions for one connection generation.
///
/// Ends after reporting a close; the session decides whether to reconnect.
async fn watch_connection(
    command: BridgeCommand,
    keepalive: Duration,
    generation: u64,
    mut status: BridgeStatus,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut open = false;
    loop {
        let event = match status {
            BridgeStatus::Open if !open => {
                open = true;
                Some(TransportEvent::opened(generation))
            }
            BridgeStatus::Open => None,
            BridgeStatus::LoggedOut(reason) => {
                let _ = events.send(TransportEvent::logged_out(generation, reason)).await;
                return;
            }
            BridgeStatus::Closed(reason) => {
                let _ = events.send(TransportEvent::closed(generation, reason)).await;
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Keepalive watcher for connection {} stopped", generation);
                return;
            }
            _ = tokio::time::sleep(keepalive) => {}
        }

        status = command
            .status()
            .await
            .unwrap_or_else(|e| BridgeStatus::Closed(e.to_string()));
    }
}
