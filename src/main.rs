//! Daily Dispatch daemon
//!
//! CLI for running the dispatcher and inspecting its configuration and state.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use daily_dispatch::bridge::{BridgeStatus, CommandTransport};
use daily_dispatch::config::{Config, DEFAULT_CONFIG_FILE};
use daily_dispatch::controller::{DeliveryReport, Outcome};
use daily_dispatch::dispatcher::{install_signal_handler, Dispatcher, RunMode};
use daily_dispatch::hooks::{CommandHook, LogListener};
use daily_dispatch::schedule::SystemClock;
use daily_dispatch::state::{SendState, SendStateStore};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Daily Dispatch - one scheduled message per day to a group
#[derive(Parser)]
#[command(name = "daily-dispatch")]
#[command(about = "Send one message per day to a messaging group")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon, delivering every day until stopped
    Run,

    /// Deliver today's message (waiting for the send time if needed), then exit
    Once,

    /// Show today's send state and the next scheduled fire
    Status,

    /// Validate the config file
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run => cmd_run(&cli.config, RunMode::Daemon).await,
        Commands::Once => cmd_run(&cli.config, RunMode::Once).await,
        Commands::Status => cmd_status(&cli.config).await.map(|()| ExitCode::SUCCESS),
        Commands::Check => cmd_check(&cli.config).map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// CLI Commands
// ============================================================================

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("loading config {}", path.display()))
}

async fn cmd_run(config_path: &Path, mode: RunMode) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let transport = Arc::new(CommandTransport::new(&config.bridge));
    let hook = CommandHook::new(&config.hooks);

    let mut dispatcher = Dispatcher::new(config, transport, Arc::new(SystemClock))?;
    dispatcher.add_listener(Arc::new(LogListener));
    if !hook.is_empty() {
        dispatcher.add_listener(Arc::new(hook.clone()));
    }

    let cancel = install_signal_handler();
    let result = dispatcher.run(mode, cancel).await;
    hook.flush().await;
    let report = result?;

    info!("Dispatcher stopped");
    Ok(ExitCode::from(exit_code(mode, report.as_ref())))
}

/// 0 when the run ended well; `once` fails unless today's message went out
fn exit_code(mode: RunMode, report: Option<&DeliveryReport>) -> u8 {
    match (mode, report.map(|r| &r.outcome)) {
        (RunMode::Daemon, _) => 0,
        (RunMode::Once, Some(Outcome::Sent)) => 0,
        (RunMode::Once, _) => 1,
    }
}

async fn cmd_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let spec = config.schedule()?;
    let now = Utc::now();
    let today = spec.local_date(now);

    let store = SendStateStore::new(config.state_path());
    let stored = store.read().context("reading send state")?;

    println!("Group:      {}", config.group);
    println!("Schedule:   {} (window {}s)", spec, config.window_seconds);
    println!("State file: {}", store.path().display());
    println!("Today:      {}", describe_state(today, stored.as_ref()));
    let next = spec.next_fire_after(now);
    println!("Next fire:  {}", next.with_timezone(&spec.timezone));
    println!(
        "Deadline:   {}",
        (next + chrono::Duration::seconds(config.window_seconds as i64)).with_timezone(&spec.timezone)
    );

    let bridge = match CommandTransport::new(&config.bridge).status().await {
        Ok(BridgeStatus::Open) => "open".to_string(),
        Ok(BridgeStatus::LoggedOut(reason)) => format!("logged out ({})", reason),
        Ok(BridgeStatus::Closed(reason)) => format!("closed ({})", reason),
        Err(e) => format!("unavailable ({})", e),
    };
    println!("Session:    {}", bridge);

    Ok(())
}

fn describe_state(today: NaiveDate, stored: Option<&SendState>) -> String {
    match stored {
        Some(state) if state.date == today && state.sent => {
            format!("sent ({} attempt(s))", state.attempts)
        }
        Some(state) if state.date == today => {
            format!("not sent ({} attempt(s) so far)", state.attempts)
        }
        Some(state) => format!(
            "not sent (last record {}, {})",
            state.date,
            if state.sent { "sent" } else { "not sent" }
        ),
        None => "not sent (no record yet)".to_string(),
    }
}

fn cmd_check(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let spec = config.schedule()?;

    println!(
        "Config OK: \"{}\" to \"{}\" daily at {}",
        config.message, config.group, spec
    );
    println!(
        "Retry every {}s for {}s; state in {}",
        config.retry_interval_seconds,
        config.window_seconds,
        config.state_path().display()
    );
    Ok(())
}
