//! signalpost - command-line client for the telemetry signal pipeline
//!
//! This tool provides commands for:
//! - Checking configuration and the offline signal cache
//! - Sending a single signal
//! - Flushing signals left over from earlier runs
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/signalpost/config.toml (~/.config/signalpost/config.toml)
//! - Cache: $XDG_DATA_HOME/signalpost/signal-cache.json (~/.local/share/signalpost/signal-cache.json)

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signalpost_core::cache::peek_backup;
use signalpost_core::{Config, TelemetryClient, TickOutcome};

#[derive(Parser)]
#[command(name = "signalpost")]
#[command(about = "Send telemetry signals and manage the offline signal cache")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and cached signal count
    Status,

    /// Send one signal
    Send {
        /// Name of the event
        signal_type: String,

        /// User identifier (hashed before sending)
        #[arg(short, long)]
        user: Option<String>,

        /// Extra payload entry, repeatable
        #[arg(short, long = "payload", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        payload: Vec<(String, String)>,
    },

    /// Deliver signals left in the offline cache
    Flush,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        let guard = signalpost_core::logging::init(&config.logging)
            .context("failed to initialize logging")?;
        eprintln!("Logging to {}", guard.log_dir().display());
        Some(guard)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Send {
            signal_type,
            user,
            payload,
        } => cmd_send(&config, signal_type, user, payload).await,
        Command::Flush => cmd_flush(&config).await,
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    let telemetry = &config.telemetry;

    println!("Signalpost Configuration");
    println!("========================");
    println!();
    println!(
        "App ID:          {}",
        telemetry.app_id.as_deref().unwrap_or("<not set>")
    );
    println!("Base URL:        {}", telemetry.base_url);
    println!(
        "Default User:    {}",
        if telemetry.default_user.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Test Mode:       {}", telemetry.effective_test_mode());
    println!("Flush Interval:  {}s", telemetry.flush_interval_secs);
    println!("Timeout:         {}s", telemetry.timeout_secs);

    let cache_path = telemetry.resolved_cache_path();
    println!("Cache File:      {}", cache_path.display());
    println!("Log Directory:   {}", Config::state_dir().display());

    let pending = if cache_path.exists() {
        peek_backup(&cache_path)
            .with_context(|| format!("failed to read {}", cache_path.display()))?
    } else {
        0
    };
    println!("Pending signals: {}", pending);

    println!();
    match telemetry.validate() {
        Ok(()) => println!("Status: Ready to send"),
        Err(e) => println!("Status: Not ready ({})", e),
    }

    Ok(())
}

async fn cmd_send(
    config: &Config,
    signal_type: String,
    user: Option<String>,
    payload: Vec<(String, String)>,
) -> Result<()> {
    let client = TelemetryClient::start(&config.telemetry).context("failed to start client")?;

    let extra: HashMap<String, String> = payload.into_iter().collect();
    let extra = (!extra.is_empty()).then_some(extra);

    client.send_signal(signal_type.clone(), user, extra);
    client.wait_for_in_flight().await;

    while client.pending_count() > 0 {
        match client.flush_now().await {
            TickOutcome::Delivered(n) => println!("Delivered {} signal(s)", n),
            TickOutcome::Dropped(n) => println!("Dropped {} undeliverable signal(s)", n),
            TickOutcome::Requeued(n) => {
                println!("Delivery failed, keeping {} signal(s) for later", n);
                break;
            }
            TickOutcome::Idle => break,
        }
    }

    let backed_up = client
        .terminate()
        .await
        .context("failed to back up signals")?;
    if backed_up > 0 {
        println!("Backed up {} signal(s)", backed_up);
    }

    tracing::info!(signal_type = %signal_type, backed_up, "Send finished");
    Ok(())
}

async fn cmd_flush(config: &Config) -> Result<()> {
    let cache_path = config.telemetry.resolved_cache_path();
    let pending = if cache_path.exists() {
        peek_backup(&cache_path)
            .with_context(|| format!("failed to read {}", cache_path.display()))?
    } else {
        0
    };

    if pending == 0 {
        println!("No pending signals to flush.");
        return Ok(());
    }

    println!("Flushing {} pending signal(s)...", pending);

    // The scheduler's first tick may already take a batch
    let client = TelemetryClient::start(&config.telemetry).context("failed to start client")?;
    client.wait_for_in_flight().await;

    let mut dropped = 0;
    while client.pending_count() > 0 {
        match client.flush_now().await {
            TickOutcome::Delivered(_) => {}
            TickOutcome::Dropped(n) => dropped += n,
            TickOutcome::Requeued(_) => {
                println!("Delivery failed; remaining signals stay cached");
                break;
            }
            TickOutcome::Idle => break,
        }
    }

    let remaining = client
        .terminate()
        .await
        .context("failed to back up signals")?;

    println!();
    println!(
        "Delivered:  {}",
        pending.saturating_sub(remaining).saturating_sub(dropped)
    );
    if dropped > 0 {
        println!("Dropped:    {}", dropped);
    }
    println!("Remaining:  {}", remaining);

    Ok(())
}
