//! beacon - command-line front end for the beacon tracking SDK
//!
//! This tool provides commands for:
//! - Checking tracker configuration
//! - Probing the collection endpoint for reachability
//! - Sending a single event through the dispatch queue
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log.YYYY-MM-DD (~/.local/state/beacon/)

use anyhow::{bail, Context, Result};
use beacon_core::{Config, Event, PollingReachability, Tracker, TrackerConfig};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Send tracking events to a collection endpoint")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show tracker configuration
    Status,

    /// Check whether the collection endpoint is reachable
    Probe,

    /// Track one event and wait for delivery
    Track {
        /// Event name (e.g. `view`, `purchase`)
        event: String,

        /// Event value as key=value; JSON values are parsed, anything else is a string
        #[arg(short = 'V', long = "value", value_parser = parse_value)]
        values: Vec<(String, serde_json::Value)>,

        /// Visitor id to track as (default: a new random id)
        #[arg(long)]
        visitor_id: Option<String>,
    },
}

fn parse_value(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Probe => cmd_probe(&config.tracker).await,
        Command::Track {
            event,
            values,
            visitor_id,
        } => cmd_track(&config.tracker, build_event(event, values), visitor_id).await,
    }
}

fn build_event(name: String, values: Vec<(String, serde_json::Value)>) -> Event {
    values
        .into_iter()
        .fold(Event::new(name), |event, (key, value)| event.value(key, value))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Beacon Tracker Configuration");
    println!("============================");
    println!();

    let tracker = &config.tracker;

    println!("Config File:     {}", Config::config_path().display());
    println!(
        "Log File:        {} (rotated daily)",
        beacon_core::logging::current_log_file().display()
    );
    println!("Enabled:         {}", tracker.enabled);

    if !tracker.enabled {
        println!();
        println!("Tracker is disabled. Enable it in config.toml:");
        println!();
        println!("  [tracker]");
        println!("  enabled = true");
        println!("  base_url = \"https://collect.example.com\"");
        println!("  app_key = \"your-app-key\"");
        return Ok(());
    }

    println!(
        "Base URL:        {}",
        tracker.base_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "App Key:         {}",
        if tracker.app_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Endpoint:        {}",
        tracker.operation_mode.track_endpoint_path()
    );
    println!("Timeout:         {}s", tracker.timeout_secs);
    println!("Probe Interval:  {}s", tracker.reachability_interval_secs);
    println!("Max Retries:     {}", tracker.max_retries);
    println!("Dry Run:         {}", tracker.dry_run);
    println!("Opt Out:         {}", tracker.opt_out);

    println!();
    if tracker.is_ready() {
        println!("Status: Ready to track");
    } else {
        println!("Status: Not ready (missing required configuration)");
    }

    Ok(())
}

async fn cmd_probe(tracker: &TrackerConfig) -> Result<()> {
    let Some(base_url) = tracker.base_url.as_deref() else {
        println!("No base_url configured. Run 'status' for details.");
        return Ok(());
    };

    let monitor = PollingReachability::new(tracker).context("failed to create probe")?;
    let status = monitor.probe().await;
    println!("{base_url}: {status}");

    Ok(())
}

async fn cmd_track(
    config: &TrackerConfig,
    event: Event,
    visitor_id: Option<String>,
) -> Result<()> {
    if config.enabled && config.dry_run {
        println!("Dry run: event not sent");
        println!(
            "{}",
            serde_json::to_string_pretty(&event).context("failed to encode event")?
        );
        return Ok(());
    }

    let Some(tracker) = Tracker::new(config).context("failed to create tracker")? else {
        println!("Tracker is disabled. Run 'status' for details.");
        return Ok(());
    };
    let tracker = match visitor_id {
        Some(visitor_id) => tracker.with_visitor_id(visitor_id),
        None => tracker,
    };

    tracing::info!(event_name = %event.event_name, "Tracking event from the command line");

    let deadline = tracker.delivery_deadline();
    let response = match tokio::time::timeout(deadline, tracker.track_and_wait(event)).await {
        Ok(Ok(Some(response))) => response,
        Ok(Ok(None)) => {
            println!("Event dropped (opted out)");
            return Ok(());
        }
        Ok(Err(e)) => bail!("failed to deliver event: {e}"),
        Err(_) => {
            let stats = tracker.stats();
            tracker.teardown();
            bail!(
                "failed to deliver event: no result within {}s, endpoint unreachable \
                 ({} retries)",
                deadline.as_secs_f64(),
                stats.retries
            );
        }
    };

    println!("Delivered as visitor {}", tracker.visitor_id());
    if let Some(status) = response.status {
        println!("Status:   {status}");
    }
    if let Some(error) = response.error.as_deref() {
        println!("Error:    {error}");
    }

    let stats = tracker.stats();
    println!("Requests: {}", stats.requests_sent);
    println!("Retries:  {}", stats.retries);

    tracker.teardown();
    Ok(())
}
