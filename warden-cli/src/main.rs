//! Tor Warden CLI
//!
//! Supervise a local Tor daemon, rotate its identity and verify that traffic
//! really leaves through the Tor network.

mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use warden_core::{Connectivity, HealthLevel, RotationOutcome, StatusReport, WardenConfig};
use warden_runtime::Warden;

/// How often a foreground `start` checks that the daemon is still alive
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tor-warden")]
#[command(author, version, about = "Tor Warden: supervise and verify a local Tor daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, env = "WARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// SOCKS port (overrides the config file)
    #[arg(long, global = true)]
    socks_port: Option<u16>,

    /// Control port (overrides the config file)
    #[arg(long, global = true)]
    control_port: Option<u16>,

    /// Control port secret (or set WARDEN_CONTROL_SECRET env var)
    #[arg(long, env = "WARDEN_CONTROL_SECRET", hide_env_values = true, global = true)]
    control_secret: Option<String>,

    /// Path to the tor binary (default: looked up on PATH)
    #[arg(long, global = true)]
    tor_binary: Option<PathBuf>,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1", global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch Tor and wait for bootstrap; runs until Ctrl-C unless detached
    Start {
        /// Leave Tor running and return once it has bootstrapped
        #[arg(long)]
        detach: bool,
    },

    /// Stop the Tor daemon on the configured control port
    Stop,

    /// Show process, port, routing and leak status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Request a new identity and verify the exit address changed
    Rotate {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Test routing through Tor and compare against a direct connection
    Test {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List built circuits
    Circuits {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Start { .. } | Commands::Stop => false,
            Commands::Status { json }
            | Commands::Rotate { json }
            | Commands::Test { json }
            | Commands::Circuits { json } => *json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json = cli.command.json();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if json {
                println!("{}", error_json(&e));
            } else {
                eprintln!("❌ {:#}", e);
            }
            ExitCode::from(HealthLevel::Unhealthy.exit_code())
        },
    }
}

/// `{"error": "..."}` so `--json` callers always get a parseable document
fn error_json(e: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({ "error": format!("{:#}", e) })
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
/// `RUST_LOG` takes precedence over `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let warden = Warden::new(config)?;

    match cli.command {
        Commands::Start { detach } => start(&warden, detach).await,
        Commands::Stop => stop(&warden).await,
        Commands::Status { json } => status(&warden, json).await,
        Commands::Rotate { json } => rotate(&warden, json).await,
        Commands::Test { json } => test(&warden, json).await,
        Commands::Circuits { json } => circuits(&warden, json).await,
    }
}

/// Config file, then command-line and environment overrides
fn load_config(cli: &Cli) -> Result<WardenConfig> {
    let mut config = match &cli.config {
        Some(path) => warden_core::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WardenConfig::default(),
    };

    if let Some(port) = cli.socks_port {
        config.proxy.socks_port = port;
    }
    if let Some(port) = cli.control_port {
        config.proxy.control_port = port;
    }
    if let Some(secret) = &cli.control_secret {
        config.proxy.control_secret = secret.clone();
    }
    if let Some(binary) = &cli.tor_binary {
        config.supervisor.tor_binary = Some(binary.clone());
    }

    Ok(config)
}

async fn start(warden: &Warden, detach: bool) -> Result<ExitCode> {
    let proxy = &warden.config().proxy;
    println!("🧅 Tor Warden\n");
    println!(
        "🚀 Starting Tor (SOCKS {}, control {})...",
        proxy.socks_port, proxy.control_port
    );

    let handle = warden.start().await?;
    println!("✅ Tor is running (pid {})", render::pid(handle.pid));
    println!("   Proxy: {}", proxy.socks_url());

    if detach {
        if let Some(dir) = warden.release().await {
            println!("   Data directory: {}", dir.display());
        }
        println!("   Stop it with: tor-warden stop");
        return Ok(ExitCode::SUCCESS);
    }

    println!("   Press Ctrl-C to stop\n");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            println!("\n🛑 Stopping Tor...");
            ExitCode::SUCCESS
        },
        _ = watch(warden) => {
            println!("❌ Tor exited unexpectedly");
            ExitCode::from(HealthLevel::Unhealthy.exit_code())
        },
    };

    warden.stop().await?;
    println!("✅ Tor stopped");
    Ok(outcome)
}

/// Returns once the supervised daemon is gone
async fn watch(warden: &Warden) {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    loop {
        ticker.tick().await;
        if !warden.is_healthy().await {
            return;
        }
    }
}

async fn stop(warden: &Warden) -> Result<ExitCode> {
    if warden.attach().await?.is_none() {
        println!("ℹ️  Tor is not running");
        return Ok(ExitCode::SUCCESS);
    }

    println!("🛑 Stopping Tor...");
    warden.stop().await?;
    println!("✅ Tor stopped");
    Ok(ExitCode::SUCCESS)
}

async fn status(warden: &Warden, json: bool) -> Result<ExitCode> {
    if let Err(e) = warden.attach().await {
        warn!("Could not attach to Tor: {}", e);
    }

    let report = warden.snapshot().await;
    if json {
        print_json(&report)?;
    } else {
        render::status(&report);
    }
    report_leak(&report.connectivity);
    Ok(ExitCode::from(report.overall.exit_code()))
}

#[derive(Serialize)]
struct RotationReport<'a> {
    rotation: &'a RotationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a StatusReport>,
}

async fn rotate(warden: &Warden, json: bool) -> Result<ExitCode> {
    warden
        .attach()
        .await?
        .context("Tor is not running; start it first")?;

    if !json {
        println!("🔄 Requesting new identity...");
    }
    let outcome = warden.rotate().await?;

    // The fresh status is only worth showing once the identity really changed
    let report = if outcome.changed {
        Some(warden.snapshot().await)
    } else {
        None
    };

    if json {
        print_json(&RotationReport {
            rotation: &outcome,
            status: report.as_ref(),
        })?;
    } else {
        render::rotation(&outcome);
        if let Some(report) = &report {
            println!();
            render::status(report);
        }
    }

    if outcome.changed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(HealthLevel::Unhealthy.exit_code()))
    }
}

async fn test(warden: &Warden, json: bool) -> Result<ExitCode> {
    if !json {
        println!("🔌 Testing Tor connectivity...\n");
    }

    let connectivity = warden.test_connectivity().await;
    if json {
        print_json(&connectivity)?;
    } else {
        render::connectivity(&connectivity);
    }
    report_leak(&connectivity);

    let level = match &connectivity {
        Connectivity::NotAttempted { .. } => HealthLevel::Unhealthy,
        tested => tested.health(),
    };
    Ok(ExitCode::from(level.exit_code()))
}

async fn circuits(warden: &Warden, json: bool) -> Result<ExitCode> {
    warden
        .attach()
        .await?
        .context("Tor is not running; start it first")?;

    let circuits = warden.circuits().await?;
    if json {
        print_json(&circuits)?;
    } else {
        render::circuits(&circuits);
    }
    Ok(ExitCode::SUCCESS)
}

/// A leak never goes unlogged, whatever the output format
fn report_leak(connectivity: &Connectivity) {
    if let Connectivity::Tested { leak, .. } = connectivity {
        if let Err(e) = leak.ensure_clean() {
            error!("{}", e);
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "tor-warden",
            "--socks-port",
            "19050",
            "--control-port",
            "19051",
            "--control-secret",
            "s3cret",
            "status",
            "--json",
        ]);
        let config = load_config(&cli).unwrap();

        assert_eq!(config.proxy.socks_port, 19050);
        assert_eq!(config.proxy.control_port, 19051);
        assert_eq!(config.proxy.control_secret, "s3cret");
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn test_json_flag_per_command() {
        let circuits = Cli::parse_from(["tor-warden", "circuits", "--json"]);
        assert!(circuits.command.json());
        let stop = Cli::parse_from(["tor-warden", "stop"]);
        assert!(!stop.command.json());
    }

    #[test]
    fn test_error_json_carries_context() {
        let e = anyhow::anyhow!("connection refused").context("Tor is not running");
        let value = error_json(&e);
        assert_eq!(value["error"], "Tor is not running: connection refused");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["tor-warden", "--config", "/nonexistent/warden.toml", "stop"]);
        assert!(load_config(&cli).is_err());
    }
}
