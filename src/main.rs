//! tunwire - multiplex TCP connections, reverse listeners and local
//! processes over a single controller connection
//!
//! Connects to the controller, serves its tunnel requests until the
//! connection drops, then reconnects with exponential backoff.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ReconnectPolicy, Settings};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunwire_agent::Agent;

/// tunwire agent - serve tunnel requests from a remote controller
#[derive(Parser, Debug)]
#[command(name = "tunwire")]
#[command(version)]
#[command(long_version = concat!(env!("TUNWIRE_VERSION"), "\nCommit: ", env!("TUNWIRE_COMMIT"), "\nBuilt: ", env!("TUNWIRE_BUILT")))]
#[command(long_about = r#"
Connect to a controller and serve its tunnel requests: outbound TCP
connections, reverse listeners and local processes, all multiplexed over
the one controller connection. Reconnects automatically if it drops.

EXAMPLES:
  # Serve a controller on the local machine
  tunwire --controller 127.0.0.1:7070

  # Read defaults from a file, override the log level
  tunwire --config tunwire.yaml --log-level debug

ENVIRONMENT VARIABLES:
  TUNWIRE_CONTROLLER     Controller address
  TUNWIRE_CONFIG         Configuration file
  TUNWIRE_LOG_LEVEL      Log level or filter directive
    "#)]
pub struct Cli {
    /// Controller address (e.g., 10.0.0.1:7070)
    #[arg(long, env = "TUNWIRE_CONTROLLER")]
    pub controller: Option<String>,

    /// YAML configuration file
    #[arg(long, env = "TUNWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or filter directive
    #[arg(long, env = "TUNWIRE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Largest chunk read from a tunnel per data message
    #[arg(long, env = "TUNWIRE_READ_CHUNK_SIZE")]
    pub read_chunk_size: Option<usize>,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long, env = "TUNWIRE_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: Option<usize>,

    /// Initial reconnection delay in seconds
    #[arg(long, env = "TUNWIRE_RECONNECT_DELAY")]
    pub reconnect_delay: Option<u64>,

    /// Maximum reconnection delay in seconds
    #[arg(long, env = "TUNWIRE_MAX_RECONNECT_DELAY")]
    pub max_reconnect_delay: Option<u64>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Serve the controller, reconnecting until shutdown or the attempt limit
async fn serve_with_reconnect(
    agent: Agent,
    controller: String,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut attempt = 0;
    let mut current_delay = policy.initial_delay;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        attempt += 1;
        if policy.max_attempts > 0 && attempt > policy.max_attempts {
            error!("Maximum reconnection attempts ({}) reached", policy.max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", policy.max_attempts);
        }

        info!(controller = %controller, attempt = attempt, "Connecting to controller");

        match TcpStream::connect(&controller)
            .await
            .with_context(|| format!("Failed to connect to controller {}", controller))
        {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                attempt = 0;
                current_delay = policy.initial_delay;

                let mut stop = shutdown.clone();
                let session = agent
                    .serve(stream, async move {
                        if stop.wait_for(|stopping| *stopping).await.is_err() {
                            // no Ctrl+C handler; run until the session ends
                            std::future::pending::<()>().await;
                        }
                    })
                    .await;

                match session {
                    Ok(()) => info!("Controller session ended"),
                    Err(e) => error!("Controller session failed: {:#}", e),
                }

                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            Err(e) => error!("{:#}", e),
        }

        warn!(
            "Reconnecting in {} seconds... (attempt {} of {})",
            current_delay.as_secs(),
            attempt + 1,
            if policy.max_attempts == 0 {
                "∞".to_string()
            } else {
                policy.max_attempts.to_string()
            }
        );

        tokio::select! {
            _ = tokio::time::sleep(current_delay) => {}
            Ok(_) = shutdown.wait_for(|stopping| *stopping) => return Ok(()),
        }

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, policy.max_delay);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    let settings = Settings::resolve(&cli)?;
    let agent = Agent::new(settings.agent.clone()).context("Invalid agent configuration")?;

    info!("tunwire starting...");
    info!("Controller: {}", settings.controller);
    info!(
        read_chunk_size = settings.agent.read_chunk_size,
        max_message_size = settings.agent.max_message_size,
        preferred_family = ?settings.agent.preferred_family,
        "Agent configuration"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    let result =
        serve_with_reconnect(agent, settings.controller, settings.reconnect, shutdown_rx).await;

    match &result {
        Ok(()) => info!("tunwire stopped"),
        Err(e) => error!("tunwire stopped: {:#}", e),
    }
    result
}
