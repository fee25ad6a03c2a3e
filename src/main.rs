//! hdhr-relay - HDHomeRun discovery relay
//!
//! Carries HDHomeRun discovery broadcasts between two networks over a single
//! TCP tunnel, so apps on one network can find tuners on the other.

mod config;
mod dump;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{RelayConfigFile, RequesterSettings, ResponderSettings};
use hdhr_relay_requester::Requester;
use hdhr_relay_responder::Responder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// hdhr-relay - Relay HDHomeRun discovery between networks
#[derive(Parser, Debug)]
#[command(name = "hdhr-relay")]
#[command(about = "hdhr-relay - Relay HDHomeRun discovery between networks")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter (e.g. "info", "hdhr_relay_requester=debug")
    #[arg(long, env = "RUST_LOG", global = true)]
    log_level: Option<String>,

    /// YAML configuration file
    #[arg(short, long, env = "HDHR_RELAY_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run next to the apps: forward their discovery broadcasts to the tuners' network
    #[command(alias = "tunerproxy")]
    #[command(long_about = r#"
Listen for HDHomeRun discovery broadcasts on the local network, forward each
one over a TCP tunnel to the responder relay, and send every reply back to
the app that asked. Reconnects automatically if the tunnel drops.

EXAMPLES:
  # Relay discovery to the responder on tuners.example.net (port 65001)
  hdhr-relay requester tuners.example.net

  # Custom tunnel port and a longer reply timeout
  hdhr-relay requester 10.8.0.1 --tunnel-port 7000 --pending-timeout-ms 8000

ENVIRONMENT VARIABLES:
  HDHR_RELAY_PEER        Responder relay host[:port]
    "#)]
    Requester(RequesterArgs),

    /// Run next to the tuners: answer forwarded discovery requests
    #[command(alias = "appproxy")]
    #[command(long_about = r#"
Accept the tunnel from the requester relay, re-broadcast every forwarded
discovery request on the local network, and send the tuners' replies back.

EXAMPLES:
  # Listen on all interfaces, port 65001
  hdhr-relay responder

  # Listen on one interface and broadcast to a specific subnet
  hdhr-relay responder 10.8.0.1 --target 192.168.1.255
    "#)]
    Responder(ResponderArgs),

    /// Log every HDHomeRun discovery packet seen on the local network
    Dump {
        /// Address to listen on
        #[arg(long, default_value_t = config::default_discovery_bind())]
        bind: SocketAddr,
    },
}

#[derive(Args, Debug)]
struct RequesterArgs {
    /// Responder relay host, optionally with :port
    #[arg(env = "HDHR_RELAY_PEER")]
    peer: Option<String>,

    /// Local address for discovery broadcasts [default: 0.0.0.0:65001]
    #[arg(long)]
    discovery_bind: Option<SocketAddr>,

    /// Tunnel port used when PEER has none [default: 65001]
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// How long a forwarded request waits for replies [default: 5000]
    #[arg(long)]
    pending_timeout_ms: Option<u64>,

    /// How often timed-out requests are evicted [default: 1000]
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// First reconnect delay [default: 3000]
    #[arg(long)]
    reconnect_initial_ms: Option<u64>,

    /// Maximum reconnect delay [default: 30000]
    #[arg(long)]
    reconnect_max_ms: Option<u64>,
}

impl From<RequesterArgs> for RequesterSettings {
    fn from(args: RequesterArgs) -> Self {
        Self {
            peer: args.peer,
            discovery_bind: args.discovery_bind,
            tunnel_port: args.tunnel_port,
            pending_timeout_ms: args.pending_timeout_ms,
            sweep_interval_ms: args.sweep_interval_ms,
            reconnect_initial_ms: args.reconnect_initial_ms,
            reconnect_max_ms: args.reconnect_max_ms,
        }
    }
}

#[derive(Args, Debug)]
struct ResponderArgs {
    /// Host or address the tunnel listener binds to [default: 0.0.0.0]
    bind_host: Option<String>,

    /// Tunnel listen port [default: 65001]
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// Where to re-emit requests: ip or ip:port [default: 255.255.255.255:65001]
    #[arg(long)]
    target: Option<String>,

    /// How long to collect replies per request [default: 500]
    #[arg(long)]
    response_window_ms: Option<u64>,
}

impl From<ResponderArgs> for ResponderSettings {
    fn from(args: ResponderArgs) -> Self {
        Self {
            bind_host: args.bind_host,
            tunnel_port: args.tunnel_port,
            target: args.target,
            response_window_ms: args.response_window_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_level.as_deref());

    let file = match &cli.config {
        Some(path) => RelayConfigFile::load(path)?,
        None => RelayConfigFile::default(),
    };

    match cli.command {
        Commands::Requester(args) => {
            let config = RequesterSettings::from(args).or(file.requester).into_config()?;
            let requester = Requester::bind(config).await?;

            run_until_ctrl_c("requester", async move {
                requester.run().await.context("Requester relay stopped")
            })
            .await
        }
        Commands::Responder(args) => {
            let config = ResponderSettings::from(args)
                .or(file.responder)
                .into_config()
                .await?;
            let responder = Responder::bind(config).await?;

            run_until_ctrl_c("responder", async move {
                responder.run().await.context("Responder relay stopped")
            })
            .await
        }
        Commands::Dump { bind } => run_until_ctrl_c("dump", dump::run(bind)).await,
    }
}

/// Setup logging from an explicit filter, or from the verbose flag
fn setup_logging(verbose: bool, log_level: Option<&str>) {
    let default_level = if verbose { "debug" } else { "info" };
    let log_level = log_level.unwrap_or(default_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Run `task` until it finishes or Ctrl+C is pressed
async fn run_until_ctrl_c<F>(name: &str, task: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let handle = tokio::spawn(task);
    let abort = handle.abort_handle();

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            abort.abort();
            Ok(())
        }
        result = handle => {
            match result {
                Ok(Ok(())) => {
                    info!(command = name, "Stopped");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(command = name, error = %e, "Fatal error");
                    Err(e)
                }
                Err(e) => Err(e).context("Relay task panicked"),
            }
        }
    }
}
