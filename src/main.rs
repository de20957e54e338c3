//! Nodemux CLI - Tunnel TCP applications over a single node connection

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nodemux_node::{NodeListener, TcpNodeConnector, TcpNodeListener};
use nodemux_tunnel::Transport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::FileConfig;

/// Nodemux - Multiplex TCP connections over one node-to-node link
#[derive(Parser, Debug)]
#[command(name = "nodemux")]
#[command(about = "Nodemux - Multiplex TCP connections over one node-to-node link")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file with identities and tuning values
    #[arg(short, long, global = true, env = "NODEMUX_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    identity: IdentityArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Identity overrides, taking precedence over the configuration file
#[derive(Args, Debug)]
struct IdentityArgs {
    /// This node's identity (64 hex characters)
    #[arg(long, global = true, env = "NODEMUX_NODE_KEY")]
    node_key: Option<String>,

    /// Remote node's identity
    #[arg(long, global = true, env = "NODEMUX_PEER_NODE_KEY")]
    peer_node_key: Option<String>,

    /// Local application identity
    #[arg(long, global = true, env = "NODEMUX_APP_KEY")]
    app_key: Option<String>,

    /// Remote application identity
    #[arg(long, global = true, env = "NODEMUX_PEER_APP_KEY")]
    peer_app_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dial a node and forward every stream it opens to a local application
    #[command(long_about = r#"
Dial a remote node, announce this side's identities, and forward every
stream the remote opens to the given application address. A new TCP
connection to the application is made for each stream.

EXAMPLES:
  # Expose a local PostgreSQL through the node at relay.example.com
  nodemux connect --node relay.example.com:7000 --app 127.0.0.1:5432

ENVIRONMENT VARIABLES:
  NODEMUX_NODE       Remote node address
  NODEMUX_APP        Application address to dial per stream
  NODEMUX_CONFIG     Configuration file
    "#)]
    Connect {
        /// Remote node address
        #[arg(long, env = "NODEMUX_NODE")]
        node: String,

        /// Application address to dial for each new stream
        #[arg(long, env = "NODEMUX_APP")]
        app: String,
    },

    /// Accept one node connection and tunnel local clients over it
    Serve {
        /// Address to accept the node connection on
        #[arg(long, env = "NODEMUX_BIND", default_value = "0.0.0.0:7000")]
        bind: String,

        /// Address application clients connect to
        #[arg(long, env = "NODEMUX_APP_LISTEN")]
        app_listen: String,
    },

    /// Dial a node without a handshake and tunnel local clients over it
    Relay {
        /// Remote node address
        #[arg(long, env = "NODEMUX_NODE")]
        node: String,

        /// Address application clients connect to
        #[arg(long, env = "NODEMUX_APP_LISTEN")]
        app_listen: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<FileConfig> {
    let mut config = FileConfig::load_optional(cli.config.as_deref())?;

    let overrides = &cli.identity;
    if overrides.node_key.is_some() {
        config.node_key = overrides.node_key.clone();
    }
    if overrides.peer_node_key.is_some() {
        config.peer_node_key = overrides.peer_node_key.clone();
    }
    if overrides.app_key.is_some() {
        config.app_key = overrides.app_key.clone();
    }
    if overrides.peer_app_key.is_some() {
        config.peer_app_key = overrides.peer_app_key.clone();
    }

    Ok(config)
}

async fn run(command: Commands, config: FileConfig, transport: &Transport) -> Result<()> {
    match command {
        Commands::Connect { node, app } => {
            transport
                .connect(&node, &app)
                .await
                .with_context(|| format!("Failed to connect to node {}", node))?;
            info!("Forwarding streams from {} to {}", node, app);
        }
        Commands::Serve { bind, app_listen } => {
            let listener = TcpNodeListener::bind(&bind, config.node_config()?)
                .await
                .with_context(|| format!("Failed to bind node listener on {}", bind))?;
            info!("Waiting for node connection on {}", listener.local_addr()?);

            let (connection, remote) = listener
                .accept()
                .await
                .context("Failed to accept node connection")?;
            info!("Node {} connected", remote);
            transport.adopt(connection).await?;

            transport
                .listen_for_app(&app_listen, || info!("Accepting clients on {}", app_listen))
                .await?;
        }
        Commands::Relay { node, app_listen } => {
            let connection = transport
                .listen_and_connect(&node)
                .await
                .with_context(|| format!("Failed to connect to node {}", node))?;
            info!("Relaying over {}", connection.connection_id());

            transport
                .listen_for_app(&app_listen, || info!("Accepting clients on {}", app_listen))
                .await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let route = config.route()?;
    info!("Node: {}", route.from_node);
    info!("App: {} → {}", route.from_app, route.to_app);

    let transport = Transport::new(
        Arc::new(TcpNodeConnector::new(config.node_config()?)),
        route,
        config.tunnel_config(),
    );

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            transport.close().await;
            return Ok(());
        }
        result = run(cli.command, config, &transport) => {
            if let Err(e) = result {
                error!("Startup failed: {:#}", e);
                transport.close().await;
                return Err(e);
            }
        }
    }

    info!("Tunnel running, press Ctrl+C to stop");
    ctrl_c.await.context("Failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    transport.close().await;
    info!("Nodemux stopped");
    Ok(())
}
