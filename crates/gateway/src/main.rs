//! Switchboard MCP Gateway
//!
//! Aggregates tools and prompts from upstream MCP servers (streaming HTTP or
//! spawned stdio processes) and re-exports curated, renamed subsets under
//! named profiles on a single MCP endpoint.

mod cleanup;
mod config;
mod connector;
mod error;
mod http;
mod profile;
mod registry;
mod resolver;
mod server;

use crate::config::GatewayConfig;
use crate::http::GatewayState;
use crate::registry::ConnectorRegistry;
use crate::resolver::ProfileResolver;
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::io::{IsTerminal as _, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fail-safe budget for connector disposal at shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "switchboard-mcp-gateway")]
#[command(
    version,
    about = "MCP gateway: aggregate upstream MCP servers behind named profiles"
)]
struct CliArgs {
    /// Path to the gateway config file (JSON or YAML).
    #[arg(short = 'c', long = "config", env = "SWITCHBOARD_CONFIG")]
    config: PathBuf,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "SWITCHBOARD_LOG",
        default_value = "info"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (the default when no subcommand is given).
    Serve,
    /// Resolve a profile and print its exported tools.
    ListTools(ListArgs),
    /// Resolve a profile and print its exported prompts.
    ListPrompts(ListArgs),
}

#[derive(clap::Args, Debug)]
struct ListArgs {
    /// Profile to resolve.
    #[arg(long)]
    profile: String,

    /// Output JSON instead of human-readable text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    let config = GatewayConfig::load(&args.config).await?;
    let registry = Arc::new(ConnectorRegistry::from_config(&config));
    let config = Arc::new(config);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, registry).await,
        Command::ListTools(list) => list_surface(&config, &registry, &list, Surface::Tools).await,
        Command::ListPrompts(list) => {
            list_surface(&config, &registry, &list, Surface::Prompts).await
        }
    }
}

async fn serve(config: Arc<GatewayConfig>, registry: Arc<ConnectorRegistry>) -> anyhow::Result<()> {
    tracing::info!("Starting Switchboard MCP Gateway v{VERSION}");
    tracing::info!(
        servers = config.mcp_servers.len(),
        profiles = config.profiles.len(),
        "Loaded config"
    );

    let ct = CancellationToken::new();
    let state = Arc::new(GatewayState {
        config: config.clone(),
        registry: registry.clone(),
        shutdown: ct.clone(),
    });

    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen.as_str())
        .await
        .with_context(|| format!("bind listen address '{}'", config.listen))?;
    let bound = listener.local_addr().context("get listen address")?;
    tracing::info!("Starting MCP gateway HTTP server on {bound}");

    spawn_shutdown_watcher(ct.clone());

    let serve_ct = ct.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            serve_ct.cancelled().await;
        })
        .await
        .context("http server")?;

    dispose_with_deadline(&registry).await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

enum Surface {
    Tools,
    Prompts,
}

async fn list_surface(
    config: &GatewayConfig,
    registry: &ConnectorRegistry,
    list: &ListArgs,
    surface: Surface,
) -> anyhow::Result<()> {
    let mut resolver = ProfileResolver::new(config, registry);
    let resolved = resolver
        .resolve(&list.profile)
        .await
        .map_err(|err| anyhow::anyhow!("resolve profile '{}': {err}", list.profile))?;

    match surface {
        Surface::Tools => {
            let tools = resolved.list_tools();
            if list.json {
                println!("{}", serde_json::to_string_pretty(&tools)?);
            } else {
                for tool in &tools {
                    match tool.description.as_deref() {
                        Some(description) => println!("{}\t{description}", tool.name),
                        None => println!("{}", tool.name),
                    }
                }
            }
        }
        Surface::Prompts => {
            let prompts = resolved.list_prompts();
            if list.json {
                println!("{}", serde_json::to_string_pretty(&prompts)?);
            } else {
                for prompt in &prompts {
                    match prompt.description.as_deref() {
                        Some(description) => println!("{}\t{description}", prompt.name),
                        None => println!("{}", prompt.name),
                    }
                }
            }
        }
    }

    dispose_with_deadline(registry).await;
    Ok(())
}

/// Dispose all connectors, bounded by a fail-safe timeout so a hung upstream
/// cannot stall process exit.
async fn dispose_with_deadline(registry: &ConnectorRegistry) {
    let budget = Duration::from_secs(
        switchboard_env::positive_u64("SWITCHBOARD_SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
    );
    match tokio::time::timeout(budget, registry.dispose_all()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "connector disposal reported failures"),
        Err(_) => tracing::error!(
            budget_secs = budget.as_secs(),
            "connector disposal did not finish in time; exiting anyway"
        ),
    }
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection.
    let is_tty = stdout().is_terminal();

    if is_tty {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for SIGTERM or Ctrl+C, then cancel the token: the HTTP server stops
/// accepting connections and in-flight requests run their cleanup.
fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}
