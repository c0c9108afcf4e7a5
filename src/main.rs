//! agentloop - Local-First Agent Runtime
//!
//! Command-line entry point: starts the WebSocket gateway and session
//! engine, lists agent packs, probes backends, and prints configuration.

use agentloop::{
    agents::AgentCatalog,
    config::AgentloopConfig,
    engine::Engine,
    gateway,
    supervisor::{ServiceKind, ServiceSupervisor},
};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agentloop")]
#[command(version)]
#[command(about = "Local-first agent runtime with supervised model backends")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AGENTLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and session engine
    Serve {
        /// Host to bind to (overrides the config file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(long, env = "AGENTLOOP_PORT")]
        port: Option<u16>,
    },

    /// List the available agent packs
    Agents,

    /// Probe backends and the workspace root
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("agentloop={},tower_http=warn", log_level).into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = AgentloopConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_serve(config).await?;
        }
        Commands::Agents => {
            show_agents(&config).await;
        }
        Commands::Doctor => {
            run_doctor(&config).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_serve(config: AgentloopConfig) -> Result<()> {
    tracing::info!("Starting agentloop");

    let (events, _) = broadcast::channel(1024);
    let supervisor = Arc::new(ServiceSupervisor::new(
        &config.services,
        Some(config.workspace.resolve_root()),
        events.clone(),
    )?);

    // Bring up backends marked auto_start while the gateway binds
    tokio::spawn(supervisor.clone().auto_start_if_configured());

    let engine = Arc::new(Engine::new(config.clone(), supervisor.clone(), events)?);

    gateway::serve(&config, engine).await?;

    tracing::info!("Shutting down services");
    supervisor.stop_all().await;

    Ok(())
}

async fn show_agents(config: &AgentloopConfig) {
    let catalog = AgentCatalog::from_config(config);
    for summary in catalog.summaries().await {
        println!("{:<12} {}", summary.name, summary.description);
        if summary.tools.is_empty() {
            println!("{:<12} tools: none", "");
        } else {
            println!(
                "{:<12} tools: {} (max {} calls per turn)",
                "",
                summary.tools.join(", "),
                summary.max_tool_calls
            );
        }
    }
}

async fn run_doctor(config: &AgentloopConfig) -> Result<()> {
    println!("agentloop doctor");
    println!();

    let (events, _) = broadcast::channel(16);
    let supervisor = Arc::new(ServiceSupervisor::new(
        &config.services,
        Some(config.workspace.resolve_root()),
        events,
    )?);

    println!("Checking backends...");
    for kind in ServiceKind::ALL {
        let base_url = supervisor.descriptor(kind)?.base_url();
        if supervisor.is_healthy(kind).await {
            println!("  ✓ {} responding at {}", kind, base_url);
        } else if supervisor.can_start(kind).await {
            println!(
                "  ✗ {} not responding at {} (start command configured)",
                kind, base_url
            );
        } else {
            println!("  ✗ {} not responding at {} (no start command)", kind, base_url);
        }
    }

    println!();
    println!("Checking workspace...");
    let root = config.workspace.resolve_root();
    if root.is_dir() {
        println!("  ✓ workspace root: {}", root.display());
    } else {
        println!("  ✗ workspace root missing: {}", root.display());
    }

    println!();
    println!("Doctor check complete!");

    Ok(())
}

fn show_config(config: Option<&AgentloopConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
