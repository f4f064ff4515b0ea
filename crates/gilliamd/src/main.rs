//! gilliamd — the Gilliam scheduler daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Scheduler (ledger, leases, reconciliation loop)
//! - REST API
//!
//! # Usage
//!
//! ```text
//! gilliamd run --config /etc/gilliam/gilliam.toml --port 8443
//! gilliamd inspect --data-dir /var/lib/gilliam
//! gilliamd config --config /etc/gilliam/gilliam.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gilliam_core::{GilliamConfig, SystemClock};
use gilliam_scheduler::Scheduler;
use gilliam_state::StateStore;

const DB_FILE: &str = "gilliam.redb";

#[derive(Parser)]
#[command(name = "gilliamd", about = "Gilliam scheduler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover persisted state and serve the scheduler.
    Run {
        /// Path to gilliam.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides the config file).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the persisted nodes, work units and leases as JSON.
    Inspect {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run(config).await
        }
        Command::Inspect { config, data_dir } => {
            let config = load_config(config.as_deref())?;
            inspect(&data_dir.unwrap_or(config.server.data_dir))
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gilliamd=debug,gilliam_scheduler=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GilliamConfig> {
    match path {
        Some(path) => GilliamConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(GilliamConfig::default()),
    }
}

async fn run(config: GilliamConfig) -> anyhow::Result<()> {
    info!("Gilliam daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join(DB_FILE);

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let scheduler = Scheduler::recover(&config, store, Arc::new(SystemClock))
        .context("refusing to start: persisted state is inconsistent")?;
    let scheduler = Arc::new(scheduler);
    info!(
        packing = ?config.scheduler.packing,
        lease_ttl = config.scheduler.default_lease_ttl,
        "scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start the reconciliation loop ──────────────────────────

    let loop_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run(shutdown_rx).await;
        })
    };

    // ── Start API server ───────────────────────────────────────

    let router = gilliam_api::build_router(scheduler);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Let the loop finish its current cycle.
    let _ = loop_handle.await;

    info!("Gilliam daemon stopped");
    Ok(())
}

fn inspect(data_dir: &Path) -> anyhow::Result<()> {
    let db_path = data_dir.join(DB_FILE);
    if !db_path.exists() {
        anyhow::bail!("no state store at {}", db_path.display());
    }
    let store = StateStore::open(&db_path)?;
    let state = store.load()?;

    let dump = serde_json::json!({
        "nodes": state.nodes,
        "work_units": state.work_units,
        "leases": state.leases,
    });
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}
