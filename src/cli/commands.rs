//! CLI commands

use crate::config::{parse_member, ConfigOverrides, NodeConfig};
use crate::db::ChronoDb;
use crate::storage::raft_log::{FileLogStore, RAFT_DIR};
use crate::storage::snapshot::{HistoryPersistence, JsonFilePersistence};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Chrono-DB CLI
#[derive(Parser, Debug)]
#[command(name = "chrono-db", version)]
#[command(about = "Bitemporal database node with replicated counters and registers")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a database node until interrupted
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Node id
        #[arg(long)]
        node: Option<String>,
        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,
        /// Address for consensus RPCs
        #[arg(long)]
        raft_addr: Option<String>,
        /// Founding peer, as ID=ADDR (repeatable)
        #[arg(long = "peer", value_parser = parse_member)]
        peers: Vec<(String, String)>,
        /// Existing member to join through, as ID=ADDR (repeatable)
        #[arg(long = "join", value_parser = parse_member)]
        join: Vec<(String, String)>,
        /// Keep everything in memory
        #[arg(long)]
        in_memory: bool,
    },
    /// Print the persisted state of a data directory
    Status {
        /// Data directory
        #[arg(long, default_value = "./data")]
        data: PathBuf,
    },
}

/// Dispatch a parsed command line
pub async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Start {
            config,
            node,
            data,
            raft_addr,
            peers,
            join,
            in_memory,
        } => {
            let overrides = ConfigOverrides {
                node_id: node,
                data_dir: data,
                raft_addr,
                peers,
                join,
                in_memory,
            };
            run_start(config, overrides).await
        }
        Commands::Status { data } => run_status(data),
    }
}

/// Build the node configuration, open the node and serve until a shutdown signal
pub async fn run_start(config_path: Option<PathBuf>, overrides: ConfigOverrides) -> Result<()> {
    let mut config = match config_path {
        Some(ref path) => NodeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    config.apply_overrides(&overrides);
    config.validate().context("invalid configuration")?;

    let db = ChronoDb::open(config).await.context("failed to start node")?;
    shutdown_signal().await;
    info!("shutdown requested");
    db.shutdown().await.context("shutdown failed")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct DataDirStatus {
    data_dir: PathBuf,
    current_term: u64,
    voted_for: Option<String>,
    last_applied: u64,
    keys: usize,
    records: usize,
}

/// Report the hard state and record counts of a stopped node
pub fn run_status(data: PathBuf) -> Result<()> {
    if !data.is_dir() {
        bail!("data directory {} does not exist", data.display());
    }
    let hard_state = if data.join(RAFT_DIR).is_dir() {
        FileLogStore::open(&data)?.read_hard_state()?
    } else {
        Default::default()
    };
    let histories = JsonFilePersistence::new(&data)?
        .load()
        .context("failed to read snapshot")?;

    let status = DataDirStatus {
        data_dir: data,
        current_term: hard_state.current_term,
        voted_for: hard_state.voted_for,
        last_applied: hard_state.last_applied,
        keys: histories.len(),
        records: histories.values().map(|h| h.len()).sum(),
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
