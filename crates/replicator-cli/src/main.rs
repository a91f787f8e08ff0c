//! Replicator CLI: runs a replicator node and its ops commands.
//!
//! - `replicator run`: start a node and reconcile until Ctrl-C
//! - `replicator reconcile-once`: run a single reconciliation pass
//! - `replicator status [key]`: per-backend status from the operation log
//! - `replicator list <backend>`: keys stored on one backend
//! - `replicator enable | disable | settings`: replication settings

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use replicator_core::{BackendName, NodeConfig};
use replicator_runtime::ReplicatorNode;

#[derive(Parser)]
#[command(name = "replicator")]
#[command(about = "Replicates objects across independent S3-compatible backends")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "replicator.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and run the reconciliation loop until interrupted
    Run,
    /// Run one reconciliation pass and wait for its repairs
    ReconcileOnce,
    /// Show where objects live according to the operation log
    Status {
        /// Only this object key
        key: Option<String>,
    },
    /// List the keys stored on one backend
    List {
        /// Backend name from the configuration
        backend: String,
    },
    /// Fan writes out to every backend
    Enable,
    /// Send writes to the primary backend only
    Disable,
    /// Show the replication settings
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::from_json_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let node = ReplicatorNode::start(config)
        .await
        .context("starting replicator node")?;

    match cli.command {
        Commands::Run => run(&node).await?,
        Commands::ReconcileOnce => {
            let report = node.reconciler.run_once().await?;
            if report.skipped {
                println!("skipped: reconciliation lease held by another instance");
            } else {
                let considered = report.considered;
                let dropped = report.dropped;
                let deferred = report.deferred;
                let dispatched = report.dispatched();
                let failed = report
                    .wait()
                    .await
                    .into_iter()
                    .filter(|r| r.is_err())
                    .count();
                println!(
                    "considered={considered} dropped={dropped} deferred={deferred} \
                     repaired={} failed={failed}",
                    dispatched - failed
                );
            }
        }
        Commands::Status { key: Some(key) } => {
            let statuses = node.coordinator.status_of(&key).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::Status { key: None } => {
            let statuses = node.coordinator.status_all().await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Commands::List { backend } => {
            let name = BackendName::new(backend);
            let client = node
                .coordinator
                .backends()
                .get(&name)
                .ok_or_else(|| anyhow!("backend {name} is not configured"))?;
            for key in client.list().await? {
                println!("{key}");
            }
        }
        Commands::Enable => {
            let settings = node.coordinator.enable().await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Disable => {
            let settings = node.coordinator.disable().await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Settings => {
            let settings = node.coordinator.settings().await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

async fn run(node: &ReplicatorNode) -> anyhow::Result<()> {
    let handle = node.spawn_reconciler();
    info!(
        interval_ms = node.config.replication_interval.as_millis() as u64,
        "Running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    node.shutdown().await;
    handle.await.context("reconciler task")?;
    Ok(())
}
