#![warn(missing_docs)]

//! opsync command line: inspect the configuration or run an in-process replication demo.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsync_repl::metrics::{format_prometheus, master_metrics, replica_metrics};
use opsync_repl::registry::NoopReplicaStore;
use opsync_repl::store::KeyValueStore;
use opsync_repl::{
    LocalMasterEndpoint, MemoryBroker, ReplConfig, ReplicaClient, ReplicableRegistry,
    ReplicationMaster,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "opsync")]
#[command(about = "Operation replication between a master and its replicas", long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json); defaults apply when absent.
    #[arg(short, long, env = "OPSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master and a replica in-process over the in-memory broker.
    Demo {
        /// Keys written on the master before the replica bootstraps.
        #[arg(long, default_value = "100")]
        seed: usize,
        /// Operations executed on the master once the replica is live.
        #[arg(short, long, default_value = "1000")]
        ops: usize,
        /// Also print Prometheus metrics.
        #[arg(long)]
        metrics: bool,
    },
    /// Print the resolved configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Demo { seed, ops, metrics } => demo(config, seed, ops, metrics).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            tracing::info!(
                limit_bytes = config.send_queue.resolved_limit_bytes(),
                "send queue byte budget"
            );
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ReplConfig> {
    match path {
        Some(path) if path.exists() => ReplConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(ReplConfig::default())
        }
        None => Ok(ReplConfig::default()),
    }
}

async fn demo(config: ReplConfig, seed: usize, ops: usize, metrics: bool) -> Result<()> {
    let broker = MemoryBroker::new();

    let master_replicables = Arc::new(ReplicableRegistry::new());
    let source = Arc::new(KeyValueStore::new("race-1"));
    master_replicables.add(source.clone());
    for i in 0..seed {
        source.put(&format!("key-{}", i), i as i64)?;
    }

    let master = ReplicationMaster::start(
        config.clone(),
        Arc::new(broker.clone()),
        master_replicables,
        Arc::new(NoopReplicaStore),
        vec![],
    )
    .await?;

    let replica_replicables = Arc::new(ReplicableRegistry::new());
    let copy = Arc::new(KeyValueStore::new("race-1"));
    replica_replicables.add(copy.clone());
    let client = ReplicaClient::new(config, Arc::new(broker.clone()), replica_replicables);

    let descriptor =
        master.master_descriptor("opsync-demo-replica", "in-process", vec!["race-1".into()]);
    client
        .start_replicating_from(
            descriptor,
            Arc::new(LocalMasterEndpoint::new(master.clone(), "in-process")),
        )
        .await?;

    for i in 0..ops {
        let key = format!("key-{}", i % (seed.max(1) * 2));
        if i % 7 == 6 {
            source.remove(&key)?;
        } else {
            source.put(&key, i as i64)?;
        }
    }
    master.flush();

    let mut converged = false;
    for _ in 0..250 {
        if copy.contents() == source.contents() {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if !converged {
        tracing::warn!("replica did not converge with the master");
    }

    let report = serde_json::json!({
        "converged": converged,
        "master": master.status(),
        "replica": client.status(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if metrics {
        let mut all = master_metrics(&master.status());
        all.extend(replica_metrics(&client.status()));
        print!("{}", format_prometheus(&all));
    }

    client.stop_replicating_from_master(true).await?;
    master.shutdown().await;
    Ok(())
}
