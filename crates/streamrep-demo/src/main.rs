//! streamrep-demo - replicate a table through its change stream
//!
//! Writes a data set into the source table `<prefix>`, replicates it shard
//! by shard into `<prefix>-dest` and compares the two tables.
//!
//! # Usage
//!
//! ```bash
//! # Create 1000 keys and wait until they are replicated
//! streamrep-demo --key-number 1000 --create
//!
//! # Same, with count-based checkpoints persisted to disk
//! streamrep-demo -k 1000 --create -c replication.yaml --checkpoint-dir ./checkpoints
//!
//! # Print the JSON schema of the replication config
//! streamrep-demo config-schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use streamrep::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MemoryStore,
    ReplicatingProcessorFactory, ReplicationConfig, ShardController,
};
use streamrep_demo::{compare_tables, generate_items, PollerConfig, ShardPoller, SourceTable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "streamrep-demo")]
#[command(version, about = "Replicate a simple table using its change stream")]
struct Cli {
    /// Demo table name prefix (destination is <prefix>-dest)
    #[arg(short = 't', long, default_value = "KCL-Demo")]
    table_prefix: String,

    /// Number of keys in the source table
    #[arg(short = 'k', long, default_value_t = 0)]
    key_number: u64,

    /// Seconds to keep replicating after the tables are in sync
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Create the source data set if not available
    #[arg(long)]
    create: bool,

    /// Max worker threads (default: 2 x available CPUs)
    #[arg(long)]
    threads: Option<usize>,

    /// Number of shards of the source stream
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Maximum records per delivered batch
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Seconds between two sync checks
    #[arg(long, default_value_t = 10)]
    sync_interval: u64,

    /// Persist checkpoints in this directory (in memory when absent)
    #[arg(long, env = "STREAMREP_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Replication config file (YAML)
    #[arg(short, long, env = "STREAMREP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication demo (default)
    Run,
    /// Show the replication config schema
    ConfigSchema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::ConfigSchema { format }) = &cli.command {
        return show_schema(format);
    }

    let threads = cli.threads.unwrap_or_else(default_threads).max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

async fn run(cli: Cli) -> Result<()> {
    info!("Starting demo...");

    let config = match &cli.config {
        Some(path) => ReplicationConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ReplicationConfig::default(),
    };

    let src_table = cli.table_prefix.clone();
    let dest_table = format!("{}-dest", cli.table_prefix);

    let source = Arc::new(SourceTable::new(src_table.clone(), cli.shards));
    let destination = Arc::new(MemoryStore::new());
    destination.create_table(&dest_table).await;

    let checkpoints: Arc<dyn CheckpointStore> = match &cli.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::open(dir).await.with_context(|| {
            format!("Failed to open checkpoint directory {}", dir.display())
        })?),
        None => Arc::new(MemoryCheckpointStore::new()),
    };

    let factory = ReplicatingProcessorFactory::new(
        destination.clone(),
        checkpoints.clone(),
        dest_table.clone(),
        config,
    );
    let controller = Arc::new(ShardController::new(factory));

    info!("Creating poller for stream of {}", src_table);
    let mut poller = ShardPoller::new(
        source.clone(),
        controller.clone(),
        checkpoints,
        PollerConfig {
            batch_size: cli.batch_size,
            ..Default::default()
        },
    );

    info!("Starting poller...");
    poller.start().await?;

    if cli.key_number != 0 || cli.create {
        let existing = source.count().await as u64;
        if existing < cli.key_number && cli.create {
            info!(
                "Adding {} records to source table...",
                cli.key_number - existing
            );
            source
                .put_items(generate_items(existing, cli.key_number))
                .await?;
        }

        let sync_interval = Duration::from_secs(cli.sync_interval.max(1));
        loop {
            tokio::time::sleep(sync_interval).await;

            info!(
                "Checking for source data...({}/{})",
                source.count().await,
                cli.key_number
            );
            let synced = destination.count(&dest_table).await as u64;
            info!("keys synced: {}/{}", synced, cli.key_number);
            if synced >= cli.key_number {
                break;
            }
        }

        if cli.create {
            if compare_tables(&source, &destination, &dest_table).await? {
                info!("Scan result is equal.");
            } else {
                error!("Tables are different!");
            }
        }
    }

    if cli.timeout != 0 {
        info!("Sleeping for {}sec", cli.timeout);
        tokio::time::sleep(Duration::from_secs(cli.timeout)).await;
    }

    info!("Shutting down poller");
    source.seal_all().await;
    for (shard_id, end) in poller.join().await {
        info!("Shard {} finished: {:?}", shard_id, end);
    }

    let leftover = controller.active_shards().await;
    if !leftover.is_empty() {
        warn!("{} shards still active after shutdown", leftover.len());
    }

    info!("Done.");
    Ok(())
}

/// Print the replication config schema
fn show_schema(format: &str) -> Result<()> {
    let schema = schemars::schema_for!(ReplicationConfig);
    let schema = serde_json::to_value(&schema)?;

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }

    Ok(())
}
