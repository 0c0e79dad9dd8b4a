//! Shard poller: drives a [`ShardController`] from a [`SourceTable`]
//!
//! Plays the role of the shard coordination layer for the demo. Every shard
//! of the source stream gets a polling task which
//!
//! 1. loads the shard's checkpoint and initializes the controller with it
//! 2. reads batches after the current position and delivers them, waiting
//!    for each to be processed before reading the next
//! 3. sends `Terminate` once a sealed shard is drained, or `Zombie` when the
//!    poller is stopped (the shard is given up without a final checkpoint)

use crate::error::{DemoError, DemoResult};
use crate::source::SourceTable;
use std::sync::Arc;
use std::time::Duration;
use streamrep::{CheckpointStore, ProcessorFactory, ShardController, ShardId, ShutdownReason};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

/// Polling behaviour
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Maximum events per delivered batch
    pub batch_size: usize,
    /// Pause after a read that returned nothing
    pub idle_between_reads: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            idle_between_reads: Duration::from_millis(100),
        }
    }
}

/// How a shard's polling task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardEnd {
    /// Drained a sealed shard and shut it down with `Terminate`
    Terminated,
    /// Stopped by the poller and shut down with `Zombie`
    Stopped,
    /// Gave up on an error
    Failed(String),
}

/// Polls every shard of a source table
pub struct ShardPoller<F: ProcessorFactory> {
    source: Arc<SourceTable>,
    controller: Arc<ShardController<F>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PollerConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(ShardId, JoinHandle<DemoResult<ShardEnd>>)>,
}

impl<F: ProcessorFactory> ShardPoller<F> {
    pub fn new(
        source: Arc<SourceTable>,
        controller: Arc<ShardController<F>>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: PollerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source,
            controller,
            checkpoints,
            config,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Spawn one polling task per shard
    pub async fn start(&mut self) -> DemoResult<()> {
        if !self.tasks.is_empty() {
            return Err(DemoError::AlreadyRunning);
        }

        let shards = self.source.shard_ids().await;
        info!(
            "Starting poller for {} shards of {}",
            shards.len(),
            self.source.name()
        );

        for shard_id in shards {
            let task = poll_shard(
                shard_id.clone(),
                self.source.clone(),
                self.controller.clone(),
                self.checkpoints.clone(),
                self.config.clone(),
                self.shutdown_tx.subscribe(),
            )
            .instrument(info_span!("poller", shard_id = %shard_id));
            self.tasks.push((shard_id, tokio::spawn(task)));
        }
        Ok(())
    }

    /// Wait for every shard task to finish on its own
    pub async fn join(self) -> Vec<(ShardId, ShardEnd)> {
        let mut ends = Vec::with_capacity(self.tasks.len());
        for (shard_id, task) in self.tasks {
            let end = match task.await {
                Ok(Ok(end)) => end,
                Ok(Err(e)) => {
                    error!("Polling shard {} failed: {}", shard_id, e);
                    ShardEnd::Failed(e.to_string())
                }
                Err(e) => {
                    error!("Polling task of shard {} panicked: {}", shard_id, e);
                    ShardEnd::Failed(e.to_string())
                }
            };
            ends.push((shard_id, end));
        }
        ends
    }

    /// Stop polling; shards not yet drained are shut down as `Zombie`
    pub async fn stop(self) -> Vec<(ShardId, ShardEnd)> {
        info!("Stopping poller");
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }
}

async fn poll_shard<F: ProcessorFactory>(
    shard_id: ShardId,
    source: Arc<SourceTable>,
    controller: Arc<ShardController<F>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> DemoResult<ShardEnd> {
    let mut position = checkpoints
        .load_checkpoint(&shard_id)
        .await?
        .map(|p| p.sequence_number);
    controller.initialize(shard_id.clone(), position).await?;

    let mut stopping = false;
    loop {
        if stopping || *shutdown.borrow() {
            controller
                .notify_shutdown(&shard_id, ShutdownReason::Zombie)
                .await?;
            return Ok(ShardEnd::Stopped);
        }

        let read = source
            .read_shard(&shard_id, position, config.batch_size)
            .await?;
        let idle = read.events.is_empty();

        if let Some(last) = read.events.last() {
            position = Some(last.sequence_number);
            controller.deliver_batch(&shard_id, read.events).await?;
        }

        if read.end_of_shard {
            debug!("Reached the end of shard {}", shard_id);
            controller
                .notify_shutdown(&shard_id, ShutdownReason::Terminate)
                .await?;
            return Ok(ShardEnd::Terminated);
        }

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(config.idle_between_reads) => {}
                changed = shutdown.changed() => {
                    // a dropped poller counts as a stop
                    stopping = changed.is_err();
                }
            }
        }
    }
}
