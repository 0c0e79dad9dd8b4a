//! # Shard lifecycle controller
//!
//! Bridges the shard coordination layer to one [`RecordProcessor`] per
//! shard. Every shard gets its own tokio task fed through a bounded channel:
//!
//! ```text
//! coordination ──initialize──▶ ShardController ──spawn──▶ shard task ─▶ processor
//!              ──deliver_batch──────▶ (mpsc) ─────────────▶ process_records
//!              ──notify_shutdown────▶ (mpsc) ─────────────▶ shutdown
//! ```
//!
//! Commands for a shard are handled strictly in order, so a shutdown queued
//! behind a batch only reaches the processor once that batch is done.
//! Shards run in parallel with each other.

use crate::error::{ReplicationError, Result};
use crate::event::{ChangeEvent, SequenceNumber, ShardId};
use crate::processor::{ProcessorFactory, RecordProcessor, ShutdownReason};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default depth of a shard's command queue
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

enum ShardCommand {
    Records {
        batch: Vec<ChangeEvent>,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        reason: ShutdownReason,
        done: oneshot::Sender<()>,
    },
}

struct ShardWorker {
    tx: mpsc::Sender<ShardCommand>,
    handle: JoinHandle<()>,
}

/// Runs one processor per assigned shard
pub struct ShardController<F: ProcessorFactory> {
    factory: Arc<F>,
    workers: Mutex<HashMap<ShardId, ShardWorker>>,
    channel_capacity: usize,
}

impl<F: ProcessorFactory> ShardController<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            workers: Mutex::new(HashMap::new()),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Start a processor for `shard_id`.
    ///
    /// Fails with [`ReplicationError::ShardAlreadyActive`] while a previous
    /// processor of the same shard has not finished shutting down.
    pub async fn initialize(
        &self,
        shard_id: ShardId,
        resume_from: Option<SequenceNumber>,
    ) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&shard_id) {
            return Err(ReplicationError::ShardAlreadyActive(shard_id));
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let processor = self.factory.create_processor();
        let handle = tokio::spawn(run_shard(
            processor,
            shard_id.clone(),
            resume_from,
            rx,
        ));

        info!("Started processor for shard {}", shard_id);
        workers.insert(shard_id, ShardWorker { tx, handle });
        Ok(())
    }

    /// Hand a batch to the shard's processor and wait until it has been
    /// fully processed, retries and checkpoint included.
    pub async fn deliver_batch(&self, shard_id: &ShardId, batch: Vec<ChangeEvent>) -> Result<()> {
        let tx = self.sender(shard_id).await?;
        let (done, done_rx) = oneshot::channel();

        debug!("Delivering {} records to shard {}", batch.len(), shard_id);
        if tx.send(ShardCommand::Records { batch, done }).await.is_err() {
            return Err(self.worker_gone(shard_id).await);
        }
        if done_rx.await.is_err() {
            return Err(self.worker_gone(shard_id).await);
        }
        Ok(())
    }

    /// Shut the shard's processor down once in-flight work is done, then
    /// release the shard.
    pub async fn notify_shutdown(&self, shard_id: &ShardId, reason: ShutdownReason) -> Result<()> {
        let tx = self.sender(shard_id).await?;
        let (done, done_rx) = oneshot::channel();

        info!("Shutdown ({}) requested for shard {}", reason, shard_id);
        if tx.send(ShardCommand::Shutdown { reason, done }).await.is_err() {
            return Err(self.worker_gone(shard_id).await);
        }
        if done_rx.await.is_err() {
            return Err(self.worker_gone(shard_id).await);
        }

        let worker = self.workers.lock().await.remove(shard_id);
        if let Some(worker) = worker {
            if let Err(e) = worker.handle.await {
                warn!("Worker for shard {} ended abnormally: {}", shard_id, e);
            }
        }
        info!("Shard {} released", shard_id);
        Ok(())
    }

    /// Shards with a live processor, sorted
    pub async fn active_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.workers.lock().await.keys().cloned().collect();
        shards.sort();
        shards
    }

    pub async fn is_active(&self, shard_id: &ShardId) -> bool {
        self.workers.lock().await.contains_key(shard_id)
    }

    /// Shut down every active shard concurrently
    pub async fn shutdown_all(&self, reason: ShutdownReason) {
        let shards = self.active_shards().await;
        if shards.is_empty() {
            return;
        }
        info!("Shutting down {} shards ({})", shards.len(), reason);

        let results = futures::future::join_all(
            shards
                .iter()
                .map(|shard_id| self.notify_shutdown(shard_id, reason)),
        )
        .await;

        for (shard_id, result) in shards.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to shut down shard {}: {}", shard_id, e);
            }
        }
    }

    async fn sender(&self, shard_id: &ShardId) -> Result<mpsc::Sender<ShardCommand>> {
        self.workers
            .lock()
            .await
            .get(shard_id)
            .map(|worker| worker.tx.clone())
            .ok_or_else(|| ReplicationError::UnknownShard(shard_id.clone()))
    }

    /// Drop a worker whose task has ended without a shutdown
    async fn worker_gone(&self, shard_id: &ShardId) -> ReplicationError {
        let worker = self.workers.lock().await.remove(shard_id);
        if let Some(worker) = worker {
            if let Err(e) = worker.handle.await {
                error!("Worker for shard {} failed: {}", shard_id, e);
            }
        }
        ReplicationError::WorkerGone(shard_id.clone())
    }
}

async fn run_shard<P: RecordProcessor>(
    mut processor: P,
    shard_id: ShardId,
    resume_from: Option<SequenceNumber>,
    mut rx: mpsc::Receiver<ShardCommand>,
) {
    processor.initialize(shard_id.clone(), resume_from).await;

    while let Some(command) = rx.recv().await {
        match command {
            ShardCommand::Records { batch, done } => {
                processor.process_records(batch).await;
                let _ = done.send(());
            }
            ShardCommand::Shutdown { reason, done } => {
                processor.shutdown(reason).await;
                let _ = done.send(());
                return;
            }
        }
    }

    debug!("Command channel of shard {} closed", shard_id);
}
