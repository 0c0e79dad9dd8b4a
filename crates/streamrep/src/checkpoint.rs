//! # Shard checkpointing
//!
//! A checkpoint records "every event up to and including this sequence
//! number has been processed" for one shard. After a restart, consumption
//! resumes right after the stored position, so at most the events since the
//! last checkpoint are replayed.
//!
//! ## Failure handling
//!
//! | Error | Handling |
//! |-------|----------|
//! | `Throttled` | retried with the fixed backoff until the budget is spent, then logged as error |
//! | `AlreadyShutdown` | abandoned at once, logged at info (lease moved to another worker) |
//! | `InvalidState` and other store errors | abandoned at once, logged as error |
//!
//! None of these stop the shard: the next checkpoint cycle simply tries again.
//!
//! ## Stores
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryCheckpointStore` | Testing, ephemeral runs |
//! | `FileCheckpointStore` | Single-node deployments, survives restarts |

use crate::error::CheckpointError;
use crate::event::{SequenceNumber, ShardId};
use crate::retry::{retry, RetryBudget, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Durable position of a shard consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPosition {
    pub shard_id: ShardId,
    /// Last sequence number known to be processed
    pub sequence_number: SequenceNumber,
}

impl ShardPosition {
    pub fn new(shard_id: impl Into<ShardId>, sequence_number: impl Into<SequenceNumber>) -> Self {
        Self {
            shard_id: shard_id.into(),
            sequence_number: sequence_number.into(),
        }
    }
}

/// Persistence for shard positions
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the position of `shard_id`
    async fn save_checkpoint(
        &self,
        shard_id: &ShardId,
        position: &ShardPosition,
    ) -> Result<(), CheckpointError>;

    /// Last persisted position of `shard_id`, if any
    async fn load_checkpoint(
        &self,
        shard_id: &ShardId,
    ) -> Result<Option<ShardPosition>, CheckpointError>;
}

// ============================================================================
// Memory store
// ============================================================================

/// In-memory checkpoint store.
///
/// A shard can be revoked to model a lost lease: every save for it then
/// fails with [`CheckpointError::AlreadyShutdown`].
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    positions: RwLock<HashMap<ShardId, ShardPosition>>,
    revoked: RwLock<HashSet<ShardId>>,
    saves: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make further saves for `shard_id` fail as if the lease was lost
    pub async fn revoke(&self, shard_id: &ShardId) {
        self.revoked.write().await.insert(shard_id.clone());
    }

    /// Undo [`revoke`](Self::revoke)
    pub async fn reinstate(&self, shard_id: &ShardId) {
        self.revoked.write().await.remove(shard_id);
    }

    /// Number of successful saves across all shards
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Snapshot of all stored positions
    pub async fn positions(&self) -> HashMap<ShardId, ShardPosition> {
        self.positions.read().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_checkpoint(
        &self,
        shard_id: &ShardId,
        position: &ShardPosition,
    ) -> Result<(), CheckpointError> {
        if self.revoked.read().await.contains(shard_id) {
            return Err(CheckpointError::AlreadyShutdown(shard_id.clone()));
        }
        self.positions
            .write()
            .await
            .insert(shard_id.clone(), position.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        shard_id: &ShardId,
    ) -> Result<Option<ShardPosition>, CheckpointError> {
        Ok(self.positions.read().await.get(shard_id).cloned())
    }
}

// ============================================================================
// File store
// ============================================================================

/// On-disk representation of a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    #[serde(flatten)]
    position: ShardPosition,
    /// Unix epoch millis of the save
    updated_at: i64,
}

/// File-based checkpoint store.
///
/// One JSON file per shard:
/// ```text
/// checkpoint_dir/
///   shardId-00001.json
/// ```
///
/// Writes go to a temp file first and are renamed into place. Existing
/// checkpoints are loaded into an in-memory cache when the store is opened.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    cache: RwLock<HashMap<ShardId, ShardPosition>>,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();

        fs::create_dir_all(&dir).await.map_err(|e| {
            CheckpointError::invalid_state(format!(
                "failed to create checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let store = Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, shard_id: &ShardId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(shard_id)))
    }

    async fn load_all(&self) -> Result<(), CheckpointError> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut cache = self.cache.write().await;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<CheckpointRecord>(&content) {
                    Ok(record) => {
                        cache.insert(record.position.shard_id.clone(), record.position);
                        loaded += 1;
                    }
                    Err(e) => warn!("Failed to parse checkpoint file {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read checkpoint file {:?}: {}", path, e),
            }
        }

        if loaded > 0 {
            debug!("Loaded {} checkpoints from {:?}", loaded, self.dir);
        }
        Ok(())
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9_-]`, so distinct shard
/// ids never share a file
fn file_stem(shard_id: &ShardId) -> String {
    let mut stem = String::with_capacity(shard_id.as_str().len());
    for byte in shard_id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save_checkpoint(
        &self,
        shard_id: &ShardId,
        position: &ShardPosition,
    ) -> Result<(), CheckpointError> {
        let path = self.file_path(shard_id);
        let record = CheckpointRecord {
            position: position.clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let content = serde_json::to_string_pretty(&record)?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        self.cache
            .write()
            .await
            .insert(shard_id.clone(), position.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        shard_id: &ShardId,
    ) -> Result<Option<ShardPosition>, CheckpointError> {
        Ok(self.cache.read().await.get(shard_id).cloned())
    }
}

// ============================================================================
// Checkpointer
// ============================================================================

/// Why a checkpoint was given up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The shard is no longer ours
    Shutdown,
    /// Throttled on every attempt
    Exhausted,
    /// Non-retryable store failure
    Terminal,
}

/// Result of one checkpoint request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Saved { attempts: u32 },
    /// Position is not ahead of the last saved one; nothing written
    Stale,
    Abandoned { reason: AbandonReason, attempts: u32 },
}

impl CheckpointOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. })
    }
}

/// Checkpoint manager of a single shard.
///
/// Owned by the shard's processor; `checkpoint` takes `&mut self`, so two
/// checkpoints of the same shard can never run at the same time.
pub struct Checkpointer {
    shard_id: ShardId,
    store: Arc<dyn CheckpointStore>,
    budget: RetryBudget,
    last_saved: Option<SequenceNumber>,
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("shard_id", &self.shard_id)
            .field("budget", &self.budget)
            .field("last_saved", &self.last_saved)
            .finish_non_exhaustive()
    }
}

impl Checkpointer {
    pub fn new(shard_id: ShardId, store: Arc<dyn CheckpointStore>, budget: RetryBudget) -> Self {
        Self {
            shard_id,
            store,
            budget,
            last_saved: None,
        }
    }

    /// Start from a previously persisted position
    pub fn resume_from(mut self, position: Option<SequenceNumber>) -> Self {
        self.last_saved = position;
        self
    }

    pub fn last_saved(&self) -> Option<SequenceNumber> {
        self.last_saved
    }

    /// Persist `sequence_number` for this shard with bounded retries.
    ///
    /// Never fails: every error path ends in a log line and an
    /// [`CheckpointOutcome::Abandoned`].
    pub async fn checkpoint(&mut self, sequence_number: SequenceNumber) -> CheckpointOutcome {
        if self.last_saved.is_some_and(|last| sequence_number <= last) {
            debug!(
                "Shard {} already checkpointed at {}, skipping {}",
                self.shard_id,
                self.last_saved.unwrap_or(sequence_number),
                sequence_number
            );
            return CheckpointOutcome::Stale;
        }

        info!("Checkpointing shard {} at {}", self.shard_id, sequence_number);

        let position = ShardPosition::new(self.shard_id.clone(), sequence_number);
        let position = &position;
        let store = self.store.as_ref();
        let shard_id = &self.shard_id;
        let max_attempts = self.budget.max_attempts;

        let result = retry(
            &self.budget,
            |e: &CheckpointError| {
                if e.is_terminal() {
                    Verdict::GiveUp
                } else {
                    Verdict::Retry
                }
            },
            |attempt: u32, e: &CheckpointError| {
                if e.is_retryable() && attempt < max_attempts {
                    info!(
                        "Transient issue when checkpointing shard {} - attempt {} of {}: {}",
                        shard_id, attempt, max_attempts, e
                    );
                }
            },
            move |_| store.save_checkpoint(shard_id, position),
        )
        .await;

        match result.last_error {
            None => {
                self.last_saved = Some(sequence_number);
                CheckpointOutcome::Saved {
                    attempts: result.attempts,
                }
            }
            Some(e) if e.is_shutdown() => {
                info!(
                    "Shard {} was shut down on this worker, skipping checkpoint: {}",
                    self.shard_id, e
                );
                CheckpointOutcome::Abandoned {
                    reason: AbandonReason::Shutdown,
                    attempts: result.attempts,
                }
            }
            Some(e) if e.is_retryable() => {
                error!(
                    "Checkpoint of shard {} failed after {} attempts: {}",
                    self.shard_id, result.attempts, e
                );
                CheckpointOutcome::Abandoned {
                    reason: AbandonReason::Exhausted,
                    attempts: result.attempts,
                }
            }
            Some(e) => {
                error!(
                    "Cannot save checkpoint of shard {} to the checkpoint store: {}",
                    self.shard_id, e
                );
                CheckpointOutcome::Abandoned {
                    reason: AbandonReason::Terminal,
                    attempts: result.attempts,
                }
            }
        }
    }
}
