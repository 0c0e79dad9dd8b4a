//! Demo error types

use streamrep::{CheckpointError, ReplicationError, ShardId, StoreError};
use thiserror::Error;

pub type DemoResult<T> = std::result::Result<T, DemoError>;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("item has no '{0}' attribute")]
    MissingKey(String),

    #[error("shard '{0}' is sealed")]
    ShardSealed(ShardId),

    #[error("shard '{0}' does not exist")]
    UnknownShard(ShardId),

    #[error("poller is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
