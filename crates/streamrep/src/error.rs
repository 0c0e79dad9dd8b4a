//! Error types for streamrep
//!
//! Every failure the core can observe is classified as either retryable
//! (worth another attempt after backoff) or terminal. None of these errors
//! ever escapes a shard worker: they end in a log line and a retry or a skip.

use crate::event::ShardId;
use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type alias for destination store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by a destination store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store rejected the request because of request rate
    #[error("throttled: {0}")]
    Throttled(String),

    /// The request did not complete in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// The store could not be reached
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request itself is malformed (missing key attribute, unknown table)
    #[error("validation error: {0}")]
    Validation(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn throttled(msg: impl Into<String>) -> Self {
        Self::Throttled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Check if the store might succeed if asked again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

/// Errors from applying a single change event to the destination
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    /// The destination store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An INSERT/MODIFY event arrived without a new image
    #[error("{kind} event for key '{key}' has no new image")]
    MissingImage { kind: String, key: String },

    /// The image does not carry the partition key attribute
    #[error("image for key '{key}' is missing partition attribute '{attribute}'")]
    MissingKey { key: String, attribute: String },

    /// The apply path panicked; caught at the per-event boundary
    #[error("apply panicked: {0}")]
    Panicked(String),
}

impl ApplyError {
    /// Check if this error is retryable by its nature.
    ///
    /// The processor retries every apply failure regardless; this only
    /// decides the severity used when logging an attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Panicked(_) => true,
            Self::MissingImage { .. } | Self::MissingKey { .. } => false,
        }
    }
}

/// Errors from persisting a shard position
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    /// This processor no longer owns the shard (lease moved elsewhere)
    #[error("shard '{0}' has been shut down on this worker")]
    AlreadyShutdown(ShardId),

    /// The checkpoint store is throttling writes
    #[error("checkpoint store throttled: {0}")]
    Throttled(String),

    /// The checkpoint store is misconfigured (missing table, bad schema)
    #[error("invalid checkpoint store state: {0}")]
    InvalidState(String),

    /// I/O error in a file-backed store
    #[error("checkpoint io error: {0}")]
    Io(String),

    /// Stored checkpoint could not be (de)serialized
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

impl CheckpointError {
    pub fn throttled(msg: impl Into<String>) -> Self {
        Self::Throttled(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Only throttling is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    /// Benign race with shard reassignment; not an operational error
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::AlreadyShutdown(_))
    }

    /// Abandon at once, no retry
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors from the shard lifecycle controller and configuration
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// A processor is already live for this shard
    #[error("shard '{0}' already has an active processor")]
    ShardAlreadyActive(ShardId),

    /// No processor is live for this shard
    #[error("shard '{0}' is not active")]
    UnknownShard(ShardId),

    /// The shard worker task ended unexpectedly
    #[error("worker for shard '{0}' is gone")]
    WorkerGone(ShardId),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint store error surfaced outside a processor (e.g. on resume)
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ReplicationError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::throttled("slow down").is_retryable());
        assert!(StoreError::timeout("5s").is_retryable());
        assert!(StoreError::unavailable("connection refused").is_retryable());
        assert!(!StoreError::validation("no key").is_retryable());
        assert!(!StoreError::Other("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_apply_error_classification() {
        assert!(ApplyError::from(StoreError::throttled("x")).is_retryable());
        assert!(ApplyError::Panicked("oops".to_string()).is_retryable());
        assert!(!ApplyError::MissingKey {
            key: "1".to_string(),
            attribute: "p".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_checkpoint_error_classification() {
        assert!(CheckpointError::throttled("rate").is_retryable());
        assert!(!CheckpointError::invalid_state("no table").is_retryable());
        assert!(CheckpointError::invalid_state("no table").is_terminal());
        assert!(!CheckpointError::throttled("rate").is_terminal());
        let shutdown = CheckpointError::AlreadyShutdown(ShardId::from("shard-1"));
        assert!(shutdown.is_shutdown());
        assert!(!shutdown.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ReplicationError::ShardAlreadyActive(ShardId::from("shard-7"));
        assert_eq!(err.to_string(), "shard 'shard-7' already has an active processor");

        let err = ApplyError::MissingImage {
            kind: "MODIFY".to_string(),
            key: "3".to_string(),
        };
        assert_eq!(err.to_string(), "MODIFY event for key '3' has no new image");
    }
}
