//! # streamrep - CDC table replication
//!
//! Replays the change stream of a source table against a destination table,
//! shard by shard, with at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ shard coordination │  (lease library, poller, consumer group)
//! └─────────┬──────────┘
//!           │ initialize / deliver_batch / notify_shutdown
//!           ▼
//! ┌────────────────────┐
//! │  ShardController   │  one tokio task per shard
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐     ┌────────────────────┐
//! │ReplicatingProcessor│────▶│   Checkpointer     │──▶ CheckpointStore
//! └─────────┬──────────┘     └────────────────────┘
//!           ▼
//! ┌────────────────────┐
//! │ DestinationApplier │──▶ DestinationStore
//! └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> streamrep::Result<()> {
//! use std::sync::Arc;
//! use streamrep::{
//!     ChangeEvent, MemoryCheckpointStore, MemoryStore, ReplicatingProcessorFactory,
//!     ReplicationConfig, ShardController, ShutdownReason,
//! };
//!
//! let store = Arc::new(MemoryStore::with_tables(["orders-dest"]));
//! let checkpoints = Arc::new(MemoryCheckpointStore::new());
//! let factory = ReplicatingProcessorFactory::new(
//!     store,
//!     checkpoints,
//!     "orders-dest",
//!     ReplicationConfig::default(),
//! );
//!
//! let controller = ShardController::new(factory);
//! let shard = "shard-0".into();
//! controller.initialize(shard, None).await?;
//! controller
//!     .deliver_batch(&"shard-0".into(), vec![ChangeEvent::remove("shard-0", 1u128, "1")])
//!     .await?;
//! controller.shutdown_all(ShutdownReason::Terminate).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! Events are applied with idempotent upserts and deletes, so replaying
//! events after a restart converges to the same destination state. An event
//! that fails every retry is logged and skipped; checkpoint failures are
//! logged and retried on the next cycle. Nothing here aborts the process.

pub mod applier;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod processor;
pub mod retry;
pub mod store;

pub use applier::{ApplyOutcome, DestinationApplier};
pub use checkpoint::{
    AbandonReason, CheckpointOutcome, CheckpointStore, Checkpointer, FileCheckpointStore,
    MemoryCheckpointStore, ShardPosition,
};
pub use config::{CheckpointTrigger, DeletePolicy, ReplicationConfig};
pub use error::{
    ApplyError, CheckpointError, ReplicationError, Result, StoreError, StoreResult,
};
pub use event::{ChangeEvent, EventKind, Item, SequenceNumber, ShardId};
pub use lifecycle::ShardController;
pub use processor::{
    CheckpointPolicy, ProcessorFactory, ProcessorPhase, ProcessorState, ProcessorStats,
    RecordProcessor, ReplicatingProcessor, ReplicatingProcessorFactory, ShutdownReason,
};
pub use retry::RetryBudget;
pub use store::{DestinationStore, MemoryStore};
