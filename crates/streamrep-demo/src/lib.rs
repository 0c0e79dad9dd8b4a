//! # streamrep-demo
//!
//! Replicates an in-memory source table into a destination table through
//! its change stream, using the `streamrep` shard controller.
//!
//! ```text
//! SourceTable ──shards──▶ ShardPoller ──▶ ShardController ──▶ destination table
//!                              ▲                 │
//!                              └── checkpoints ◀─┘
//! ```

pub mod data;
pub mod error;
pub mod poller;
pub mod source;

pub use data::{compare_tables, generate_items, item, tables_equal};
pub use error::{DemoError, DemoResult};
pub use poller::{PollerConfig, ShardEnd, ShardPoller};
pub use source::{ShardRead, SourceTable};
