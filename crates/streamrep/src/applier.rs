//! Applies single change events to the destination table.
//!
//! INSERT and MODIFY upsert the full new image, REMOVE deletes by key. Both
//! are idempotent, which is what makes at-least-once delivery safe: a
//! replayed event leaves the destination exactly as the first delivery did.
//! There is no retry here; the processor owns the retry policy.

use crate::config::DeletePolicy;
use crate::error::ApplyError;
use crate::event::{ChangeEvent, EventKind, Item};
use crate::store::DestinationStore;
use std::sync::Arc;
use tracing::{debug, enabled, trace, Level};

/// What an apply call did to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Record written (inserted or overwritten)
    Upserted,
    /// Record deleted (or was already absent)
    Deleted,
    /// Event kind not replicated
    Ignored,
}

/// Writes change events into one destination table
#[derive(Clone)]
pub struct DestinationApplier {
    store: Arc<dyn DestinationStore>,
    table: String,
    partition_attribute: String,
    delete_policy: DeletePolicy,
}

impl std::fmt::Debug for DestinationApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationApplier")
            .field("table", &self.table)
            .field("partition_attribute", &self.partition_attribute)
            .field("delete_policy", &self.delete_policy)
            .finish_non_exhaustive()
    }
}

impl DestinationApplier {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        table: impl Into<String>,
        partition_attribute: impl Into<String>,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            partition_attribute: partition_attribute.into(),
            delete_policy: DeletePolicy::Apply,
        }
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Apply one event. Exactly one write or delete reaches the store for
    /// upserts and applied removes; nothing for ignored events.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ApplyError> {
        if enabled!(Level::TRACE) {
            let image = event
                .new_image
                .as_ref()
                .map(|i| serde_json::Value::Object(i.clone()).to_string())
                .unwrap_or_default();
            trace!("{}: {} - {}", event.kind, event.key, image);
        } else {
            debug!("{}: {}", event.kind, event.key);
        }

        match event.kind {
            EventKind::Insert | EventKind::Modify => {
                let image = event
                    .new_image
                    .as_ref()
                    .ok_or_else(|| ApplyError::MissingImage {
                        kind: event.kind.to_string(),
                        key: event.key.clone(),
                    })?;
                let key = self.key_of(&event.key, image)?;
                self.store
                    .put_record(&self.table, &key, image.clone())
                    .await?;
                Ok(ApplyOutcome::Upserted)
            }
            EventKind::Remove => match self.delete_policy {
                DeletePolicy::Apply => {
                    self.store.delete_record(&self.table, &event.key).await?;
                    Ok(ApplyOutcome::Deleted)
                }
                DeletePolicy::Ignore => Ok(ApplyOutcome::Ignored),
            },
            EventKind::Unknown => Ok(ApplyOutcome::Ignored),
        }
    }

    /// Partition key value carried by the image
    fn key_of(&self, event_key: &str, image: &Item) -> Result<String, ApplyError> {
        match image.get(&self.partition_attribute) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(ApplyError::MissingKey {
                key: event_key.to_string(),
                attribute: self.partition_attribute.clone(),
            }),
        }
    }
}
