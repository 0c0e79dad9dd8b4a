//! In-memory source table with a sharded change stream
//!
//! Every mutation appends a [`ChangeEvent`] to one shard, picked by a hash
//! of the partition key, so all changes to a key stay ordered within one
//! shard. Sequence numbers are allocated from a single table-wide counter
//! and therefore grow within every shard.
//!
//! A sealed shard accepts no more events; once a reader has drained it, the
//! read reports the end of the shard.

use crate::error::{DemoError, DemoResult};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use streamrep::{ChangeEvent, Item, SequenceNumber, ShardId};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of reading from one shard
#[derive(Debug, Clone, Default)]
pub struct ShardRead {
    /// Events after the requested position, oldest first
    pub events: Vec<ChangeEvent>,
    /// The shard is sealed and nothing is left to read after these events
    pub end_of_shard: bool,
}

#[derive(Debug)]
struct StreamShard {
    id: ShardId,
    events: Vec<ChangeEvent>,
    sealed: bool,
}

#[derive(Debug)]
struct SourceState {
    records: BTreeMap<String, Item>,
    shards: Vec<StreamShard>,
    next_sequence: u128,
}

/// Source table with change capture
#[derive(Debug)]
pub struct SourceTable {
    name: String,
    partition_attribute: String,
    state: RwLock<SourceState>,
}

impl SourceTable {
    /// Create an empty table whose stream has `shard_count` shards
    pub fn new(name: impl Into<String>, shard_count: usize) -> Self {
        let name = name.into();
        let shards = (0..shard_count.max(1))
            .map(|i| StreamShard {
                id: ShardId::new(format!("shardId-{:05}", i)),
                events: Vec::new(),
                sealed: false,
            })
            .collect();

        Self {
            name,
            partition_attribute: streamrep::config::DEFAULT_PARTITION_ATTRIBUTE.to_string(),
            state: RwLock::new(SourceState {
                records: BTreeMap::new(),
                shards,
                next_sequence: 1,
            }),
        }
    }

    pub fn with_partition_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.partition_attribute = attribute.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or overwrite an item; emits INSERT or MODIFY
    pub async fn put_item(&self, item: Item) -> DemoResult<ChangeEvent> {
        let key = match item.get(&self.partition_attribute) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(DemoError::MissingKey(self.partition_attribute.clone()));
            }
        };

        let mut state = self.state.write().await;
        let shard_index = shard_for(&key, state.shards.len());
        if state.shards[shard_index].sealed {
            return Err(DemoError::ShardSealed(state.shards[shard_index].id.clone()));
        }

        let sequence_number = SequenceNumber::new(state.next_sequence);
        state.next_sequence += 1;
        let shard_id = state.shards[shard_index].id.clone();

        let existed = state.records.insert(key.clone(), item.clone()).is_some();
        let event = if existed {
            ChangeEvent::modify(shard_id, sequence_number, key, item)
        } else {
            ChangeEvent::insert(shard_id, sequence_number, key, item)
        };

        state.shards[shard_index].events.push(event.clone());
        Ok(event)
    }

    /// Delete an item; emits REMOVE only when the item existed
    pub async fn delete_item(&self, key: &str) -> DemoResult<Option<ChangeEvent>> {
        let mut state = self.state.write().await;
        let shard_index = shard_for(key, state.shards.len());
        if state.shards[shard_index].sealed {
            return Err(DemoError::ShardSealed(state.shards[shard_index].id.clone()));
        }
        if state.records.remove(key).is_none() {
            return Ok(None);
        }

        let sequence_number = SequenceNumber::new(state.next_sequence);
        state.next_sequence += 1;
        let event = ChangeEvent::remove(
            state.shards[shard_index].id.clone(),
            sequence_number,
            key,
        );
        state.shards[shard_index].events.push(event.clone());
        Ok(Some(event))
    }

    /// Put every item, stopping at the first failure
    pub async fn put_items(&self, items: impl IntoIterator<Item = Item>) -> DemoResult<usize> {
        let mut written = 0;
        for item in items {
            self.put_item(item).await?;
            written += 1;
        }
        debug!("Wrote {} items to {}", written, self.name);
        Ok(written)
    }

    pub async fn get(&self, key: &str) -> Option<Item> {
        self.state.read().await.records.get(key).cloned()
    }

    /// All items ordered by key
    pub async fn scan(&self) -> Vec<(String, Item)> {
        self.state
            .read()
            .await
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn shard_ids(&self) -> Vec<ShardId> {
        self.state
            .read()
            .await
            .shards
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Read up to `limit` events of `shard_id` strictly after `after`
    pub async fn read_shard(
        &self,
        shard_id: &ShardId,
        after: Option<SequenceNumber>,
        limit: usize,
    ) -> DemoResult<ShardRead> {
        let state = self.state.read().await;
        let shard = state
            .shards
            .iter()
            .find(|s| &s.id == shard_id)
            .ok_or_else(|| DemoError::UnknownShard(shard_id.clone()))?;

        let start = match after {
            Some(seq) => shard.events.partition_point(|e| e.sequence_number <= seq),
            None => 0,
        };
        let end = start.saturating_add(limit.max(1)).min(shard.events.len());
        let events = shard.events[start..end].to_vec();

        Ok(ShardRead {
            end_of_shard: shard.sealed && end == shard.events.len(),
            events,
        })
    }

    /// Close every shard; readers see the end once they have drained it
    pub async fn seal_all(&self) {
        let mut state = self.state.write().await;
        for shard in &mut state.shards {
            shard.sealed = true;
        }
        info!("Sealed {} shards of {}", state.shards.len(), self.name);
    }

    /// Total number of captured events across shards
    pub async fn stream_len(&self) -> usize {
        self.state
            .read()
            .await
            .shards
            .iter()
            .map(|s| s.events.len())
            .sum()
    }
}

fn shard_for(key: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::item;
    use streamrep::EventKind;

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let table = SourceTable::new("src", 1);

        let insert = table.put_item(item(1)).await.unwrap();
        let modify = table.put_item(item(1)).await.unwrap();
        let remove = table.delete_item("1").await.unwrap().unwrap();

        assert_eq!(insert.kind, EventKind::Insert);
        assert_eq!(modify.kind, EventKind::Modify);
        assert_eq!(remove.kind, EventKind::Remove);
        assert!(insert.sequence_number < modify.sequence_number);
        assert!(modify.sequence_number < remove.sequence_number);

        // deleting a missing key emits nothing
        assert!(table.delete_item("1").await.unwrap().is_none());
        assert_eq!(table.stream_len().await, 3);
    }

    #[tokio::test]
    async fn test_key_stays_on_one_shard() {
        let table = SourceTable::new("src", 4);
        let first = table.put_item(item(42)).await.unwrap();
        for _ in 0..5 {
            let again = table.put_item(item(42)).await.unwrap();
            assert_eq!(again.shard_id, first.shard_id);
        }
    }

    #[tokio::test]
    async fn test_read_shard_pages_and_end() {
        let table = SourceTable::new("src", 1);
        for n in 0..5 {
            table.put_item(item(n)).await.unwrap();
        }
        let shard = table.shard_ids().await.remove(0);

        let page = table.read_shard(&shard, None, 3).await.unwrap();
        assert_eq!(page.events.len(), 3);
        assert!(!page.end_of_shard);

        let last = page.events.last().map(|e| e.sequence_number);
        let page = table.read_shard(&shard, last, 3).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(!page.end_of_shard);

        table.seal_all().await;
        let last = page.events.last().map(|e| e.sequence_number);
        let page = table.read_shard(&shard, last, 3).await.unwrap();
        assert!(page.events.is_empty());
        assert!(page.end_of_shard);

        assert!(matches!(
            table.put_item(item(9)).await,
            Err(DemoError::ShardSealed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_attribute() {
        let table = SourceTable::new("src", 2);
        let mut no_key = Item::new();
        no_key.insert("attribute-1".to_string(), serde_json::json!("x"));
        assert!(matches!(
            table.put_item(no_key).await,
            Err(DemoError::MissingKey(_))
        ));
    }
}
