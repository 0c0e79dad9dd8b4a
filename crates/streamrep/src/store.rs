//! Destination store abstraction
//!
//! The table storage engine is treated as a key/value store with put and
//! delete. [`MemoryStore`] is a complete in-process implementation used by
//! the demo and the tests.

use crate::error::{StoreError, StoreResult};
use crate::event::Item;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Write side of the destination table store
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Insert or fully overwrite the record stored under `key`
    async fn put_record(&self, table: &str, key: &str, item: Item) -> StoreResult<()>;

    /// Delete the record stored under `key`; a missing key is not an error
    async fn delete_record(&self, table: &str, key: &str) -> StoreResult<()>;
}

/// In-memory table store.
///
/// Tables must be created before use, like a real table service; writes to
/// an unknown table fail with [`StoreError::Validation`]. Records are kept
/// ordered by key so scans are deterministic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Item>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with the given (empty) tables
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(|name| (name.into(), BTreeMap::new()))
            .collect();
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Create a table. Returns false if it already existed.
    pub async fn create_table(&self, table: &str) -> bool {
        let mut tables = self.tables.write().await;
        if tables.contains_key(table) {
            return false;
        }
        tables.insert(table.to_string(), BTreeMap::new());
        debug!("Created table {}", table);
        true
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.tables.read().await.contains_key(table)
    }

    /// Fetch a single record
    pub async fn get(&self, table: &str, key: &str) -> Option<Item> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|records| records.get(key).cloned())
    }

    /// All records of a table ordered by key
    pub async fn scan(&self, table: &str) -> StoreResult<Vec<(String, Item)>> {
        let tables = self.tables.read().await;
        let records = tables
            .get(table)
            .ok_or_else(|| StoreError::validation(format!("table '{}' not found", table)))?;
        Ok(records
            .iter()
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect())
    }

    /// Number of records in a table (0 for an unknown table)
    pub async fn count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn put_record(&self, table: &str, key: &str, item: Item) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let records = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::validation(format!("table '{}' not found", table)))?;
        records.insert(key.to_string(), item);
        Ok(())
    }

    async fn delete_record(&self, table: &str, key: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let records = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::validation(format!("table '{}' not found", table)))?;
        records.remove(key);
        Ok(())
    }
}
