//! Demo data set and table comparison

use crate::error::DemoResult;
use crate::source::SourceTable;
use serde_json::json;
use streamrep::{Item, MemoryStore};
use tracing::debug;

/// The demo record for key `n`: `{p: "<n>", attribute-1: "le gris <n>"}`
pub fn item(n: u64) -> Item {
    let mut item = Item::new();
    item.insert("p".to_string(), json!(n.to_string()));
    item.insert("attribute-1".to_string(), json!(format!("le gris {}", n)));
    item
}

/// Demo records for keys `from..to`
pub fn generate_items(from: u64, to: u64) -> Vec<Item> {
    (from..to).map(item).collect()
}

/// Whether two scans hold the same records, ignoring order
pub fn tables_equal(source: &[(String, Item)], destination: &[(String, Item)]) -> bool {
    if source.len() != destination.len() {
        return false;
    }
    let mut source: Vec<_> = source.iter().collect();
    let mut destination: Vec<_> = destination.iter().collect();
    source.sort_by(|a, b| a.0.cmp(&b.0));
    destination.sort_by(|a, b| a.0.cmp(&b.0));
    source == destination
}

/// Scan both tables and compare them
pub async fn compare_tables(
    source: &SourceTable,
    destination: &MemoryStore,
    destination_table: &str,
) -> DemoResult<bool> {
    let source_rows = source.scan().await;
    let destination_rows = destination.scan(destination_table).await?;
    debug!(
        "Comparing {} source rows with {} destination rows",
        source_rows.len(),
        destination_rows.len()
    );
    Ok(tables_equal(&source_rows, &destination_rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_items() {
        let items = generate_items(3, 6);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].get("p"), Some(&json!("3")));
        assert_eq!(items[2].get("attribute-1"), Some(&json!("le gris 5")));
        assert!(generate_items(5, 5).is_empty());
    }

    #[test]
    fn test_tables_equal() {
        let a = vec![("1".to_string(), item(1)), ("2".to_string(), item(2))];
        let b = vec![("2".to_string(), item(2)), ("1".to_string(), item(1))];
        assert!(tables_equal(&a, &b));

        let c = vec![("1".to_string(), item(1)), ("2".to_string(), item(3))];
        assert!(!tables_equal(&a, &c));
        assert!(!tables_equal(&a, &a[..1]));
    }
}
