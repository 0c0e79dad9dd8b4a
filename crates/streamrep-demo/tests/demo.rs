//! Source table to destination table through the poller and controller

use std::sync::Arc;
use std::time::Duration;
use streamrep::{
    CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, MemoryStore,
    ReplicatingProcessorFactory, ReplicationConfig, ShardController,
};
use streamrep_demo::{
    compare_tables, generate_items, item, PollerConfig, ShardEnd, ShardPoller, SourceTable,
};

const DEST: &str = "KCL-Demo-dest";

fn poller_config() -> PollerConfig {
    PollerConfig {
        batch_size: 7,
        idle_between_reads: Duration::from_millis(5),
    }
}

fn poller(
    source: &Arc<SourceTable>,
    destination: &Arc<MemoryStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ReplicationConfig,
) -> ShardPoller<ReplicatingProcessorFactory> {
    let factory =
        ReplicatingProcessorFactory::new(destination.clone(), checkpoints.clone(), DEST, config);
    ShardPoller::new(
        source.clone(),
        Arc::new(ShardController::new(factory)),
        checkpoints,
        poller_config(),
    )
}

#[tokio::test]
async fn replicates_inserts_updates_and_deletes() {
    let source = Arc::new(SourceTable::new("KCL-Demo", 4));
    let destination = Arc::new(MemoryStore::with_tables([DEST]));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let mut poller = poller(
        &source,
        &destination,
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(10),
    );
    poller.start().await.unwrap();

    source.put_items(generate_items(0, 100)).await.unwrap();
    for n in (0..100).step_by(3) {
        let mut changed = item(n);
        changed.insert("attribute-1".to_string(), serde_json::json!("changed"));
        source.put_item(changed).await.unwrap();
    }
    for n in (0..100).step_by(5) {
        source.delete_item(&n.to_string()).await.unwrap();
    }

    source.seal_all().await;
    let ends = poller.join().await;

    assert_eq!(ends.len(), 4);
    assert!(ends.iter().all(|(_, end)| *end == ShardEnd::Terminated));
    assert_eq!(destination.count(DEST).await, 80);
    assert!(compare_tables(&source, &destination, DEST).await.unwrap());

    // every shard got a final checkpoint at its last event
    assert_eq!(checkpoints.positions().await.len(), 4);
}

#[tokio::test]
async fn stop_shuts_shards_down_without_final_checkpoint() {
    let source = Arc::new(SourceTable::new("KCL-Demo", 2));
    let destination = Arc::new(MemoryStore::with_tables([DEST]));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let mut poller = poller(
        &source,
        &destination,
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(1000),
    );
    poller.start().await.unwrap();
    source.put_items(generate_items(0, 10)).await.unwrap();

    while destination.count(DEST).await < 10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let ends = poller.stop().await;
    assert!(ends.iter().all(|(_, end)| *end == ShardEnd::Stopped));
    // count policy has not fired yet and zombies never checkpoint
    assert_eq!(checkpoints.save_count(), 0);
}

#[tokio::test]
async fn restart_resumes_from_file_checkpoints() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = Arc::new(SourceTable::new("KCL-Demo", 3));
    let destination = Arc::new(MemoryStore::with_tables([DEST]));
    source.put_items(generate_items(0, 50)).await.unwrap();

    {
        let checkpoints = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
        let mut poller = poller(
            &source,
            &destination,
            checkpoints,
            ReplicationConfig::default().with_checkpoint_every(1),
        );
        poller.start().await.unwrap();
        while destination.count(DEST).await < 50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        poller.stop().await;
    }

    // changes made while nobody was replicating
    source.put_items(generate_items(50, 60)).await.unwrap();
    source.delete_item("7").await.unwrap();

    let checkpoints = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
    let mut poller = poller(
        &source,
        &destination,
        checkpoints,
        ReplicationConfig::default().with_checkpoint_every(1),
    );
    poller.start().await.unwrap();
    source.seal_all().await;
    let ends = poller.join().await;

    assert!(ends.iter().all(|(_, end)| *end == ShardEnd::Terminated));
    assert_eq!(destination.count(DEST).await, 59);
    assert!(compare_tables(&source, &destination, DEST).await.unwrap());
}
