//! End-to-end replication scenarios through the shard controller
//!
//! Run with:
//!   cargo test -p streamrep --test replication

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamrep::{
    ChangeEvent, CheckpointError, CheckpointStore, FileCheckpointStore, Item,
    MemoryCheckpointStore, MemoryStore, ReplicatingProcessorFactory, ReplicationConfig,
    SequenceNumber, ShardController, ShardId, ShardPosition, ShutdownReason,
};

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn image(p: &str, val: &str) -> Item {
    let mut item = Item::new();
    item.insert("p".to_string(), json!(p));
    item.insert("attribute-1".to_string(), json!(val));
    item
}

fn setup(
    checkpoints: Arc<dyn CheckpointStore>,
    config: ReplicationConfig,
) -> (Arc<MemoryStore>, ShardController<ReplicatingProcessorFactory>) {
    let store = Arc::new(MemoryStore::with_tables(["dest"]));
    let factory = ReplicatingProcessorFactory::new(store.clone(), checkpoints, "dest", config);
    (store, ShardController::new(factory))
}

/// Throttles the first `failures` saves; tracks concurrent saves per shard
#[derive(Default)]
struct ThrottlingCheckpointStore {
    inner: MemoryCheckpointStore,
    failures: u32,
    calls: AtomicU32,
    save_delay: Duration,
    in_flight: Mutex<HashMap<ShardId, u32>>,
    max_in_flight: AtomicU32,
}

impl ThrottlingCheckpointStore {
    fn throttling(failures: u32) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    fn slow(save_delay: Duration) -> Self {
        Self {
            save_delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl CheckpointStore for ThrottlingCheckpointStore {
    async fn save_checkpoint(
        &self,
        shard_id: &ShardId,
        position: &ShardPosition,
    ) -> Result<(), CheckpointError> {
        let concurrent = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(shard_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

        if !self.save_delay.is_zero() {
            tokio::time::sleep(self.save_delay).await;
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if call < self.failures {
            Err(CheckpointError::throttled("rate exceeded"))
        } else {
            self.inner.save_checkpoint(shard_id, position).await
        };

        if let Some(count) = self.in_flight.lock().unwrap().get_mut(shard_id) {
            *count -= 1;
        }
        result
    }

    async fn load_checkpoint(
        &self,
        shard_id: &ShardId,
    ) -> Result<Option<ShardPosition>, CheckpointError> {
        self.inner.load_checkpoint(shard_id).await
    }
}

#[tokio::test]
async fn insert_modify_remove_leaves_no_record() {
    init_test_logging();
    let (store, controller) = setup(
        Arc::new(MemoryCheckpointStore::new()),
        ReplicationConfig::default(),
    );
    let shard: ShardId = "shard-0".into();

    controller.initialize(shard.clone(), None).await.unwrap();
    controller
        .deliver_batch(
            &shard,
            vec![
                ChangeEvent::insert("shard-0", 1u128, "1", image("1", "A")),
                ChangeEvent::modify("shard-0", 2u128, "1", image("1", "B")),
                ChangeEvent::remove("shard-0", 3u128, "1"),
            ],
        )
        .await
        .unwrap();

    assert!(store.get("dest", "1").await.is_none());
    assert_eq!(store.count("dest").await, 0);
    controller.shutdown_all(ShutdownReason::Terminate).await;
}

#[tokio::test]
async fn duplicate_delivery_yields_one_record() {
    init_test_logging();
    let (store, controller) = setup(
        Arc::new(MemoryCheckpointStore::new()),
        ReplicationConfig::default(),
    );
    let shard: ShardId = "shard-0".into();
    let batch = vec![ChangeEvent::insert("shard-0", 7u128, "2", image("2", "X"))];

    controller.initialize(shard.clone(), None).await.unwrap();
    controller.deliver_batch(&shard, batch.clone()).await.unwrap();
    controller.deliver_batch(&shard, batch).await.unwrap();

    let rows = store.scan("dest").await.unwrap();
    assert_eq!(rows, vec![("2".to_string(), image("2", "X"))]);
    controller.shutdown_all(ShutdownReason::Zombie).await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_succeeds_after_nine_throttles() {
    init_test_logging();
    let checkpoints = Arc::new(ThrottlingCheckpointStore::throttling(9));
    let (_store, controller) = setup(
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(1),
    );
    let shard: ShardId = "shard-0".into();

    controller.initialize(shard.clone(), None).await.unwrap();
    controller
        .deliver_batch(
            &shard,
            vec![ChangeEvent::insert("shard-0", 1u128, "1", image("1", "A"))],
        )
        .await
        .unwrap();

    assert_eq!(checkpoints.calls.load(Ordering::SeqCst), 10);
    let saved = checkpoints.load_checkpoint(&shard).await.unwrap();
    assert_eq!(
        saved.map(|p| p.sequence_number),
        Some(SequenceNumber::new(1))
    );
    controller.shutdown_all(ShutdownReason::Zombie).await;
}

#[tokio::test(start_paused = true)]
async fn checkpoint_abandoned_after_eleven_throttles_processing_continues() {
    init_test_logging();
    let checkpoints = Arc::new(ThrottlingCheckpointStore::throttling(11));
    let (store, controller) = setup(
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(1),
    );
    let shard: ShardId = "shard-0".into();

    controller.initialize(shard.clone(), None).await.unwrap();
    controller
        .deliver_batch(
            &shard,
            vec![ChangeEvent::insert("shard-0", 1u128, "1", image("1", "A"))],
        )
        .await
        .unwrap();

    // budget of ten spent, nothing saved
    assert_eq!(checkpoints.calls.load(Ordering::SeqCst), 10);
    assert!(checkpoints.load_checkpoint(&shard).await.unwrap().is_none());

    controller
        .deliver_batch(
            &shard,
            vec![ChangeEvent::insert("shard-0", 2u128, "2", image("2", "B"))],
        )
        .await
        .unwrap();

    assert!(store.get("dest", "2").await.is_some());
    let saved = checkpoints.load_checkpoint(&shard).await.unwrap();
    assert_eq!(
        saved.map(|p| p.sequence_number),
        Some(SequenceNumber::new(2))
    );
    controller.shutdown_all(ShutdownReason::Zombie).await;
}

#[tokio::test(start_paused = true)]
async fn checkpoints_never_overlap_within_a_shard() {
    init_test_logging();
    let checkpoints = Arc::new(ThrottlingCheckpointStore::slow(Duration::from_millis(50)));
    let (_store, controller) = setup(
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(1),
    );
    let controller = Arc::new(controller);
    let shards: Vec<ShardId> = (0..3).map(|i| ShardId::new(format!("shard-{}", i))).collect();

    for shard in &shards {
        controller.initialize(shard.clone(), None).await.unwrap();
    }

    let mut tasks = Vec::new();
    for shard in shards.clone() {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            for seq in 1..=5u128 {
                let key = format!("{}-{}", shard, seq);
                let batch = vec![
                    ChangeEvent::insert(shard.clone(), seq * 2, key.clone(), image(&key, "A")),
                    ChangeEvent::remove(shard.clone(), seq * 2 + 1, key),
                ];
                controller.deliver_batch(&shard, batch).await.unwrap();
            }
            controller
                .notify_shutdown(&shard, ShutdownReason::Terminate)
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(checkpoints.max_in_flight.load(Ordering::SeqCst), 1);
    for shard in &shards {
        let saved = checkpoints.load_checkpoint(shard).await.unwrap();
        assert_eq!(
            saved.map(|p| p.sequence_number),
            Some(SequenceNumber::new(11))
        );
    }
}

#[tokio::test]
async fn lost_lease_skips_checkpoint_and_keeps_applying() {
    init_test_logging();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (store, controller) = setup(
        checkpoints.clone(),
        ReplicationConfig::default().with_checkpoint_every(1),
    );
    let shard: ShardId = "shard-0".into();
    checkpoints.revoke(&shard).await;

    controller.initialize(shard.clone(), None).await.unwrap();
    controller
        .deliver_batch(
            &shard,
            vec![
                ChangeEvent::insert("shard-0", 1u128, "1", image("1", "A")),
                ChangeEvent::insert("shard-0", 2u128, "2", image("2", "B")),
            ],
        )
        .await
        .unwrap();

    assert_eq!(store.count("dest").await, 2);
    assert_eq!(checkpoints.save_count(), 0);
    controller.shutdown_all(ShutdownReason::Zombie).await;
}

#[tokio::test]
async fn resume_from_file_checkpoint_after_restart() {
    init_test_logging();
    let dir = tempfile::TempDir::new().unwrap();
    let shard: ShardId = "shard-0".into();

    {
        let checkpoints = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
        let (_store, controller) = setup(checkpoints, ReplicationConfig::default());
        controller.initialize(shard.clone(), None).await.unwrap();
        controller
            .deliver_batch(
                &shard,
                (1..=4u128)
                    .map(|n| {
                        let key = n.to_string();
                        ChangeEvent::insert("shard-0", n, key.clone(), image(&key, "A"))
                    })
                    .collect(),
            )
            .await
            .unwrap();
        // shard end forces the final checkpoint
        controller
            .notify_shutdown(&shard, ShutdownReason::Terminate)
            .await
            .unwrap();
    }

    let checkpoints = FileCheckpointStore::open(dir.path()).await.unwrap();
    let position = checkpoints.load_checkpoint(&shard).await.unwrap().unwrap();
    assert_eq!(position.sequence_number, SequenceNumber::new(4));
}
