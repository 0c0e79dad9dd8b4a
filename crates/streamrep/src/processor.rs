//! Per-shard record processor
//!
//! A processor owns one shard for the duration of one assignment and walks
//! through `Initialized -> Processing -> ShuttingDown -> Terminated`.
//!
//! Each event of a batch is applied in delivery order with a bounded retry
//! loop. Every failure of the apply path, including a panic, counts as a
//! failed attempt; when the budget is spent the event is logged and skipped
//! so the rest of the batch still gets applied.
//!
//! After events have been processed the [`CheckpointPolicy`] decides whether
//! the shard position is persisted. `Terminate` always checkpoints, `Zombie`
//! never does.

use crate::applier::{ApplyOutcome, DestinationApplier};
use crate::checkpoint::{CheckpointOutcome, CheckpointStore, Checkpointer};
use crate::config::ReplicationConfig;
use crate::error::ApplyError;
use crate::event::{ChangeEvent, SequenceNumber, ShardId};
use crate::retry::{retry, RetryBudget, Verdict};
use crate::store::DestinationStore;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// When a processor persists its shard position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// After a batch, once this much time has passed since the last checkpoint
    Interval(Duration),
    /// After every N processed events
    EveryNEvents(u64),
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::Interval(Duration::from_millis(
            crate::config::DEFAULT_CHECKPOINT_INTERVAL_MS,
        ))
    }
}

/// Why a processor is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownReason {
    /// The shard is exhausted (closed or split); checkpoint the final position
    Terminate,
    /// The lease moved to another worker; do not checkpoint
    Zombie,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("TERMINATE"),
            Self::Zombie => f.write_str("ZOMBIE"),
        }
    }
}

/// Lifecycle phase of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorPhase {
    Initialized,
    Processing,
    ShuttingDown,
    Terminated,
}

/// Shard-local state, created on initialize and dropped with the processor
#[derive(Debug, Clone)]
pub struct ProcessorState {
    pub shard_id: ShardId,
    pub phase: ProcessorPhase,
    /// Events processed (applied, ignored or skipped) since initialize
    pub processed_events: u64,
    /// Sequence number of the last processed event, or the resume position
    pub last_sequence: Option<SequenceNumber>,
    pub next_checkpoint_deadline: Instant,
}

/// Counters of one processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Events written or deleted
    pub applied: u64,
    /// Events dropped after every attempt failed
    pub skipped: u64,
    /// Failed apply attempts, including those later retried successfully
    pub failed_attempts: u64,
    /// Events whose kind is not replicated
    pub ignored: u64,
    pub checkpoints_saved: u64,
    pub checkpoints_abandoned: u64,
}

/// Per-shard callbacks driven by the shard coordination layer.
///
/// Calls for one shard are strictly sequential: `process_records` returns
/// before the next batch is delivered, and `shutdown` comes last.
#[async_trait]
pub trait RecordProcessor: Send {
    /// Take ownership of `shard_id`, resuming after `resume_from` if set
    async fn initialize(&mut self, shard_id: ShardId, resume_from: Option<SequenceNumber>);

    /// Process an ordered batch; never fails
    async fn process_records(&mut self, batch: Vec<ChangeEvent>);

    /// Release the shard
    async fn shutdown(&mut self, reason: ShutdownReason);
}

/// Creates one processor per shard assignment
pub trait ProcessorFactory: Send + Sync + 'static {
    type Processor: RecordProcessor + 'static;

    fn create_processor(&self) -> Self::Processor;
}

/// Replicates change events into a destination table
pub struct ReplicatingProcessor {
    applier: DestinationApplier,
    checkpoint_store: Arc<dyn CheckpointStore>,
    budget: RetryBudget,
    policy: CheckpointPolicy,
    state: Option<ProcessorState>,
    checkpointer: Option<Checkpointer>,
    stats: ProcessorStats,
    span: Span,
}

impl fmt::Debug for ReplicatingProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatingProcessor")
            .field("applier", &self.applier)
            .field("budget", &self.budget)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ReplicatingProcessor {
    pub fn new(applier: DestinationApplier, checkpoint_store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            applier,
            checkpoint_store,
            budget: RetryBudget::default(),
            policy: CheckpointPolicy::default(),
            state: None,
            checkpointer: None,
            stats: ProcessorStats::default(),
            span: Span::none(),
        }
    }

    /// Build a processor with the budget and checkpoint policy of `config`
    pub fn from_config(
        applier: DestinationApplier,
        checkpoint_store: Arc<dyn CheckpointStore>,
        config: &ReplicationConfig,
    ) -> Self {
        Self::new(applier, checkpoint_store)
            .with_retry_budget(config.retry_budget())
            .with_checkpoint_policy(config.checkpoint_policy())
    }

    pub fn with_retry_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }

    pub fn state(&self) -> Option<&ProcessorState> {
        self.state.as_ref()
    }

    /// Current phase, `None` before initialize
    pub fn phase(&self) -> Option<ProcessorPhase> {
        self.state.as_ref().map(|s| s.phase)
    }

    async fn initialize_shard(&mut self, shard_id: ShardId, resume_from: Option<SequenceNumber>) {
        if let Some(state) = &self.state {
            warn!(
                "Processor already initialized for shard {}, ignoring initialize",
                state.shard_id
            );
            return;
        }

        match resume_from {
            Some(seq) => info!("Initializing record processor, resuming after {}", seq),
            None => info!("Initializing record processor from the start of the shard"),
        }

        self.checkpointer = Some(
            Checkpointer::new(shard_id.clone(), self.checkpoint_store.clone(), self.budget)
                .resume_from(resume_from),
        );
        self.state = Some(ProcessorState {
            shard_id,
            phase: ProcessorPhase::Initialized,
            processed_events: 0,
            last_sequence: resume_from,
            // already due: the first batch checkpoints, later ones are spaced
            next_checkpoint_deadline: Instant::now(),
        });
    }

    async fn process_batch(&mut self, batch: Vec<ChangeEvent>) {
        let phase = match &mut self.state {
            None => {
                warn!(
                    "Received {} records before initialize, dropping them",
                    batch.len()
                );
                return;
            }
            Some(state) => {
                if matches!(
                    state.phase,
                    ProcessorPhase::Initialized | ProcessorPhase::Processing
                ) {
                    state.phase = ProcessorPhase::Processing;
                }
                state.phase
            }
        };

        if phase != ProcessorPhase::Processing {
            warn!(
                "Received {} records while {:?}, dropping them",
                batch.len(),
                phase
            );
            return;
        }

        debug!("Processing {} records", batch.len());

        for event in &batch {
            self.process_event(event).await;

            let Some(state) = &mut self.state else {
                continue;
            };
            state.processed_events += 1;
            state.last_sequence = Some(event.sequence_number);

            if let CheckpointPolicy::EveryNEvents(n) = self.policy {
                if state.processed_events % n.max(1) == 0 {
                    self.checkpoint(event.sequence_number).await;
                }
            }
        }

        if let CheckpointPolicy::Interval(interval) = self.policy {
            let due = self
                .state
                .as_ref()
                .filter(|state| Instant::now() >= state.next_checkpoint_deadline)
                .and_then(|state| state.last_sequence);
            if let Some(seq) = due {
                self.checkpoint(seq).await;
                if let Some(state) = &mut self.state {
                    state.next_checkpoint_deadline = Instant::now() + interval;
                }
            }
        }
    }

    /// Apply one event with retries; skip it when the budget is spent
    async fn process_event(&mut self, event: &ChangeEvent) {
        let applier = &self.applier;
        let max_attempts = self.budget.max_attempts;

        let result = retry(
            &self.budget,
            |_: &ApplyError| Verdict::Retry,
            |attempt: u32, e: &ApplyError| {
                if e.is_retryable() {
                    warn!(
                        "Attempt {} of {} failed for {}: {}",
                        attempt, max_attempts, event, e
                    );
                } else {
                    warn!(
                        "Attempt {} of {} failed for {} with a non-transient error: {}",
                        attempt, max_attempts, event, e
                    );
                }
            },
            move |_| async move {
                match AssertUnwindSafe(applier.apply(event)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(ApplyError::Panicked(panic_message(panic.as_ref()))),
                }
            },
        )
        .await;

        self.stats.failed_attempts += u64::from(result.attempts) - u64::from(result.is_success());

        match result.result {
            Some(ApplyOutcome::Ignored) => {
                debug!("Ignoring {}", event);
                self.stats.ignored += 1;
            }
            Some(_) => self.stats.applied += 1,
            None => {
                error!(
                    "Couldn't process record {} after {} attempts. Skipping the record.",
                    event, result.attempts
                );
                self.stats.skipped += 1;
            }
        }
    }

    async fn checkpoint(&mut self, seq: SequenceNumber) {
        let Some(checkpointer) = self.checkpointer.as_mut() else {
            return;
        };
        match checkpointer.checkpoint(seq).await {
            CheckpointOutcome::Saved { .. } => self.stats.checkpoints_saved += 1,
            CheckpointOutcome::Abandoned { .. } => self.stats.checkpoints_abandoned += 1,
            CheckpointOutcome::Stale => {}
        }
    }

    async fn shutdown_shard(&mut self, reason: ShutdownReason) {
        let last_sequence = match &mut self.state {
            None => {
                warn!("Shutdown ({}) requested before initialize", reason);
                return;
            }
            Some(state) if state.phase == ProcessorPhase::Terminated => {
                warn!("Shutdown ({}) requested for a terminated processor", reason);
                return;
            }
            Some(state) => {
                state.phase = ProcessorPhase::ShuttingDown;
                state.last_sequence
            }
        };

        info!("Shutting down record processor: {}", reason);

        match (reason, last_sequence) {
            (ShutdownReason::Terminate, Some(seq)) => self.checkpoint(seq).await,
            (ShutdownReason::Terminate, None) => {
                info!("Nothing processed on this shard, no final checkpoint");
            }
            (ShutdownReason::Zombie, _) => {
                debug!("Lease lost, skipping final checkpoint");
            }
        }

        if let Some(state) = &mut self.state {
            state.phase = ProcessorPhase::Terminated;
        }

        let stats = self.stats;
        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            failed_attempts = stats.failed_attempts,
            ignored = stats.ignored,
            checkpoints_saved = stats.checkpoints_saved,
            checkpoints_abandoned = stats.checkpoints_abandoned,
            "Record processor terminated"
        );
    }
}

#[async_trait]
impl RecordProcessor for ReplicatingProcessor {
    async fn initialize(&mut self, shard_id: ShardId, resume_from: Option<SequenceNumber>) {
        if self.state.is_none() {
            self.span = info_span!("shard", shard_id = %shard_id);
        }
        let span = self.span.clone();
        self.initialize_shard(shard_id, resume_from)
            .instrument(span)
            .await
    }

    async fn process_records(&mut self, batch: Vec<ChangeEvent>) {
        let span = self.span.clone();
        self.process_batch(batch).instrument(span).await
    }

    async fn shutdown(&mut self, reason: ShutdownReason) {
        let span = self.span.clone();
        self.shutdown_shard(reason).instrument(span).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Builds a [`ReplicatingProcessor`] per shard, all writing to one table
pub struct ReplicatingProcessorFactory {
    store: Arc<dyn DestinationStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    table: String,
    config: ReplicationConfig,
}

impl ReplicatingProcessorFactory {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        table: impl Into<String>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            store,
            checkpoint_store,
            table: table.into(),
            config,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }
}

impl ProcessorFactory for ReplicatingProcessorFactory {
    type Processor = ReplicatingProcessor;

    fn create_processor(&self) -> ReplicatingProcessor {
        let applier = DestinationApplier::new(
            self.store.clone(),
            self.table.clone(),
            self.config.partition_attribute.clone(),
        )
        .with_delete_policy(self.config.delete_policy);

        ReplicatingProcessor::from_config(applier, self.checkpoint_store.clone(), &self.config)
    }
}
