//! Replication configuration
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! max_retry_attempts: 10
//! retry_backoff_ms: 3000
//! checkpoint:
//!   interval_millis: 60000     # or: every_n_events: 10
//! partition_attribute: p
//! delete_policy: apply
//! ```

use crate::error::{ReplicationError, Result};
use crate::processor::CheckpointPolicy;
use crate::retry::RetryBudget;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 3000;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_CHECKPOINT_EVERY_N_EVENTS: u64 = 10;
pub const DEFAULT_PARTITION_ATTRIBUTE: &str = "p";

/// Root configuration of a replicating processor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    /// Attempts per event and per checkpoint (including the first)
    #[serde(default = "default_max_retry_attempts")]
    #[validate(range(min = 1, max = 1000))]
    pub max_retry_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    #[validate(range(max = 600_000))]
    pub retry_backoff_ms: u64,

    /// When to persist the shard position; exactly one trigger is active
    #[serde(default)]
    pub checkpoint: CheckpointTrigger,

    /// Name of the partition key attribute in record images
    #[serde(default = "default_partition_attribute")]
    #[validate(length(min = 1, max = 255))]
    pub partition_attribute: String,

    /// What to do with REMOVE events
    #[serde(default)]
    pub delete_policy: DeletePolicy,
}

/// Checkpoint trigger as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTrigger {
    /// Checkpoint after a batch once this many milliseconds have passed
    IntervalMillis(u64),
    /// Checkpoint after every N processed events
    EveryNEvents(u64),
}

impl Default for CheckpointTrigger {
    fn default() -> Self {
        Self::IntervalMillis(DEFAULT_CHECKPOINT_INTERVAL_MS)
    }
}

/// Handling of REMOVE events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Delete the record from the destination
    #[default]
    Apply,
    /// Leave the destination untouched (legacy behaviour, loses deletes)
    Ignore,
}

fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_partition_attribute() -> String {
    DEFAULT_PARTITION_ATTRIBUTE.to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            checkpoint: CheckpointTrigger::default(),
            partition_attribute: default_partition_attribute(),
            delete_policy: DeletePolicy::default(),
        }
    }
}

impl ReplicationConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ReplicationError::config(format!("failed to parse config: {}", e)))?;

        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate field ranges and the checkpoint trigger
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ReplicationError::config(e.to_string()))?;

        match self.checkpoint {
            CheckpointTrigger::IntervalMillis(0) => Err(ReplicationError::config(
                "checkpoint.interval_millis must be greater than zero",
            )),
            CheckpointTrigger::EveryNEvents(0) => Err(ReplicationError::config(
                "checkpoint.every_n_events must be greater than zero",
            )),
            _ => Ok(()),
        }
    }

    /// Use the count-based checkpoint trigger
    pub fn with_checkpoint_every(mut self, events: u64) -> Self {
        self.checkpoint = CheckpointTrigger::EveryNEvents(events);
        self
    }

    /// Use the time-based checkpoint trigger
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint = CheckpointTrigger::IntervalMillis(saturating_millis(interval));
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_retry_attempts = max_attempts;
        self.retry_backoff_ms = saturating_millis(backoff);
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Retry budget shared by event application and checkpointing
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(
            self.max_retry_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }

    /// Active checkpoint policy
    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        match self.checkpoint {
            CheckpointTrigger::IntervalMillis(ms) => {
                CheckpointPolicy::Interval(Duration::from_millis(ms))
            }
            CheckpointTrigger::EveryNEvents(n) => CheckpointPolicy::EveryNEvents(n),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
