//! Engine configuration.
//!
//! Every field has a default, so a partial TOML table is enough:
//!
//! ```toml
//! max_workers = 32
//! direction = "download"
//! checkpoint_location = "/var/lib/moldata/pdb.json"
//!
//! [shards]
//! shard_size = 1000
//! shard_dir = "/scratch/_shards"
//! key_prefix = "pdb/"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::shard::ShardConfig;
use crate::unit::Direction;

/// Tunables of one [`TransferEngine`](crate::TransferEngine) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Units in flight at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Units per checkpoint flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Limit on a single storage operation (0 = none).
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    /// Keep local files after a successful run instead of cleaning up.
    #[serde(default)]
    pub keep_local: bool,

    /// Treat units whose destination already holds the data as done.
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    #[serde(default)]
    pub direction: Direction,

    #[serde(default = "default_checkpoint_location")]
    pub checkpoint_location: PathBuf,

    /// Pack completed files into tar shards after the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<ShardConfig>,
}

fn default_max_workers() -> usize {
    16
}

fn default_batch_size() -> usize {
    500
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_op_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_location() -> PathBuf {
    PathBuf::from("checkpoints/transfer.json")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_true(),
            op_timeout_secs: default_op_timeout_secs(),
            keep_local: false,
            skip_existing: default_true(),
            direction: Direction::default(),
            checkpoint_location: default_checkpoint_location(),
            shards: None,
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }

    /// `None` when operations run without a time limit.
    pub fn op_timeout(&self) -> Option<Duration> {
        (self.op_timeout_secs > 0).then(|| Duration::from_secs(self.op_timeout_secs))
    }
}
