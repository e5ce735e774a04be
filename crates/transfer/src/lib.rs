//! Resumable parallel transfer engine.
//!
//! Moves large numbers of independent files through a
//! [`StorageBackend`](moldata_storage::StorageBackend) with bounded
//! concurrency, per-unit retry and a checkpoint flushed after every batch.
//! A rerun with the same checkpoint never re-attempts completed units.
//!
//! ```text
//! units ─▶ Batcher ─▶ WorkerPool ─▶ merge + flush ─▶ … ─▶ shards ─▶ cleanup
//!            ▲                             │
//!            └──────── Checkpoint ◀────────┘
//! ```

mod attempt;
mod batcher;
mod checkpoint;
mod cleanup;
mod config;
mod engine;
mod error;
mod pool;
mod progress;
mod retry;
mod shard;
mod unit;

pub use attempt::{AttemptResult, AttemptStatus};
pub use batcher::{Batch, Batcher};
pub use checkpoint::{Checkpoint, CheckpointStore, FailedUnit, MergeStats};
pub use cleanup::{cleanup_targets, remove_local_files};
pub use config::EngineConfig;
pub use engine::{RunSummary, TransferEngine};
pub use error::{CheckpointError, EngineError, ShardError, UnitError};
pub use pool::{BatchReport, WorkerPool};
pub use progress::{RateMeter, TransferEvent};
pub use retry::{RetryDecision, RetryPolicy};
pub use shard::{ShardConfig, ShardPacker, ShardReport};
pub use unit::{Direction, TransferUnit, UnitId};
