//! Run monitoring
//!
//! The pipeline reports one event per item and per committed batch through the
//! [`Monitor`] trait. It never reads anything back.

pub mod stats;

pub use stats::{print_checkpoint_progress, print_statistics, RunStatistics};

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

/// Outcome reported for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOutcome {
    /// Profile fetched and written to the edge store
    Processed,

    /// Edge already existed; nothing written
    Skipped,

    /// Profile-local failure; the run moved on
    Error,

    /// A whole batch was committed to the checkpoint
    BatchCommitted,

    /// The run handed off to a healing restart
    Healing,
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::BatchCommitted => "batch-committed",
            Self::Healing => "healing",
        };
        f.write_str(s)
    }
}

/// One-way sink for run events
pub trait Monitor: Send + Sync {
    fn record_event(
        &self,
        run_id: &str,
        identifier: &str,
        outcome: EventOutcome,
        metadata: &serde_json::Value,
    );
}

/// Monitor that logs every event and keeps counters
pub struct TracingMonitor {
    started: Instant,
    counters: Mutex<RunStatistics>,
}

impl TracingMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(RunStatistics::default()),
        }
    }

    /// Snapshot of the counters, with elapsed time filled in
    pub fn statistics(&self) -> RunStatistics {
        let mut stats = match self.counters.lock() {
            Ok(counters) => counters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stats.elapsed = self.started.elapsed();
        stats
    }
}

impl Default for TracingMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for TracingMonitor {
    fn record_event(
        &self,
        run_id: &str,
        identifier: &str,
        outcome: EventOutcome,
        metadata: &serde_json::Value,
    ) {
        match outcome {
            EventOutcome::Error => {
                tracing::warn!(run = run_id, %outcome, "{} {}", identifier, metadata)
            }
            EventOutcome::BatchCommitted | EventOutcome::Healing => {
                tracing::info!(run = run_id, %outcome, "{} {}", identifier, metadata)
            }
            _ => tracing::debug!(run = run_id, %outcome, "{}", identifier),
        }

        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };
        counters.record(outcome);
    }
}
