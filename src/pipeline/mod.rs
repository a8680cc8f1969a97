//! Batch ingestion pipeline
//!
//! This module drives one run through its single shape:
//! - Authenticate the automation session once
//! - For each category, enumerate profiles into checkpointed batches
//! - For each incomplete batch, process every unprocessed profile
//! - Commit each batch to the checkpoint before moving on
//! - Sweep message history once every category is done
//!
//! A failed run never retries itself. It comes back as a healing plan for the
//! supervisor, or as an error.

mod batch;
mod history;
mod orchestrator;

pub use batch::{BatchResult, ItemOutcome, ItemStatus};
pub use orchestrator::{Flow, Orchestrator};

use crate::checkpoint::CheckpointStore;
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::monitor::EventOutcome;
use crate::recovery::{HealingPlan, RecoveryController};
use crate::state::{validate, ActionBudgetGuard, RunState};
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Pipeline knobs taken from configuration
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub inter_batch_delay_min: Duration,
    pub inter_batch_delay_max: Duration,
    pub history_enabled: bool,

    /// Hash of the configuration, recorded on new checkpoints
    pub config_hash: Option<String>,

    /// Run-state file rewritten after the index is created and after each commit
    pub state_file: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config, config_hash: Option<String>) -> Self {
        Self {
            inter_batch_delay_min: Duration::from_millis(config.pipeline.inter_batch_delay_min_ms),
            inter_batch_delay_max: Duration::from_millis(config.pipeline.inter_batch_delay_max_ms),
            history_enabled: config.history.enabled,
            config_hash,
            state_file: Some(config.checkpoint.state_path.clone()),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inter_batch_delay_min: Duration::ZERO,
            inter_batch_delay_max: Duration::ZERO,
            history_enabled: true,
            config_hash: None,
            state_file: None,
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run state at completion
    pub state: RunState,

    /// Batches committed during this invocation
    pub batches: Vec<BatchResult>,

    /// Edges updated by the history sweep
    pub history_written: usize,

    pub ingested: usize,
    pub ingest_failures: usize,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.batches.iter().map(BatchResult::processed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.batches.iter().map(BatchResult::skipped).sum()
    }

    pub fn errors(&self) -> usize {
        self.batches.iter().map(BatchResult::errors).sum()
    }
}

/// How a pipeline invocation ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every category was processed
    Completed(RunReport),

    /// The stop flag was raised; the state points at the next unprocessed item
    Stopped(RunState),

    /// A recoverable failure; restart with the plan's state after its delay
    Healing(HealingPlan),
}

/// Runs the pipeline once from the given state
///
/// # Arguments
///
/// * `state` - Fresh or resumed run state
/// * `collaborators` - Collaborator set for this invocation
/// * `store` - Checkpoint store
/// * `guard` - Action budget guard, shared across invocations
/// * `settings` - Pipeline settings
/// * `controller` - Recovery controller consulted on failure
/// * `stop` - Cooperative stop flag, checked before each item
///
/// # Returns
///
/// * `Ok(RunOutcome)` - Completed, stopped, or healing
/// * `Err(HarvestError)` - Non-recoverable failure
pub async fn run_pipeline(
    state: RunState,
    collaborators: Collaborators,
    store: &mut dyn CheckpointStore,
    guard: &mut ActionBudgetGuard,
    settings: &PipelineSettings,
    controller: &RecoveryController,
    stop: Arc<AtomicBool>,
) -> Result<RunOutcome> {
    validate(&state)?;

    let monitor = collaborators.monitor.clone();
    let mut orchestrator = Orchestrator::new(state, collaborators, store, guard, settings, stop);

    match orchestrator.run().await {
        Ok(Flow::Finished) => Ok(RunOutcome::Completed(orchestrator.into_report())),
        Ok(Flow::Stopped) => Ok(RunOutcome::Stopped(orchestrator.state().clone())),
        Err(error) => {
            let plan = controller.handle_failure(orchestrator.state(), error)?;
            monitor.record_event(
                &plan.state.request_id,
                "run",
                EventOutcome::Healing,
                &serde_json::json!({
                    "class": plan.class.to_string(),
                    "attempt": plan.state.attempt_count,
                    "coolingOffSecs": plan.cooling_off.as_secs(),
                }),
            );
            Ok(RunOutcome::Healing(plan))
        }
    }
}
