//! State module for tracking run progress
//!
//! This module provides the values a run carries from start to finish and
//! across healing restarts.
//!
//! # Components
//!
//! - `Category`: The fixed set of connection categories, in processing order
//! - `RunState`: Serializable cursor over category, batch and item, plus the
//!   pure operations that build, validate and advance it
//! - `ActionBudgetGuard`: Sliding-window ceilings on actions against the site
//! - `persist`: Run-state file used to resume after a machine restart

mod action_budget;
mod category;
mod persist;
mod run_state;

// Re-export main types
pub use action_budget::{
    ActionBudgetGuard, AdvisoryCeilings, BudgetCeilings, BudgetWindow, Clock,
    MAX_ACTIONS_PER_DAY, MAX_ACTIONS_PER_HOUR, MAX_ACTIONS_PER_MINUTE,
};
pub use category::Category;
pub use persist::{clear_run_state, load_run_state, save_run_state};
pub use run_state::{
    build_healing, build_initial, is_resuming, parse_category, progress_summary, update_progress,
    validate, HealPhase, InitialParams, ListCreationHealing, ProgressPatch, ProgressSummary,
    RunState, DEFAULT_BATCH_SIZE,
};
