//! Run state: where a run is in its enumeration
//!
//! The run state is carried across the whole run and across healing restarts.
//! It is never mutated in place by the pipeline; every change goes through
//! [`update_progress`] or [`build_healing`], which return a new value.

use crate::state::Category;
use crate::{HarvestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Batch size used when the caller does not override it
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Phase recorded on a run state produced by the recovery controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealPhase {
    /// The automation session failed or was flagged
    Session,

    /// The action budget was exhausted; the restart waits out a cooling-off
    RateLimitCooldown,

    /// Entity enumeration failed before any batch existed
    ListCreation,
}

impl fmt::Display for HealPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::RateLimitCooldown => "rate-limit-cooldown",
            Self::ListCreation => "list-creation",
        };
        f.write_str(s)
    }
}

/// Enumeration progress carried by a list-creation healing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCreationHealing {
    /// Category whose entity list was being built
    pub category: Category,

    /// Number of list expansion passes the driver had completed
    pub expansion_passes: u32,

    /// Checkpoint-store key of the partial identifier list, if one was saved
    pub partial_ref: Option<String>,

    /// Why enumeration stopped
    pub reason: String,
}

/// Serializable record of a run's position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Correlation id, preserved across healing restarts
    pub request_id: String,

    /// Number of healing restarts so far
    pub attempt_count: u32,

    /// How many of those restarts only waited out the action budget
    #[serde(default)]
    pub cooldown_count: u32,

    pub heal_phase: Option<HealPhase>,
    pub heal_reason: Option<String>,

    /// Category to resume at; None means start at the first category
    pub current_category: Option<Category>,

    /// Zero-based batch cursor within the current category
    pub current_batch: i64,

    /// Zero-based item cursor within `current_batch`
    pub current_index: i64,

    /// Batches of the current category that are fully processed
    pub completed_batches: BTreeSet<u32>,

    pub batch_size: u32,

    /// Handle of the checkpoint index for this run, created lazily
    pub checkpoint_handle: Option<String>,

    /// Opaque credential reference handed to the authenticator
    pub credentials_ref: Option<String>,

    /// Opaque token handed to the remote store
    pub session_token: Option<String>,

    /// Present when enumeration of a category must resume mid-way
    #[serde(default)]
    pub list_creation: Option<ListCreationHealing>,

    pub created_at: DateTime<Utc>,
}

impl RunState {
    /// Item cursor as a slice offset
    pub fn index_cursor(&self) -> usize {
        usize::try_from(self.current_index).unwrap_or(0)
    }

    /// Healing restarts caused by failures other than an exhausted budget
    ///
    /// Budget cool-downs are expected on long lists and are not counted
    /// against the restart bound.
    pub fn runaway_attempts(&self) -> u32 {
        self.attempt_count.saturating_sub(self.cooldown_count)
    }
}

/// Caller-supplied overrides for a fresh run
#[derive(Debug, Clone, Default)]
pub struct InitialParams {
    pub credentials_ref: Option<String>,
    pub session_token: Option<String>,
    pub category: Option<Category>,
    pub batch: Option<i64>,
    pub index: Option<i64>,
    pub batch_size: Option<u32>,
    pub checkpoint_handle: Option<String>,
    pub request_id: Option<String>,
}

/// Cursor and category fields to overwrite in [`update_progress`]
///
/// Outer `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub category: Option<Option<Category>>,
    pub batch: Option<i64>,
    pub index: Option<i64>,
    pub completed_batches: Option<BTreeSet<u32>>,
    pub checkpoint_handle: Option<String>,
    pub list_creation: Option<Option<ListCreationHealing>>,
}

/// Estimated completion of the current category
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub category: Option<Category>,
    pub items_done: usize,
    pub total: usize,
    pub percent: f64,
}

/// Builds a fresh run state from caller-supplied parameters
pub fn build_initial(params: InitialParams) -> RunState {
    RunState {
        request_id: params
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        attempt_count: 0,
        cooldown_count: 0,
        heal_phase: None,
        heal_reason: None,
        current_category: params.category,
        current_batch: params.batch.unwrap_or(0),
        current_index: params.index.unwrap_or(0),
        completed_batches: BTreeSet::new(),
        batch_size: params.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        checkpoint_handle: params.checkpoint_handle,
        credentials_ref: params.credentials_ref,
        session_token: params.session_token,
        list_creation: None,
        created_at: Utc::now(),
    }
}

/// Validates a run state before it is used to drive a run
pub fn validate(state: &RunState) -> Result<()> {
    let has_credentials = state
        .credentials_ref
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if !has_credentials {
        return Err(HarvestError::InvalidState(
            "no usable credentials reference".to_string(),
        ));
    }

    if state.current_batch < 0 {
        return Err(HarvestError::InvalidState(format!(
            "current_batch must be >= 0, got {}",
            state.current_batch
        )));
    }

    if state.current_index < 0 {
        return Err(HarvestError::InvalidState(format!(
            "current_index must be >= 0, got {}",
            state.current_index
        )));
    }

    if state.batch_size == 0 {
        return Err(HarvestError::InvalidState(
            "batch_size must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates a category name taken from outside the type system
pub fn parse_category(name: &str) -> Result<Category> {
    Category::from_db_string(name)
        .ok_or_else(|| HarvestError::InvalidState(format!("unknown category '{}'", name)))
}

/// Builds the successor state for a healing restart
///
/// Cursors are carried forward unchanged; healing never rewinds progress.
pub fn build_healing(state: &RunState, phase: HealPhase, reason: &str) -> RunState {
    let cooldown_count = match phase {
        HealPhase::RateLimitCooldown => state.cooldown_count + 1,
        _ => state.cooldown_count,
    };

    RunState {
        attempt_count: state.attempt_count + 1,
        cooldown_count,
        heal_phase: Some(phase),
        heal_reason: Some(reason.to_string()),
        ..state.clone()
    }
}

/// Returns a new state with the patched fields overwritten
///
/// Moving to a different batch resets the item cursor unless the patch sets
/// it explicitly.
pub fn update_progress(state: &RunState, patch: ProgressPatch) -> RunState {
    let mut next = state.clone();

    if let Some(category) = patch.category {
        next.current_category = category;
    }

    if let Some(batch) = patch.batch {
        if batch != state.current_batch {
            next.current_index = 0;
        }
        next.current_batch = batch;
    }

    if let Some(index) = patch.index {
        next.current_index = index;
    }

    if let Some(completed) = patch.completed_batches {
        next.completed_batches = completed;
    }

    if let Some(handle) = patch.checkpoint_handle {
        next.checkpoint_handle = Some(handle);
    }

    if let Some(list_creation) = patch.list_creation {
        next.list_creation = list_creation;
    }

    next
}

/// Returns true if the state carries any progress from an earlier run
pub fn is_resuming(state: &RunState) -> bool {
    state.checkpoint_handle.is_some()
        || state.current_batch > 0
        || state.current_index > 0
        || !state.completed_batches.is_empty()
}

/// Estimates how much of the current category is done
///
/// Informational only; `total` is the category's recorded entity count.
pub fn progress_summary(state: &RunState, total: usize) -> ProgressSummary {
    let done = state.completed_batches.len() * state.batch_size as usize + state.index_cursor();
    let items_done = done.min(total);
    let percent = if total > 0 {
        (items_done as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    ProgressSummary {
        category: state.current_category,
        items_done,
        total,
        percent,
    }
}
