//! Run-state file persistence
//!
//! The state file is written whenever a run hands off to a restart or stops
//! cleanly, and removed once a run completes.

use crate::state::RunState;
use crate::Result;
use std::path::Path;

/// Writes the run state as pretty JSON, replacing any previous file
///
/// The file is written to a sibling temp path and renamed into place so a
/// crash mid-write never leaves a truncated state behind.
pub fn save_run_state(path: &Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!("Saved run state to {}", path.display());
    Ok(())
}

/// Loads a run state file, returning None if it does not exist
pub fn load_run_state(path: &Path) -> Result<Option<RunState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let state = serde_json::from_str(&content)?;
    Ok(Some(state))
}

/// Removes the run state file if present
pub fn clear_run_state(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
