//! Message history sweep
//!
//! Runs once every category is done. Best-effort: the caller logs and drops
//! any error, since the profiles themselves are already ingested.

use crate::checkpoint::{CheckpointIndex, CheckpointStore};
use crate::collaborators::Collaborators;
use crate::state::ActionBudgetGuard;
use crate::Result;

/// Fetches message history for every committed profile and writes it back
///
/// Returns the number of edges updated.
pub(crate) async fn sweep_history(
    collaborators: &Collaborators,
    store: &dyn CheckpointStore,
    guard: &mut ActionBudgetGuard,
    index: &CheckpointIndex,
) -> Result<usize> {
    let history = match &collaborators.history {
        Some(history) => history,
        None => return Ok(0),
    };

    let processed = store.processed_identifiers(index)?;
    if processed.is_empty() {
        return Ok(0);
    }

    let identifiers: Vec<String> = processed.iter().map(|(_, id)| id.clone()).collect();
    tracing::info!("Fetching message history for {} profiles", identifiers.len());

    guard.admit()?;
    let conversations = history.fetch_history(&identifiers).await?;

    let mut written = 0;
    for (category, identifier) in &processed {
        let messages = match conversations.get(identifier) {
            Some(messages) if !messages.is_empty() => messages,
            _ => continue,
        };

        let extra = serde_json::json!({ "messages": messages });
        collaborators
            .store
            .upsert_record(identifier, category.edge_status(), Some(&extra))
            .await?;
        written += 1;
    }

    tracing::info!("Wrote message history for {} profiles", written);
    Ok(written)
}
