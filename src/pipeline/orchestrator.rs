//! Batch orchestrator - the category, batch and item loops
//!
//! The orchestrator owns the run state for the length of one invocation and
//! replaces it after every step, so whatever it holds when an error escapes is
//! exactly where a healing restart should pick up.

use crate::checkpoint::{BatchPartition, CheckpointIndex, CheckpointStore};
use crate::collaborators::{CollaboratorError, Collaborators, EnumerationResume};
use crate::monitor::EventOutcome;
use crate::pipeline::batch::{BatchResult, ItemStatus};
use crate::pipeline::history::sweep_history;
use crate::pipeline::{PipelineSettings, RunReport};
use crate::state::{
    is_resuming, progress_summary, save_run_state, update_progress, ActionBudgetGuard, Category,
    ListCreationHealing, ProgressPatch, RunState,
};
use crate::{HarvestError, Result};
use rand::Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Longest a completed run waits for outstanding ingestion calls
const INGEST_GRACE: Duration = Duration::from_secs(30);

/// Where a loop left off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Finished,
    Stopped,
}

/// Drives one pipeline invocation
pub struct Orchestrator<'a> {
    state: RunState,
    collaborators: Collaborators,
    store: &'a mut dyn CheckpointStore,
    guard: &'a mut ActionBudgetGuard,
    settings: &'a PipelineSettings,
    stop: Arc<AtomicBool>,
    batches: Vec<BatchResult>,
    history_written: usize,
    ingestions: JoinSet<bool>,
    ingested: usize,
    ingest_failures: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        state: RunState,
        collaborators: Collaborators,
        store: &'a mut dyn CheckpointStore,
        guard: &'a mut ActionBudgetGuard,
        settings: &'a PipelineSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            collaborators,
            store,
            guard,
            settings,
            stop,
            batches: Vec::new(),
            history_written: 0,
            ingestions: JoinSet::new(),
            ingested: 0,
            ingest_failures: 0,
        }
    }

    /// The run state as of the last completed step
    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn into_report(self) -> RunReport {
        RunReport {
            state: self.state,
            batches: self.batches,
            history_written: self.history_written,
            ingested: self.ingested,
            ingest_failures: self.ingest_failures,
        }
    }

    fn advance(&mut self, patch: ProgressPatch) {
        self.state = update_progress(&self.state, patch);
    }

    /// Writes the run state to the state file, if one is configured
    ///
    /// Called at every durable checkpoint write, so a killed process can
    /// always find its way back to the index.
    fn save_state(&self) -> Result<()> {
        match &self.settings.state_file {
            Some(path) => save_run_state(path, &self.state),
            None => Ok(()),
        }
    }

    /// Runs every category to completion, or until the stop flag is raised
    pub async fn run(&mut self) -> Result<Flow> {
        tracing::info!(
            "{} run {} (attempt {})",
            if is_resuming(&self.state) { "Resuming" } else { "Starting" },
            self.state.request_id,
            self.state.attempt_count
        );
        if let Some(phase) = self.state.heal_phase {
            tracing::info!(
                "Resuming after {} healing: {}",
                phase,
                self.state.heal_reason.as_deref().unwrap_or("unknown")
            );
        }

        self.authenticate().await?;
        let mut index = self.ensure_index()?;

        let mut visited = BTreeSet::new();
        for category in Category::ALL {
            if !visited.insert(category) {
                continue;
            }

            match self.state.current_category {
                Some(current) if current != category => {
                    tracing::debug!("Skipping {} (resuming at {})", category, current);
                    continue;
                }
                Some(_) => {}
                None => self.advance(ProgressPatch {
                    category: Some(Some(category)),
                    ..Default::default()
                }),
            }

            self.ensure_partitions(category, &mut index).await?;

            if self.process_category(category, &mut index).await? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }

            tracing::info!("Finished {} connections", category);
            self.advance(ProgressPatch {
                category: Some(category.next()),
                batch: Some(0),
                index: Some(0),
                completed_batches: Some(BTreeSet::new()),
                ..Default::default()
            });
            self.save_state()?;
        }

        if self.settings.history_enabled {
            match sweep_history(&self.collaborators, &*self.store, &mut *self.guard, &index).await {
                Ok(written) => self.history_written = written,
                Err(e) => tracing::warn!("History sweep failed, continuing: {}", e),
            }
        }

        self.drain_ingestions().await;

        tracing::info!("Run {} complete", self.state.request_id);
        Ok(Flow::Finished)
    }

    // ===== AUTH =====

    async fn authenticate(&mut self) -> Result<()> {
        let credentials_ref = self
            .state
            .credentials_ref
            .clone()
            .ok_or_else(|| HarvestError::InvalidState("no credentials reference".to_string()))?;

        if let Some(token) = &self.state.session_token {
            self.collaborators.store.set_auth_token(token);
        }

        self.guard.admit()?;
        self.collaborators
            .authenticator
            .login(&credentials_ref)
            .await?;

        tracing::info!("Authenticated automation session");
        Ok(())
    }

    // ===== ENSURE_INDEX =====

    fn ensure_index(&mut self) -> Result<CheckpointIndex> {
        let index = match self.state.checkpoint_handle.clone() {
            Some(handle) => {
                let index = self.store.load_index(&handle)?;
                tracing::info!("Loaded checkpoint {}", handle);

                if let (Some(recorded), Some(current)) =
                    (&index.config_hash, &self.settings.config_hash)
                {
                    if recorded != current {
                        tracing::warn!(
                            "Configuration changed since checkpoint {} was created",
                            handle
                        );
                    }
                }

                if index.batch_size != self.state.batch_size {
                    tracing::warn!(
                        "Checkpoint batch size {} overrides requested {}",
                        index.batch_size,
                        self.state.batch_size
                    );
                }
                index
            }
            None => {
                let index = self
                    .store
                    .create_index(self.state.batch_size, self.settings.config_hash.as_deref())?;
                self.advance(ProgressPatch {
                    checkpoint_handle: Some(index.handle.clone()),
                    ..Default::default()
                });
                self.save_state()?;
                index
            }
        };
        Ok(index)
    }

    // ===== ENSURE_PARTITIONS =====

    async fn ensure_partitions(
        &mut self,
        category: Category,
        index: &mut CheckpointIndex,
    ) -> Result<()> {
        if index.has_partitions(category) {
            return Ok(());
        }

        let previous = self
            .state
            .list_creation
            .clone()
            .filter(|lc| lc.category == category);

        let resume = match &previous {
            Some(lc) => {
                let known = match &lc.partial_ref {
                    Some(key) => self.store.load_partial_enumeration(key)?,
                    None => Vec::new(),
                };
                tracing::info!(
                    "Resuming {} enumeration after {} passes with {} known profiles",
                    category,
                    lc.expansion_passes,
                    known.len()
                );
                Some(EnumerationResume {
                    expansion_passes: lc.expansion_passes,
                    known,
                })
            }
            None => None,
        };

        self.guard.admit()?;
        tracing::info!("Enumerating {} connections", category);

        let enumeration = match self
            .collaborators
            .driver
            .enumerate_entities(category, resume.as_ref())
            .await
        {
            Ok(enumeration) => enumeration,
            Err(CollaboratorError::EnumerationInterrupted {
                expansion_passes,
                partial,
                reason,
            }) => {
                let partial_ref = if partial.is_empty() {
                    previous.and_then(|lc| lc.partial_ref)
                } else {
                    Some(
                        self.store
                            .save_partial_enumeration(&index.handle, category, &partial)?,
                    )
                };
                return Err(HarvestError::ListCreation(ListCreationHealing {
                    category,
                    expansion_passes,
                    partial_ref,
                    reason,
                }));
            }
            Err(e) => {
                let (expansion_passes, partial_ref) = previous
                    .map(|lc| (lc.expansion_passes, lc.partial_ref))
                    .unwrap_or((0, None));
                return Err(HarvestError::ListCreation(ListCreationHealing {
                    category,
                    expansion_passes,
                    partial_ref,
                    reason: e.to_string(),
                }));
            }
        };

        self.store.create_partitions(
            index,
            category,
            &enumeration.identifiers,
            &enumeration.metadata,
        )?;
        self.store.persist_index(index)?;

        if self.state.list_creation.is_some() {
            self.advance(ProgressPatch {
                list_creation: Some(None),
                ..Default::default()
            });
        }
        Ok(())
    }

    // ===== FOR_EACH_BATCH =====

    async fn process_category(
        &mut self,
        category: Category,
        index: &mut CheckpointIndex,
    ) -> Result<Flow> {
        let (partitions, total, mut completed) = match index.category(category) {
            Some(entry) => (
                entry.partitions.clone(),
                entry.total_entities,
                entry.completed_batches.clone(),
            ),
            None => {
                return Err(HarvestError::InvalidState(format!(
                    "checkpoint {} has no partitions for {}",
                    index.handle, category
                )))
            }
        };

        // The index is the durable record; the state may lag behind it
        completed.extend(self.state.completed_batches.iter().copied());
        if completed != self.state.completed_batches {
            self.advance(ProgressPatch {
                completed_batches: Some(completed.clone()),
                ..Default::default()
            });
        }

        tracing::info!(
            "{}: {} profiles in {} batches, {} already committed",
            category,
            total,
            partitions.len(),
            completed.len()
        );

        for partition_ref in &partitions {
            let batch_number = partition_ref.batch_number;
            if completed.contains(&batch_number) || i64::from(batch_number) < self.state.current_batch
            {
                tracing::debug!("Skipping {} batch {}", category, batch_number);
                continue;
            }

            if i64::from(batch_number) > self.state.current_batch {
                self.advance(ProgressPatch {
                    batch: Some(i64::from(batch_number)),
                    ..Default::default()
                });
            }

            let partition = self
                .store
                .load_partition(&index.handle, category, batch_number)?;

            let result = match self.process_batch(&partition).await? {
                Some(result) => result,
                None => return Ok(Flow::Stopped),
            };

            // ===== COMMIT_BATCH =====
            index.mark_batch_complete(category, batch_number);
            self.store.persist_index(index)?;

            completed.insert(batch_number);
            self.advance(ProgressPatch {
                completed_batches: Some(completed.clone()),
                batch: Some(i64::from(batch_number) + 1),
                ..Default::default()
            });
            self.save_state()?;

            self.collaborators.monitor.record_event(
                &self.state.request_id,
                &format!("{}/{}", category, batch_number),
                EventOutcome::BatchCommitted,
                &serde_json::json!({
                    "processed": result.processed(),
                    "skipped": result.skipped(),
                    "errors": result.errors(),
                }),
            );

            let summary = progress_summary(&self.state, total);
            tracing::info!(
                "Committed {} batch {}: {}/{} profiles ({:.1}%)",
                category,
                batch_number,
                summary.items_done,
                summary.total,
                summary.percent
            );

            self.batches.push(result);
            self.pause_between_batches().await;
        }

        Ok(Flow::Finished)
    }

    // ===== FOR_EACH_ITEM =====

    /// Processes the unvisited items of a batch
    ///
    /// Returns None if the stop flag was raised.
    async fn process_batch(&mut self, partition: &BatchPartition) -> Result<Option<BatchResult>> {
        let category = partition.category;
        let batch_number = partition.batch_number;

        let start = if i64::from(batch_number) == self.state.current_batch {
            self.state.index_cursor()
        } else {
            0
        };
        if start > 0 {
            tracing::info!(
                "Resuming {} batch {} at item {}",
                category,
                batch_number,
                start
            );
        }

        let mut result = BatchResult::new(category, batch_number);

        for (index, identifier) in partition.identifiers.iter().enumerate().skip(start) {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!(
                    "Stop requested before {} batch {} item {}",
                    category,
                    batch_number,
                    index
                );
                return Ok(None);
            }

            let listing = partition.metadata.get(identifier);
            let status = match self.process_item(category, identifier, listing).await {
                Ok(status) => status,
                Err(e) if e.is_entity_local() => {
                    tracing::warn!("Skipping {} after profile error: {}", identifier, e);
                    ItemStatus::Error(e.to_string())
                }
                Err(e) => {
                    return Err(HarvestError::ItemFailed {
                        category,
                        batch: batch_number,
                        index,
                        identifier: identifier.clone(),
                        source: Box::new(e),
                    })
                }
            };

            self.collaborators.monitor.record_event(
                &self.state.request_id,
                identifier,
                status.outcome(),
                &serde_json::json!({
                    "category": category,
                    "batch": batch_number,
                    "index": index,
                }),
            );
            result.record(index, identifier, status);

            self.advance(ProgressPatch {
                index: Some(index as i64 + 1),
                ..Default::default()
            });
        }

        Ok(Some(result))
    }

    async fn process_item(
        &mut self,
        category: Category,
        identifier: &str,
        listing: Option<&serde_json::Value>,
    ) -> Result<ItemStatus> {
        // IDEMPOTENCY_CHECK
        if self.collaborators.store.exists(identifier).await? {
            tracing::debug!("{} already present, skipping", identifier);
            return Ok(ItemStatus::Skipped);
        }

        // PROCESS
        self.guard.admit()?;
        let mut record = self
            .collaborators
            .driver
            .fetch_entity_detail(identifier)
            .await?;
        if let Some(listing) = listing {
            record
                .attributes
                .insert("listing".to_string(), listing.clone());
        }

        let extra = serde_json::to_value(&record)?;
        self.collaborators
            .store
            .upsert_record(identifier, category.edge_status(), Some(&extra))
            .await?;

        if category.triggers_ingestion() {
            self.dispatch_ingestion(identifier, extra);
        }

        tracing::debug!("Processed {}", identifier);
        Ok(ItemStatus::Processed)
    }

    /// Fires a best-effort ingestion call without waiting for it
    fn dispatch_ingestion(&mut self, identifier: &str, payload: serde_json::Value) {
        let ingest = match &self.collaborators.ingest {
            Some(ingest) => ingest.clone(),
            None => return,
        };
        let identifier = identifier.to_string();

        self.ingestions.spawn(async move {
            match ingest.ingest(&identifier, &payload).await {
                Ok(document_id) => {
                    tracing::debug!("Ingested {} as {}", identifier, document_id);
                    true
                }
                Err(e) => {
                    tracing::warn!("Ingestion failed for {}: {}", identifier, e);
                    false
                }
            }
        });
    }

    /// Collects finished ingestion calls, waiting at most `INGEST_GRACE`
    async fn drain_ingestions(&mut self) {
        if self.ingestions.is_empty() {
            return;
        }

        let pending = self.ingestions.len();
        let drained = tokio::time::timeout(INGEST_GRACE, async {
            let mut tally = (0, 0);
            while let Some(joined) = self.ingestions.join_next().await {
                match joined {
                    Ok(true) => tally.0 += 1,
                    _ => tally.1 += 1,
                }
            }
            tally
        })
        .await;

        match drained {
            Ok((ok, failed)) => {
                self.ingested += ok;
                self.ingest_failures += failed;
            }
            Err(_) => {
                tracing::warn!(
                    "Abandoning {} of {} ingestion calls still running",
                    self.ingestions.len(),
                    pending
                );
                self.ingestions.abort_all();
            }
        }
    }

    async fn pause_between_batches(&self) {
        let min = self.settings.inter_batch_delay_min.as_millis() as u64;
        let max = self.settings.inter_batch_delay_max.as_millis() as u64;
        if max == 0 {
            return;
        }

        let delay = Duration::from_millis(rand::rng().random_range(min.min(max)..=max));
        tracing::debug!("Pausing {:?} before the next batch", delay);
        tokio::time::sleep(delay).await;
    }
}
