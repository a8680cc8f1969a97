//! Checkpoint store trait and error types
//!
//! This module defines the trait interface for checkpoint backends and
//! associated error types.

use crate::checkpoint::{BatchPartition, CheckpointIndex, EntityMetadata, PartitionRef};
use crate::state::Category;
use thiserror::Error;

/// Errors that can occur during checkpoint operations
///
/// Every variant is process-fatal: a checkpoint that cannot be written or
/// read back is never rebuilt automatically.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint store IO failure: {0}")]
    Io(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Checkpoint {handle} is corrupt: {reason}")]
    Corrupt { handle: String, reason: String },

    #[error("Checkpoint not found: {0}")]
    IndexNotFound(String),

    #[error("Batch partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Partial enumeration not found: {0}")]
    PartialNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CheckpointError {
    /// Returns true if a stored payload could not be parsed
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Trait for checkpoint backend implementations
///
/// A store is owned by exactly one run at a time; it does no cross-process
/// locking.
pub trait CheckpointStore: Send {
    // ===== Index =====

    /// Allocates and persists a new, empty index
    fn create_index(
        &mut self,
        batch_size: u32,
        config_hash: Option<&str>,
    ) -> CheckpointResult<CheckpointIndex>;

    /// Loads an existing index by handle
    ///
    /// Fails with `Corrupt` if the stored payload cannot be parsed.
    fn load_index(&self, handle: &str) -> CheckpointResult<CheckpointIndex>;

    /// Overwrites the stored index (idempotent)
    fn persist_index(&mut self, index: &CheckpointIndex) -> CheckpointResult<()>;

    /// Lists every index in the store, newest first
    fn list_indexes(&self) -> CheckpointResult<Vec<CheckpointIndex>>;

    // ===== Partitions =====

    /// Slices the entity list into partitions, persists each one and records
    /// their references on the index
    ///
    /// The index itself is not persisted here; callers follow up with
    /// `persist_index`.
    fn create_partitions(
        &mut self,
        index: &mut CheckpointIndex,
        category: Category,
        entities: &[String],
        metadata: &EntityMetadata,
    ) -> CheckpointResult<Vec<PartitionRef>>;

    /// Loads one partition
    fn load_partition(
        &self,
        handle: &str,
        category: Category,
        batch_number: u32,
    ) -> CheckpointResult<BatchPartition>;

    // ===== Enumeration Progress =====

    /// Saves a partial identifier list and returns its key
    fn save_partial_enumeration(
        &mut self,
        handle: &str,
        category: Category,
        identifiers: &[String],
    ) -> CheckpointResult<String>;

    /// Loads a partial identifier list by key
    fn load_partial_enumeration(&self, key: &str) -> CheckpointResult<Vec<String>>;

    // ===== Derived =====

    /// Re-derives the identifiers of every committed batch, by category
    fn processed_identifiers(
        &self,
        index: &CheckpointIndex,
    ) -> CheckpointResult<Vec<(Category, String)>> {
        let mut identifiers = Vec::new();
        for entry in &index.categories {
            for batch_number in &entry.completed_batches {
                let partition = self.load_partition(&index.handle, entry.category, *batch_number)?;
                identifiers.extend(
                    partition
                        .identifiers
                        .into_iter()
                        .map(|id| (entry.category, id)),
                );
            }
        }
        Ok(identifiers)
    }
}
