//! Checkpoint module for durable batch progress
//!
//! This module handles partitioning a category's entity list into fixed-size
//! batches and persisting which batches exist and which are complete:
//! - One index record per run, keyed by an opaque handle
//! - One batch partition per (category, batch number)
//! - Partial enumeration lists saved while building a category's list
//!
//! The index is the single source of truth for which batches exist. It is
//! rewritten after every batch commits, which makes it the recovery point.

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteCheckpointStore;
pub use traits::{CheckpointError, CheckpointResult, CheckpointStore};

use crate::state::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-identifier side metadata harvested during enumeration
pub type EntityMetadata = BTreeMap<String, serde_json::Value>;

/// Reference from the index to one persisted batch partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRef {
    pub batch_number: u32,
    pub key: String,
    pub start: usize,
    pub end: usize,
}

/// Index entry for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCheckpoint {
    pub category: Category,
    pub total_entities: usize,
    pub partitions: Vec<PartitionRef>,
    pub completed_batches: BTreeSet<u32>,
}

impl CategoryCheckpoint {
    /// Returns true once every partition has been committed
    pub fn is_complete(&self) -> bool {
        self.completed_batches.len() >= self.partitions.len()
    }
}

/// Index record for one run's checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointIndex {
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub batch_size: u32,

    /// Hash of the configuration the index was created under
    #[serde(default)]
    pub config_hash: Option<String>,

    pub categories: Vec<CategoryCheckpoint>,
}

impl CheckpointIndex {
    /// Creates an empty index
    pub fn new(handle: String, batch_size: u32, config_hash: Option<String>) -> Self {
        Self {
            handle,
            created_at: Utc::now(),
            batch_size,
            config_hash,
            categories: Vec::new(),
        }
    }

    /// Gets the entry for a category, if its partitions were created
    pub fn category(&self, category: Category) -> Option<&CategoryCheckpoint> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// Returns true if partitions for this category exist
    pub fn has_partitions(&self, category: Category) -> bool {
        self.category(category).is_some()
    }

    /// Total entity count recorded for a category
    pub fn total_for(&self, category: Category) -> Option<usize> {
        self.category(category).map(|c| c.total_entities)
    }

    /// Records that a batch was fully processed
    ///
    /// Returns false if the batch does not exist in this index.
    pub fn mark_batch_complete(&mut self, category: Category, batch_number: u32) -> bool {
        match self.categories.iter_mut().find(|c| c.category == category) {
            Some(entry) if entry.partitions.iter().any(|p| p.batch_number == batch_number) => {
                entry.completed_batches.insert(batch_number);
                true
            }
            _ => false,
        }
    }

    fn insert_category(&mut self, entry: CategoryCheckpoint) {
        self.categories.retain(|c| c.category != entry.category);
        self.categories.push(entry);
        self.categories.sort_by_key(|c| c.category);
    }
}

/// One fixed-size slice of a category's entity list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPartition {
    pub batch_number: u32,
    pub category: Category,
    pub identifiers: Vec<String>,
    pub metadata: EntityMetadata,

    /// Inclusive start of the range within the category's full list
    pub start: usize,

    /// Exclusive end of the range within the category's full list
    pub end: usize,
}

/// Builds the store key of a batch partition
pub fn partition_key(handle: &str, category: Category, batch_number: u32) -> String {
    format!("{}/{}/{:05}", handle, category, batch_number)
}

/// Slices an entity list into contiguous batch partitions
///
/// Partition `i` always holds `entities[i * batch_size .. (i + 1) * batch_size]`;
/// only the last partition may be shorter. Metadata is split along with the
/// identifiers it describes.
pub fn slice_partitions(
    category: Category,
    entities: &[String],
    batch_size: u32,
    metadata: &EntityMetadata,
) -> Vec<BatchPartition> {
    let size = batch_size.max(1) as usize;

    entities
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            let start = i * size;
            let part_metadata = chunk
                .iter()
                .filter_map(|id| metadata.get(id).map(|v| (id.clone(), v.clone())))
                .collect();

            BatchPartition {
                batch_number: i as u32,
                category,
                identifiers: chunk.to_vec(),
                metadata: part_metadata,
                start,
                end: start + chunk.len(),
            }
        })
        .collect()
}
