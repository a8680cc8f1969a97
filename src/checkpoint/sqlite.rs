//! SQLite checkpoint store implementation
//!
//! This module provides a SQLite-based implementation of the CheckpointStore trait.

use crate::checkpoint::schema::initialize_schema;
use crate::checkpoint::traits::{CheckpointError, CheckpointResult, CheckpointStore};
use crate::checkpoint::{
    partition_key, slice_partitions, BatchPartition, CategoryCheckpoint, CheckpointIndex,
    EntityMetadata, PartitionRef,
};
use crate::state::Category;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;

/// SQLite checkpoint backend
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    /// Opens or creates a checkpoint database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteCheckpointStore)` - Successfully opened/created database
    /// * `Err(CheckpointError)` - Failed to open database
    pub fn new(path: &Path) -> CheckpointResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CheckpointError::Io(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)?;

        // Every index write is a recovery point, so sync fully
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    pub fn new_in_memory() -> CheckpointResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn write_index(&self, index: &CheckpointIndex) -> CheckpointResult<()> {
        let payload = serde_json::to_string(index)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO checkpoint_index (handle, created_at, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(handle) DO UPDATE SET updated_at = excluded.updated_at,
                 payload = excluded.payload",
                params![index.handle, index.created_at.to_rfc3339(), now, payload],
            )
            .map_err(|e| CheckpointError::Io(format!("persisting index {}: {}", index.handle, e)))?;
        Ok(())
    }
}

fn decode_index(handle: &str, payload: &str) -> CheckpointResult<CheckpointIndex> {
    serde_json::from_str(payload).map_err(|e| CheckpointError::Corrupt {
        handle: handle.to_string(),
        reason: e.to_string(),
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    // ===== Index =====

    fn create_index(
        &mut self,
        batch_size: u32,
        config_hash: Option<&str>,
    ) -> CheckpointResult<CheckpointIndex> {
        let handle = uuid::Uuid::new_v4().to_string();
        let index = CheckpointIndex::new(handle, batch_size, config_hash.map(str::to_string));
        self.write_index(&index)?;
        tracing::info!("Created checkpoint {}", index.handle);
        Ok(index)
    }

    fn load_index(&self, handle: &str) -> CheckpointResult<CheckpointIndex> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM checkpoint_index WHERE handle = ?1",
                params![handle],
                |row| row.get(0),
            )
            .optional()?;

        let payload = payload.ok_or_else(|| CheckpointError::IndexNotFound(handle.to_string()))?;
        decode_index(handle, &payload)
    }

    fn persist_index(&mut self, index: &CheckpointIndex) -> CheckpointResult<()> {
        self.write_index(index)
    }

    fn list_indexes(&self) -> CheckpointResult<Vec<CheckpointIndex>> {
        let mut stmt = self
            .conn
            .prepare("SELECT handle, payload FROM checkpoint_index ORDER BY created_at DESC")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|(handle, payload)| decode_index(handle, payload))
            .collect()
    }

    // ===== Partitions =====

    fn create_partitions(
        &mut self,
        index: &mut CheckpointIndex,
        category: Category,
        entities: &[String],
        metadata: &EntityMetadata,
    ) -> CheckpointResult<Vec<PartitionRef>> {
        let partitions = slice_partitions(category, entities, index.batch_size, metadata);
        let mut refs = Vec::with_capacity(partitions.len());

        let tx = self.conn.transaction()?;
        for partition in &partitions {
            let key = partition_key(&index.handle, category, partition.batch_number);
            let identifiers = serde_json::to_string(&partition.identifiers)
                .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
            let part_metadata = serde_json::to_string(&partition.metadata)
                .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

            // Slicing is deterministic, so rewriting after a crash stores the same rows
            tx.execute(
                "INSERT OR REPLACE INTO batch_partitions
                 (partition_key, handle, category, batch_number, range_start, range_end, identifiers, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    key,
                    index.handle,
                    category.to_db_string(),
                    partition.batch_number,
                    partition.start as i64,
                    partition.end as i64,
                    identifiers,
                    part_metadata,
                ],
            )
            .map_err(|e| CheckpointError::Io(format!("persisting partition {}: {}", key, e)))?;

            refs.push(PartitionRef {
                batch_number: partition.batch_number,
                key,
                start: partition.start,
                end: partition.end,
            });
        }
        tx.commit()
            .map_err(|e| CheckpointError::Io(format!("committing partitions: {}", e)))?;

        index.insert_category(CategoryCheckpoint {
            category,
            total_entities: entities.len(),
            partitions: refs.clone(),
            completed_batches: BTreeSet::new(),
        });

        tracing::info!(
            "Partitioned {} {} entities into {} batches of up to {}",
            entities.len(),
            category,
            refs.len(),
            index.batch_size
        );

        Ok(refs)
    }

    fn load_partition(
        &self,
        handle: &str,
        category: Category,
        batch_number: u32,
    ) -> CheckpointResult<BatchPartition> {
        let key = partition_key(handle, category, batch_number);

        let row: Option<(i64, i64, String, String)> = self
            .conn
            .query_row(
                "SELECT range_start, range_end, identifiers, metadata
                 FROM batch_partitions WHERE partition_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (start, end, identifiers, metadata) =
            row.ok_or_else(|| CheckpointError::PartitionNotFound(key.clone()))?;

        let corrupt = |e: serde_json::Error| CheckpointError::Corrupt {
            handle: handle.to_string(),
            reason: format!("partition {}: {}", key, e),
        };

        Ok(BatchPartition {
            batch_number,
            category,
            identifiers: serde_json::from_str(&identifiers).map_err(corrupt)?,
            metadata: serde_json::from_str(&metadata).map_err(corrupt)?,
            start: start as usize,
            end: end as usize,
        })
    }

    // ===== Enumeration Progress =====

    fn save_partial_enumeration(
        &mut self,
        handle: &str,
        category: Category,
        identifiers: &[String],
    ) -> CheckpointResult<String> {
        let key = format!("{}/{}/partial", handle, category);
        let payload = serde_json::to_string(identifiers)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO partial_enumerations (partial_key, handle, category, identifiers, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key,
                    handle,
                    category.to_db_string(),
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| CheckpointError::Io(format!("persisting partial list {}: {}", key, e)))?;

        tracing::debug!(
            "Saved partial {} list with {} identifiers",
            category,
            identifiers.len()
        );
        Ok(key)
    }

    fn load_partial_enumeration(&self, key: &str) -> CheckpointResult<Vec<String>> {
        let payload: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT handle, identifiers FROM partial_enumerations WHERE partial_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (handle, payload) =
            payload.ok_or_else(|| CheckpointError::PartialNotFound(key.to_string()))?;

        serde_json::from_str(&payload).map_err(|e| CheckpointError::Corrupt {
            handle,
            reason: format!("partial list {}: {}", key, e),
        })
    }
}
