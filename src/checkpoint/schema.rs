//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the checkpoint database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One index record per run
CREATE TABLE IF NOT EXISTS checkpoint_index (
    handle TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

-- One partition per (run, category, batch)
CREATE TABLE IF NOT EXISTS batch_partitions (
    partition_key TEXT PRIMARY KEY,
    handle TEXT NOT NULL REFERENCES checkpoint_index(handle),
    category TEXT NOT NULL,
    batch_number INTEGER NOT NULL,
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    identifiers TEXT NOT NULL,
    metadata TEXT NOT NULL,
    UNIQUE(handle, category, batch_number)
);

CREATE INDEX IF NOT EXISTS idx_partitions_handle ON batch_partitions(handle, category);

-- Identifier lists saved while a category's list was still being built
CREATE TABLE IF NOT EXISTS partial_enumerations (
    partial_key TEXT PRIMARY KEY,
    handle TEXT NOT NULL,
    category TEXT NOT NULL,
    identifiers TEXT NOT NULL,
    saved_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
