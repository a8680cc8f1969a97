//! Run statistics and checkpoint progress reports
//!
//! This module provides the end-of-run counters and the `--stats` printout of
//! every checkpoint in the database.

use crate::checkpoint::CheckpointStore;
use crate::monitor::EventOutcome;
use crate::state::Category;
use crate::HarvestError;
use std::time::Duration;

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatistics {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub batches_committed: u64,
    pub healing_handoffs: u64,
    pub elapsed: Duration,
}

impl RunStatistics {
    pub fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Processed => self.processed += 1,
            EventOutcome::Skipped => self.skipped += 1,
            EventOutcome::Error => self.errors += 1,
            EventOutcome::BatchCommitted => self.batches_committed += 1,
            EventOutcome::Healing => self.healing_handoffs += 1,
        }
    }

    /// Items visited, whatever their outcome
    pub fn items(&self) -> u64 {
        self.processed + self.skipped + self.errors
    }
}

/// Prints run statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &RunStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Items:");
    println!("  Processed: {}", stats.processed);
    println!("  Skipped (already present): {}", stats.skipped);
    println!("  Errors: {}", stats.errors);
    println!();

    println!("Batches committed: {}", stats.batches_committed);
    if stats.healing_handoffs > 0 {
        println!("Healing restarts: {}", stats.healing_handoffs);
    }

    let secs = stats.elapsed.as_secs();
    println!(
        "Elapsed: {}h {:02}m {:02}s",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    );

    if secs > 0 && stats.items() > 0 {
        let per_hour = stats.items() as f64 / (secs as f64 / 3600.0);
        println!("Throughput: {:.0} items/hour", per_hour);
    }
}

/// Prints the progress recorded in every checkpoint in the store
///
/// # Arguments
///
/// * `store` - The checkpoint store to query
///
/// # Returns
///
/// * `Ok(())` - Printed successfully
/// * `Err(HarvestError)` - Failed to read the store
pub fn print_checkpoint_progress(store: &dyn CheckpointStore) -> Result<(), HarvestError> {
    let indexes = store.list_indexes()?;

    if indexes.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }

    println!("=== Checkpoints ===");
    for index in &indexes {
        println!();
        println!(
            "{} (created {}, batch size {})",
            index.handle,
            index.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            index.batch_size
        );

        for category in Category::ALL {
            match index.category(category) {
                Some(entry) => {
                    let done = entry.completed_batches.len();
                    let total = entry.partitions.len();
                    let percent = if total > 0 {
                        (done as f64 / total as f64) * 100.0
                    } else {
                        100.0
                    };
                    println!(
                        "  {:<17} {:>4}/{:<4} batches ({:.1}%), {} profiles{}",
                        category.to_string(),
                        done,
                        total,
                        percent,
                        entry.total_entities,
                        if entry.is_complete() { " ✓" } else { "" }
                    );
                }
                None => println!("  {:<17} not enumerated", category.to_string()),
            }
        }
    }

    Ok(())
}
