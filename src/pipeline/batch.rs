//! Per-batch item outcomes

use crate::monitor::EventOutcome;
use crate::state::Category;
use serde::Serialize;

/// What happened to one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "reason")]
pub enum ItemStatus {
    Processed,
    Skipped,
    Error(String),
}

impl ItemStatus {
    pub fn outcome(&self) -> EventOutcome {
        match self {
            Self::Processed => EventOutcome::Processed,
            Self::Skipped => EventOutcome::Skipped,
            Self::Error(_) => EventOutcome::Error,
        }
    }
}

/// Outcome of one item, keyed by its index within the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub index: usize,
    pub identifier: String,
    pub status: ItemStatus,
}

/// Outcomes of one batch, in processing order
///
/// A resumed batch only holds the items visited in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub category: Category,
    pub batch_number: u32,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchResult {
    pub fn new(category: Category, batch_number: u32) -> Self {
        Self {
            category,
            batch_number,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, index: usize, identifier: &str, status: ItemStatus) {
        self.outcomes.push(ItemOutcome {
            index,
            identifier: identifier.to_string(),
            status,
        });
    }

    pub fn processed(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Processed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Skipped))
    }

    pub fn errors(&self) -> usize {
        self.count(|s| matches!(s, ItemStatus::Error(_)))
    }

    fn count(&self, pred: impl Fn(&ItemStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}
