//! Connection-Harvest: a resumable, self-healing connection ingester
//!
//! This crate ingests a person's network connections into a remote edge store
//! one profile at a time, driving a rate-limited browser automation session.
//! Progress is checkpointed per batch so a run survives crashes, bans and
//! restarts without losing or silently duplicating work.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod monitor;
pub mod pipeline;
pub mod recovery;
pub mod state;
pub mod supervisor;

use thiserror::Error;

/// Main error type for Connection-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid run state: {0}")]
    InvalidState(String),

    #[error("Action budget exceeded: at most {limit} actions per {window}")]
    RateLimitExceeded {
        window: state::BudgetWindow,
        limit: u32,

        /// How long until the guard admits again
        retry_after: std::time::Duration,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] collaborators::CollaboratorError),

    #[error("List creation for {} interrupted: {}", .0.category, .0.reason)]
    ListCreation(state::ListCreationHealing),

    #[error("{category} batch {batch} item {index} ({identifier}): {source}")]
    ItemFailed {
        category: state::Category,
        batch: u32,
        index: usize,
        identifier: String,
        source: Box<HarvestError>,
    },

    #[error("Healing gave up after {attempts} restart attempts")]
    HealingExhausted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl HarvestError {
    /// Returns the innermost error, looking through item context wrappers
    pub fn root_cause(&self) -> &HarvestError {
        match self {
            Self::ItemFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns true if this error only affects a single entity
    pub fn is_entity_local(&self) -> bool {
        match self.root_cause() {
            Self::Collaborator(e) => e.is_entity_local(),
            _ => false,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Connection-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::{run_pipeline, RunOutcome, RunReport};
pub use recovery::{HealingPlan, RecoveryController};
pub use state::{ActionBudgetGuard, Category, RunState};
