//! Configuration module for Connection-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use connection_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Batch size: {}", config.pipeline.batch_size);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CheckpointConfig, Config, CredentialsConfig, EndpointConfig, HistoryConfig, IngestConfig,
    PipelineConfig, RecoveryConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
