use crate::state::AdvisoryCeilings;
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure for Connection-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,

    /// Optional stricter action ceilings
    #[serde(default)]
    pub budget: AdvisoryCeilings,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    pub checkpoint: CheckpointConfig,

    /// Browser automation sidecar
    pub driver: EndpointConfig,

    /// Edge store API
    pub store: EndpointConfig,

    /// Ingestion proxy; ingestion is skipped when absent
    #[serde(default)]
    pub ingest: Option<IngestConfig>,

    #[serde(default)]
    pub history: HistoryConfig,

    pub credentials: CredentialsConfig,
}

/// Batch pipeline behavior
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Number of profiles per checkpointed batch
    #[serde(rename = "batch-size")]
    pub batch_size: u32,

    /// Lower bound of the randomized pause after each batch (milliseconds)
    #[serde(rename = "inter-batch-delay-min-ms", default)]
    pub inter_batch_delay_min_ms: u64,

    /// Upper bound of the randomized pause after each batch (milliseconds)
    #[serde(rename = "inter-batch-delay-max-ms", default)]
    pub inter_batch_delay_max_ms: u64,

    /// Healing restarts allowed before a run gives up
    #[serde(rename = "max-heal-attempts", default = "default_max_heal_attempts")]
    pub max_heal_attempts: u32,
}

/// Cooling-off delays applied before a healing restart
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Delay after the action budget was exhausted (seconds, at least 60)
    #[serde(rename = "rate-limit-cooldown-secs", default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,

    /// Delay after a session or enumeration failure (seconds)
    #[serde(rename = "session-cooldown-secs", default = "default_session_cooldown")]
    pub session_cooldown_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
            session_cooldown_secs: default_session_cooldown(),
        }
    }
}

/// Where progress is persisted
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite checkpoint database
    #[serde(rename = "database-path")]
    pub database_path: PathBuf,

    /// Path to the JSON run-state file
    #[serde(rename = "state-path")]
    pub state_path: PathBuf,
}

/// An HTTP service the pipeline talks to
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Per-request timeout (milliseconds)
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Ingestion proxy settings
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,

    /// Consecutive failures before the circuit opens
    #[serde(rename = "failure-threshold", default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe (seconds)
    #[serde(rename = "recovery-timeout-secs", default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

/// Message history sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Opaque references passed through to the collaborators
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(rename = "credentials-ref")]
    pub credentials_ref: String,

    #[serde(rename = "session-token", default)]
    pub session_token: Option<String>,
}

fn default_max_heal_attempts() -> u32 {
    10
}

fn default_rate_limit_cooldown() -> u64 {
    900
}

fn default_session_cooldown() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}
