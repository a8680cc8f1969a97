use crate::config::types::{
    CheckpointConfig, Config, CredentialsConfig, EndpointConfig, IngestConfig, PipelineConfig,
    RecoveryConfig,
};
use crate::recovery::MIN_RATE_LIMIT_COOLDOWN;
use crate::state::{AdvisoryCeilings, BudgetCeilings};
use crate::ConfigError;
use url::Url;

/// Largest batch a single checkpoint partition may hold
const MAX_BATCH_SIZE: u32 = 1000;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pipeline_config(&config.pipeline)?;
    validate_budget(&config.budget)?;
    validate_recovery_config(&config.recovery)?;
    validate_checkpoint_config(&config.checkpoint)?;
    validate_endpoint("driver", &config.driver)?;
    validate_endpoint("store", &config.store)?;
    if let Some(ingest) = &config.ingest {
        validate_ingest_config(ingest)?;
    }
    validate_credentials(&config.credentials)?;
    Ok(())
}

/// Validates pipeline configuration
fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 || config.batch_size > MAX_BATCH_SIZE {
        return Err(ConfigError::Validation(format!(
            "batch-size must be between 1 and {}, got {}",
            MAX_BATCH_SIZE, config.batch_size
        )));
    }

    if config.inter_batch_delay_min_ms > config.inter_batch_delay_max_ms {
        return Err(ConfigError::Validation(format!(
            "inter-batch-delay-min-ms ({}) exceeds inter-batch-delay-max-ms ({})",
            config.inter_batch_delay_min_ms, config.inter_batch_delay_max_ms
        )));
    }

    Ok(())
}

/// Validates advisory ceilings
///
/// Values above the local ceilings are accepted but have no effect.
fn validate_budget(advisory: &AdvisoryCeilings) -> Result<(), ConfigError> {
    for (name, value) in [
        ("per-minute", advisory.per_minute),
        ("per-hour", advisory.per_hour),
        ("per-day", advisory.per_day),
    ] {
        if value == Some(0) {
            return Err(ConfigError::Validation(format!(
                "budget {} must be >= 1",
                name
            )));
        }
    }

    if *advisory != AdvisoryCeilings::default()
        && BudgetCeilings::LOCAL.tightened_by(advisory) == BudgetCeilings::LOCAL
    {
        tracing::warn!("[budget] is looser than the local ceilings and has no effect");
    }

    Ok(())
}

/// Validates recovery configuration
fn validate_recovery_config(config: &RecoveryConfig) -> Result<(), ConfigError> {
    let floor = MIN_RATE_LIMIT_COOLDOWN.as_secs();
    if config.rate_limit_cooldown_secs < floor {
        return Err(ConfigError::Validation(format!(
            "rate-limit-cooldown-secs must be >= {}, got {}",
            floor, config.rate_limit_cooldown_secs
        )));
    }
    Ok(())
}

/// Validates checkpoint configuration
fn validate_checkpoint_config(config: &CheckpointConfig) -> Result<(), ConfigError> {
    if config.database_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.state_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "state-path cannot be empty".to_string(),
        ));
    }

    if config.database_path == config.state_path {
        return Err(ConfigError::Validation(
            "database-path and state-path must differ".to_string(),
        ));
    }

    Ok(())
}

/// Validates one service endpoint
fn validate_endpoint(section: &str, config: &EndpointConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url).map_err(|e| {
        ConfigError::InvalidUrl(format!("Invalid [{}] base-url: {}", section, e))
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "[{}] base-url must use http or https, got '{}'",
            section,
            url.scheme()
        )));
    }

    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl(format!(
            "[{}] base-url cannot be used as a base: '{}'",
            section, config.base_url
        )));
    }

    if config.timeout_ms < 100 {
        return Err(ConfigError::Validation(format!(
            "[{}] timeout-ms must be >= 100ms, got {}ms",
            section, config.timeout_ms
        )));
    }

    Ok(())
}

/// Validates ingestion configuration
fn validate_ingest_config(config: &IngestConfig) -> Result<(), ConfigError> {
    validate_endpoint("ingest", &config.endpoint)?;

    if config.failure_threshold < 1 {
        return Err(ConfigError::Validation(format!(
            "failure-threshold must be >= 1, got {}",
            config.failure_threshold
        )));
    }

    Ok(())
}

/// Validates the credential references
fn validate_credentials(config: &CredentialsConfig) -> Result<(), ConfigError> {
    if config.credentials_ref.trim().is_empty() {
        return Err(ConfigError::Validation(
            "credentials-ref cannot be empty".to_string(),
        ));
    }
    Ok(())
}
