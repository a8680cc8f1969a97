//! Recovery controller
//!
//! Turns a failed run into either a healing plan (a successor run state plus a
//! cooling-off delay) or a terminal error. Classification happens exactly once,
//! here; the pipeline only decides whether an error is profile-local.

use crate::config::Config;
use crate::state::{build_healing, HealPhase, RunState};
use crate::HarvestError;
use std::fmt;
use std::time::Duration;

/// Rate-limit cooling-off is never shorter than this
pub const MIN_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Affects one profile only
    EntityLocal,

    /// The action budget refused an action
    AdmissionDenied,

    /// Authentication, navigation, crash or challenge in the automation session
    Session,

    /// Entity enumeration failed before the category had partitions
    Enumeration,

    /// Checkpoint unreadable or not writable
    Store,

    /// Malformed run state or configuration
    Validation,

    /// Healing already gave up
    Exhausted,
}

impl FailureClass {
    /// Whether a healing restart can make progress on this failure
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied | Self::Session | Self::Enumeration
        )
    }

    fn heal_phase(&self) -> Option<HealPhase> {
        match self {
            Self::AdmissionDenied => Some(HealPhase::RateLimitCooldown),
            Self::Session => Some(HealPhase::Session),
            Self::Enumeration => Some(HealPhase::ListCreation),
            _ => None,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EntityLocal => "entity-local",
            Self::AdmissionDenied => "admission-denied",
            Self::Session => "session",
            Self::Enumeration => "enumeration",
            Self::Store => "store",
            Self::Validation => "validation",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Classifies an error, looking through item context
pub fn classify(error: &HarvestError) -> FailureClass {
    match error.root_cause() {
        HarvestError::InvalidState(_) | HarvestError::Config(_) => FailureClass::Validation,
        HarvestError::RateLimitExceeded { .. } => FailureClass::AdmissionDenied,
        HarvestError::Checkpoint(_) | HarvestError::Io(_) | HarvestError::Encoding(_) => {
            FailureClass::Store
        }
        HarvestError::ListCreation(_) => FailureClass::Enumeration,
        HarvestError::Collaborator(e) if e.is_entity_local() => FailureClass::EntityLocal,
        HarvestError::Collaborator(_) => FailureClass::Session,
        HarvestError::HealingExhausted { .. } => FailureClass::Exhausted,
        // root_cause never returns the wrapper
        HarvestError::ItemFailed { .. } => FailureClass::Session,
    }
}

/// What the host should do next after a recoverable failure
#[derive(Debug, Clone, PartialEq)]
pub struct HealingPlan {
    /// Run state to restart with
    pub state: RunState,

    /// How long to wait before restarting
    pub cooling_off: Duration,

    pub class: FailureClass,
}

/// Decides between healing and giving up
#[derive(Debug, Clone)]
pub struct RecoveryController {
    max_heal_attempts: u32,
    rate_limit_cooldown: Duration,
    session_cooldown: Duration,
}

impl RecoveryController {
    pub fn new(
        max_heal_attempts: u32,
        rate_limit_cooldown: Duration,
        session_cooldown: Duration,
    ) -> Self {
        Self {
            max_heal_attempts,
            rate_limit_cooldown: rate_limit_cooldown.max(MIN_RATE_LIMIT_COOLDOWN),
            session_cooldown,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.pipeline.max_heal_attempts,
            Duration::from_secs(config.recovery.rate_limit_cooldown_secs),
            Duration::from_secs(config.recovery.session_cooldown_secs),
        )
    }

    /// Cooling-off applied before a restart for this class
    pub fn cooling_off(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::AdmissionDenied => self.rate_limit_cooldown,
            _ => self.session_cooldown,
        }
    }

    /// Handles a failed run
    ///
    /// Returns a healing plan for recoverable failures. Non-recoverable errors
    /// are returned unchanged; a recoverable failure past the attempt bound
    /// becomes `HealingExhausted`. Budget cool-downs never exhaust healing,
    /// and wait at least until the guard will admit again.
    pub fn handle_failure(
        &self,
        state: &RunState,
        error: HarvestError,
    ) -> Result<HealingPlan, HarvestError> {
        let class = classify(&error);

        let phase = match class.heal_phase() {
            Some(phase) => phase,
            None => {
                tracing::error!("Run failed ({}): {}", class, error);
                return Err(error);
            }
        };

        // Waiting out the budget always makes progress; only other restarts are bounded
        let attempts = state.runaway_attempts();
        if class != FailureClass::AdmissionDenied && attempts >= self.max_heal_attempts {
            tracing::error!(
                "Not healing after {} attempts; last failure: {}",
                attempts,
                error
            );
            return Err(HarvestError::HealingExhausted { attempts });
        }

        let mut healed = build_healing(state, phase, &error.to_string());
        if let HarvestError::ListCreation(list_creation) = error.root_cause() {
            healed.list_creation = Some(list_creation.clone());
        }

        let cooling_off = match error.root_cause() {
            HarvestError::RateLimitExceeded { retry_after, .. } => {
                self.cooling_off(class).max(*retry_after)
            }
            _ => self.cooling_off(class),
        };
        tracing::warn!(
            "Healing ({}) attempt {} ({}/{} counted), restarting in {:?}: {}",
            phase,
            healed.attempt_count,
            healed.runaway_attempts(),
            self.max_heal_attempts,
            cooling_off,
            error
        );

        Ok(HealingPlan {
            state: healed,
            cooling_off,
            class,
        })
    }
}
