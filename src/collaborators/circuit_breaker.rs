//! Circuit breaker around the ingestion service
//!
//! Ingestion is best-effort, so when the proxy is down the pipeline should stop
//! paying a timeout per profile. The breaker moves through
//! Closed -> Open -> HalfOpen -> Closed:
//! - Opens after `failure_threshold` consecutive failures
//! - Rejects calls while open, until `recovery_timeout` has elapsed
//! - Lets one probe through while half-open; success closes, failure reopens

use crate::collaborators::{CollaboratorError, CollaboratorResult, IngestionService};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    /// A probe is in flight
    HalfOpen,
}

/// Ingestion service wrapped with a circuit breaker
pub struct CircuitBreaker {
    name: String,
    inner: Arc<dyn IngestionService>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        inner: Arc<dyn IngestionService>,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            inner,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            phase: Mutex::new(Phase::Closed { failures: 0 }),
        }
    }

    /// Current state, accounting for an elapsed recovery timeout
    pub fn state(&self) -> BreakerState {
        match &*self.lock() {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { since } if since.elapsed() >= self.recovery_timeout => {
                BreakerState::HalfOpen
            }
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen => BreakerState::HalfOpen,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Decides whether a call may go through
    fn acquire(&self) -> CollaboratorResult<()> {
        let mut phase = self.lock();
        match &*phase {
            Phase::Closed { .. } => Ok(()),
            Phase::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.recovery_timeout {
                    tracing::info!("Circuit {} half-open, sending probe", self.name);
                    *phase = Phase::HalfOpen;
                    Ok(())
                } else {
                    Err(self.open_error(self.recovery_timeout - elapsed))
                }
            }
            Phase::HalfOpen => Err(self.open_error(Duration::ZERO)),
        }
    }

    fn record_success(&self) {
        let mut phase = self.lock();
        if !matches!(*phase, Phase::Closed { failures: 0 }) {
            tracing::debug!("Circuit {} closed", self.name);
        }
        *phase = Phase::Closed { failures: 0 };
    }

    fn record_failure(&self) {
        let mut phase = self.lock();
        let next = match &*phase {
            Phase::Closed { failures } if failures + 1 < self.failure_threshold => {
                Phase::Closed {
                    failures: failures + 1,
                }
            }
            _ => {
                tracing::warn!(
                    "Circuit {} open for {:?}",
                    self.name,
                    self.recovery_timeout
                );
                Phase::Open {
                    since: Instant::now(),
                }
            }
        };
        *phase = next;
    }

    fn open_error(&self, retry_in: Duration) -> CollaboratorError {
        CollaboratorError::CircuitOpen {
            service: self.name.clone(),
            retry_in,
        }
    }
}

#[async_trait]
impl IngestionService for CircuitBreaker {
    async fn ingest(
        &self,
        identifier: &str,
        payload: &serde_json::Value,
    ) -> CollaboratorResult<String> {
        self.acquire()?;

        match self.inner.ingest(identifier, payload).await {
            Ok(document_id) => {
                self.record_success();
                Ok(document_id)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}
