//! Supervisor - the restart loop around the pipeline
//!
//! The pipeline never restarts itself. The supervisor persists whatever state
//! comes back, waits out the cooling-off, opens a brand-new collaborator set
//! and invokes the pipeline again.

use crate::checkpoint::CheckpointStore;
use crate::collaborators::{
    CircuitBreaker, Collaborators, HttpDriver, HttpEdgeStore, HttpIngestClient, IngestionService,
};
use crate::config::Config;
use crate::monitor::Monitor;
use crate::pipeline::{run_pipeline, PipelineSettings, RunOutcome};
use crate::recovery::RecoveryController;
use crate::state::{clear_run_state, save_run_state, ActionBudgetGuard, RunState};
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opens a fresh collaborator set for each invocation
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// `attempt` is the run state's attempt count
    async fn open_session(&self, attempt: u32) -> Result<Collaborators>;
}

/// Session factory backed by the HTTP collaborators
///
/// Each session gets a new automation session and edge store client. The
/// ingestion circuit breaker and the monitor outlive sessions.
pub struct HttpSessionFactory {
    config: Config,
    ingest: Option<Arc<dyn IngestionService>>,
    monitor: Arc<dyn Monitor>,
}

impl HttpSessionFactory {
    pub fn new(config: Config, monitor: Arc<dyn Monitor>) -> Result<Self> {
        let ingest = match &config.ingest {
            Some(ingest) => {
                let client: Arc<dyn IngestionService> =
                    Arc::new(HttpIngestClient::new(&ingest.endpoint)?);
                let breaker: Arc<dyn IngestionService> = Arc::new(CircuitBreaker::new(
                    "ingest",
                    client,
                    ingest.failure_threshold,
                    Duration::from_secs(ingest.recovery_timeout_secs),
                ));
                Some(breaker)
            }
            None => None,
        };

        Ok(Self {
            config,
            ingest,
            monitor,
        })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open_session(&self, attempt: u32) -> Result<Collaborators> {
        tracing::debug!("Opening automation session for attempt {}", attempt);
        let driver = Arc::new(HttpDriver::open(&self.config.driver).await?);
        let store = Arc::new(HttpEdgeStore::new(&self.config.store)?);

        Ok(Collaborators {
            authenticator: driver.clone(),
            driver: driver.clone(),
            store,
            ingest: self.ingest.clone(),
            history: if self.config.history.enabled {
                Some(driver)
            } else {
                None
            },
            monitor: self.monitor.clone(),
        })
    }
}

/// How a supervised run ended
#[derive(Debug)]
pub enum SupervisedOutcome {
    Completed(crate::pipeline::RunReport),
    Stopped(RunState),
}

/// Restart loop owning the checkpoint store and the action budget
pub struct Supervisor<'a> {
    factory: &'a dyn SessionFactory,
    store: &'a mut dyn CheckpointStore,
    guard: ActionBudgetGuard,
    settings: PipelineSettings,
    controller: RecoveryController,
    state_path: Option<PathBuf>,
    stop: Arc<AtomicBool>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        factory: &'a dyn SessionFactory,
        store: &'a mut dyn CheckpointStore,
        guard: ActionBudgetGuard,
        settings: PipelineSettings,
        controller: RecoveryController,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            factory,
            store,
            guard,
            settings,
            controller,
            state_path: None,
            stop,
        }
    }

    /// Persists the run state to this file at every hand-off
    ///
    /// The pipeline also rewrites it after creating the checkpoint index and
    /// after every batch commit, so a killed process resumes from its last
    /// committed batch.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.settings.state_file = Some(path.clone());
        self.state_path = Some(path);
        self
    }

    /// Runs the pipeline until it completes, stops, or fails for good
    pub async fn run(&mut self, initial: RunState) -> Result<SupervisedOutcome> {
        let mut state = initial;

        loop {
            let collaborators = match self.factory.open_session(state.attempt_count).await {
                Ok(collaborators) => collaborators,
                Err(e) => {
                    tracing::warn!("Could not open a session: {}", e);
                    let plan = self.controller.handle_failure(&state, e)?;
                    self.persist(&plan.state)?;
                    if self.cool_off(plan.cooling_off).await {
                        return Ok(SupervisedOutcome::Stopped(plan.state));
                    }
                    state = plan.state;
                    continue;
                }
            };

            let outcome = run_pipeline(
                state,
                collaborators,
                &mut *self.store,
                &mut self.guard,
                &self.settings,
                &self.controller,
                self.stop.clone(),
            )
            .await?;

            match outcome {
                RunOutcome::Completed(report) => {
                    if let Some(path) = &self.state_path {
                        clear_run_state(path)?;
                    }
                    return Ok(SupervisedOutcome::Completed(report));
                }
                RunOutcome::Stopped(stopped) => {
                    self.persist(&stopped)?;
                    return Ok(SupervisedOutcome::Stopped(stopped));
                }
                RunOutcome::Healing(plan) => {
                    self.persist(&plan.state)?;

                    if self.cool_off(plan.cooling_off).await {
                        tracing::info!("Stop requested during cooling-off");
                        return Ok(SupervisedOutcome::Stopped(plan.state));
                    }
                    state = plan.state;
                }
            }
        }
    }

    fn persist(&self, state: &RunState) -> Result<()> {
        match &self.state_path {
            Some(path) => save_run_state(path, state),
            None => Ok(()),
        }
    }

    /// Sleeps out the cooling-off; returns true if a stop was requested
    async fn cool_off(&self, delay: Duration) -> bool {
        const TICK: Duration = Duration::from_secs(1);

        tracing::info!("Cooling off for {:?} before restarting", delay);
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.stop.load(Ordering::SeqCst) {
                return true;
            }
            let step = remaining.min(TICK);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        self.stop.load(Ordering::SeqCst)
    }
}
