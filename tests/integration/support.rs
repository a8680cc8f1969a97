//! In-process collaborators and helpers shared by the integration tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use connection_harvest::collaborators::{
    Authenticator, AutomationDriver, CollaboratorError, CollaboratorResult, Collaborators,
    EntityRecord, Enumeration, EnumerationResume, HistoryMessage, HistoryService,
    IngestionService, RemoteStore,
};
use connection_harvest::monitor::TracingMonitor;
use connection_harvest::recovery::RecoveryController;
use connection_harvest::state::{
    build_initial, ActionBudgetGuard, Category, InitialParams, RunState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn profile_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("p{}", i)).collect()
}

/// Scripted automation session
#[derive(Default)]
pub struct FakeDriver {
    lists: HashMap<Category, Vec<String>>,
    one_shot_failures: Mutex<HashMap<String, CollaboratorError>>,
    persistent_failures: HashMap<String, CollaboratorError>,
    interruptions: Mutex<HashMap<Category, CollaboratorError>>,
    conversations: HashMap<String, Vec<HistoryMessage>>,
    history_fails: bool,
    stop_after: Option<(String, Arc<AtomicBool>)>,
    stop_every: Option<(usize, Arc<AtomicBool>)>,
    hangs: Mutex<HashSet<String>>,

    pub fetched: Mutex<Vec<String>>,
    pub resumes: Mutex<Vec<(Category, Option<EnumerationResume>)>>,
    pub logins: Mutex<Vec<String>>,
}

impl FakeDriver {
    /// `count` mutual connections and no pending requests
    pub fn with_mutuals(count: usize) -> Self {
        let mut lists = HashMap::new();
        lists.insert(Category::Mutual, profile_ids(count));
        Self {
            lists,
            ..Default::default()
        }
    }

    pub fn with_list(mut self, category: Category, identifiers: Vec<String>) -> Self {
        self.lists.insert(category, identifiers);
        self
    }

    /// Fails the first fetch of `identifier`, then behaves
    pub fn fail_once(self, identifier: &str, error: CollaboratorError) -> Self {
        self.one_shot_failures
            .lock()
            .unwrap()
            .insert(identifier.to_string(), error);
        self
    }

    /// Fails every fetch of `identifier`
    pub fn fail_always(mut self, identifier: &str, error: CollaboratorError) -> Self {
        self.persistent_failures
            .insert(identifier.to_string(), error);
        self
    }

    /// Interrupts the first enumeration of `category`
    pub fn interrupt_once(self, category: Category, error: CollaboratorError) -> Self {
        self.interruptions.lock().unwrap().insert(category, error);
        self
    }

    pub fn with_conversation(mut self, identifier: &str, body: &str) -> Self {
        self.conversations.insert(
            identifier.to_string(),
            vec![HistoryMessage {
                sender: identifier.to_string(),
                body: body.to_string(),
                sent_at: None,
            }],
        );
        self
    }

    pub fn failing_history(mut self) -> Self {
        self.history_fails = true;
        self
    }

    /// Raises `stop` once `identifier` has been fetched
    pub fn stop_after(mut self, identifier: &str, stop: Arc<AtomicBool>) -> Self {
        self.stop_after = Some((identifier.to_string(), stop));
        self
    }

    /// Raises `stop` after every `count` fetches
    pub fn stop_every(mut self, count: usize, stop: Arc<AtomicBool>) -> Self {
        self.stop_every = Some((count, stop));
        self
    }

    /// Never answers the first fetch of `identifier`, like a wedged browser
    pub fn hang_once(self, identifier: &str) -> Self {
        self.hangs.lock().unwrap().insert(identifier.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn clear_fetched(&self) {
        self.fetched.lock().unwrap().clear();
    }
}

#[async_trait]
impl Authenticator for FakeDriver {
    async fn login(&self, credentials_ref: &str) -> CollaboratorResult<()> {
        self.logins.lock().unwrap().push(credentials_ref.to_string());
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn enumerate_entities(
        &self,
        category: Category,
        resume: Option<&EnumerationResume>,
    ) -> CollaboratorResult<Enumeration> {
        self.resumes
            .lock()
            .unwrap()
            .push((category, resume.cloned()));

        if let Some(error) = self.interruptions.lock().unwrap().remove(&category) {
            return Err(error);
        }

        Ok(Enumeration {
            identifiers: self.lists.get(&category).cloned().unwrap_or_default(),
            metadata: Default::default(),
        })
    }

    async fn fetch_entity_detail(&self, identifier: &str) -> CollaboratorResult<EntityRecord> {
        let hang = self.hangs.lock().unwrap().remove(identifier);
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.one_shot_failures.lock().unwrap().remove(identifier) {
            return Err(error);
        }
        if let Some(error) = self.persistent_failures.get(identifier) {
            return Err(error.clone());
        }

        let fetched = {
            let mut fetched = self.fetched.lock().unwrap();
            fetched.push(identifier.to_string());
            fetched.len()
        };
        if let Some((trigger, stop)) = &self.stop_after {
            if trigger == identifier {
                stop.store(true, Ordering::SeqCst);
            }
        }
        if let Some((count, stop)) = &self.stop_every {
            if fetched % count == 0 {
                stop.store(true, Ordering::SeqCst);
            }
        }

        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "name".to_string(),
            serde_json::json!(format!("Profile {}", identifier)),
        );
        Ok(EntityRecord {
            identifier: identifier.to_string(),
            attributes,
        })
    }
}

#[async_trait]
impl HistoryService for FakeDriver {
    async fn fetch_history(
        &self,
        identifiers: &[String],
    ) -> CollaboratorResult<HashMap<String, Vec<HistoryMessage>>> {
        if self.history_fails {
            return Err(CollaboratorError::Navigation(
                "messaging page did not load".to_string(),
            ));
        }
        Ok(self
            .conversations
            .iter()
            .filter(|(id, _)| identifiers.contains(id))
            .map(|(id, messages)| (id.clone(), messages.clone()))
            .collect())
    }
}

/// Edge store kept in memory
#[derive(Default)]
pub struct FakeEdgeStore {
    pub edges: Mutex<HashMap<String, (String, Option<serde_json::Value>)>>,
    pub token: Mutex<Option<String>>,
}

impl FakeEdgeStore {
    pub fn preloaded(identifiers: &[String]) -> Self {
        let store = Self::default();
        {
            let mut edges = store.edges.lock().unwrap();
            for id in identifiers {
                edges.insert(id.clone(), ("ally".to_string(), None));
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.edges.lock().unwrap().len()
    }

    pub fn edge(&self, identifier: &str) -> Option<(String, Option<serde_json::Value>)> {
        self.edges.lock().unwrap().get(identifier).cloned()
    }
}

#[async_trait]
impl RemoteStore for FakeEdgeStore {
    async fn exists(&self, identifier: &str) -> CollaboratorResult<bool> {
        Ok(self.edges.lock().unwrap().contains_key(identifier))
    }

    async fn upsert_record(
        &self,
        identifier: &str,
        status: &str,
        extra: Option<&serde_json::Value>,
    ) -> CollaboratorResult<()> {
        self.edges
            .lock()
            .unwrap()
            .insert(identifier.to_string(), (status.to_string(), extra.cloned()));
        Ok(())
    }

    fn set_auth_token(&self, token: &str) {
        *self.token.lock().unwrap() = Some(token.to_string());
    }
}

#[derive(Default)]
pub struct FakeIngest {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl IngestionService for FakeIngest {
    async fn ingest(
        &self,
        identifier: &str,
        _payload: &serde_json::Value,
    ) -> CollaboratorResult<String> {
        self.calls.lock().unwrap().push(identifier.to_string());
        Ok(format!("doc-{}", identifier))
    }
}

/// The fakes wired up as one collaborator set
#[derive(Clone)]
pub struct Harness {
    pub driver: Arc<FakeDriver>,
    pub store: Arc<FakeEdgeStore>,
    pub ingest: Arc<FakeIngest>,
    pub monitor: Arc<TracingMonitor>,
}

impl Harness {
    pub fn new(driver: FakeDriver) -> Self {
        Self::with_store(driver, FakeEdgeStore::default())
    }

    pub fn with_store(driver: FakeDriver, store: FakeEdgeStore) -> Self {
        Self {
            driver: Arc::new(driver),
            store: Arc::new(store),
            ingest: Arc::new(FakeIngest::default()),
            monitor: Arc::new(TracingMonitor::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            authenticator: self.driver.clone(),
            driver: self.driver.clone(),
            store: self.store.clone(),
            ingest: Some(self.ingest.clone()),
            history: Some(self.driver.clone()),
            monitor: self.monitor.clone(),
        }
    }
}

pub fn initial_state() -> RunState {
    build_initial(InitialParams {
        credentials_ref: Some("vault://test/primary".to_string()),
        batch_size: Some(100),
        ..Default::default()
    })
}

/// Guard whose clock moves five minutes per reading
///
/// Keeps the minute and hour windows nearly empty so long runs never hit
/// the local ceilings.
pub fn stepping_guard() -> ActionBudgetGuard {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let ticks = Arc::new(AtomicI64::new(0));
    ActionBudgetGuard::new().with_clock(Arc::new(move || {
        let tick = ticks.fetch_add(1, Ordering::SeqCst);
        start + chrono::Duration::seconds(300 * tick)
    }))
}

/// Controller that restarts sessions immediately
pub fn controller(max_heal_attempts: u32) -> RecoveryController {
    RecoveryController::new(max_heal_attempts, Duration::from_secs(60), Duration::ZERO)
}
