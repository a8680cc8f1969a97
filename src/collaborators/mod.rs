//! External collaborators consumed by the pipeline
//!
//! The pipeline never talks to the browser automation session, the edge store
//! or the ingestion proxy directly. It goes through the narrow traits defined
//! here, bundled into a [`Collaborators`] set that is injected per run. A
//! healing restart always gets a brand-new set.

mod circuit_breaker;
mod http;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use http::{build_http_client, HttpDriver, HttpEdgeStore, HttpIngestClient};

use crate::checkpoint::EntityMetadata;
use crate::monitor::Monitor;
use crate::state::Category;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Message fragments that mark a failure as affecting one profile only
const ENTITY_LOCAL_PATTERNS: [&str; 5] = [
    "not found",
    "private",
    "deleted",
    "malformed",
    "does not exist",
];

/// Failures reported by external collaborators
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Profile is private: {0}")]
    Private(String),

    #[error("Profile was deleted: {0}")]
    Deleted(String),

    #[error("Malformed profile data: {0}")]
    Malformed(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Automation session crashed: {0}")]
    SessionCrashed(String),

    #[error("Security checkpoint detected: {0}")]
    ChallengeDetected(String),

    #[error("Rate limited by the site: {0}")]
    SiteRateLimited(String),

    #[error("Enumeration interrupted after {expansion_passes} passes ({} identifiers so far): {reason}", .partial.len())]
    EnumerationInterrupted {
        expansion_passes: u32,
        partial: Vec<String>,
        reason: String,
    },

    #[error("Circuit open for {service}, retry in {retry_in:?}")]
    CircuitOpen { service: String, retry_in: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    /// The edge store refused a request; never profile-local
    #[error("Edge store rejected request: {0}")]
    StoreRejected(String),

    #[error("{0}")]
    Other(String),
}

impl CollaboratorError {
    /// Returns true if the failure only affects the profile being processed
    pub fn is_entity_local(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::Private(_) | Self::Deleted(_) | Self::Malformed(_) => true,
            Self::Other(message) => {
                let message = message.to_lowercase();
                ENTITY_LOCAL_PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }
}

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Ordered entity list produced by enumerating one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enumeration {
    pub identifiers: Vec<String>,

    /// Side attributes harvested from the same listing, keyed by identifier
    #[serde(default)]
    pub metadata: EntityMetadata,
}

/// Where an interrupted enumeration left off
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationResume {
    pub expansion_passes: u32,
    pub known: Vec<String>,
}

/// Structured profile record returned by the automation driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identifier: String,

    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// One message of a conversation with a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub sender: String,
    pub body: String,

    #[serde(default)]
    pub sent_at: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Logs the automation session in with an opaque credential reference
    async fn login(&self, credentials_ref: &str) -> CollaboratorResult<()>;
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Lists every profile in a category, in a stable order
    ///
    /// `resume` carries the progress of an earlier interrupted attempt.
    async fn enumerate_entities(
        &self,
        category: Category,
        resume: Option<&EnumerationResume>,
    ) -> CollaboratorResult<Enumeration>;

    /// Fetches the full record of one profile
    async fn fetch_entity_detail(&self, identifier: &str) -> CollaboratorResult<EntityRecord>;
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns true if an edge for this profile already exists
    async fn exists(&self, identifier: &str) -> CollaboratorResult<bool>;

    /// Creates or replaces the edge for a profile
    async fn upsert_record(
        &self,
        identifier: &str,
        status: &str,
        extra: Option<&serde_json::Value>,
    ) -> CollaboratorResult<()>;

    fn set_auth_token(&self, token: &str);
}

#[async_trait]
pub trait IngestionService: Send + Sync {
    /// Submits a profile for ingestion and returns the document id
    async fn ingest(
        &self,
        identifier: &str,
        payload: &serde_json::Value,
    ) -> CollaboratorResult<String>;
}

#[async_trait]
pub trait HistoryService: Send + Sync {
    /// Fetches message history for a set of profiles
    async fn fetch_history(
        &self,
        identifiers: &[String],
    ) -> CollaboratorResult<HashMap<String, Vec<HistoryMessage>>>;
}

/// The collaborator set for one run
///
/// Cloning shares the underlying collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub authenticator: Arc<dyn Authenticator>,
    pub driver: Arc<dyn AutomationDriver>,
    pub store: Arc<dyn RemoteStore>,
    pub ingest: Option<Arc<dyn IngestionService>>,
    pub history: Option<Arc<dyn HistoryService>>,
    pub monitor: Arc<dyn Monitor>,
}
