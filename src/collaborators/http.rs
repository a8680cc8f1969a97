//! HTTP adapters for the collaborator traits
//!
//! This module talks to three services over JSON/HTTP:
//! - The browser automation sidecar, which owns one logged-in session per
//!   healing attempt (login, enumeration, profile detail, message history)
//! - The edge store API (existence check, upsert, bearer token)
//! - The ingestion proxy
//!
//! Every non-success status is classified into a [`CollaboratorError`] so the
//! pipeline can tell profile-local failures from session failures.

use crate::checkpoint::EntityMetadata;
use crate::collaborators::{
    Authenticator, AutomationDriver, CollaboratorError, CollaboratorResult, Enumeration,
    EnumerationResume, EntityRecord, HistoryMessage, HistoryService, IngestionService,
    RemoteStore,
};
use crate::config::EndpointConfig;
use crate::state::Category;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use url::Url;

/// Builds an HTTP client for one collaborator endpoint
///
/// # Arguments
///
/// * `config` - The endpoint configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &EndpointConfig) -> Result<Client, reqwest::Error> {
    let user_agent = format!("connection-harvest/{}", env!("CARGO_PKG_VERSION"));

    Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_millis(config.timeout_ms))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Parses an endpoint's base URL
fn parse_base(config: &EndpointConfig) -> CollaboratorResult<Url> {
    Url::parse(&config.base_url)
        .map_err(|e| CollaboratorError::Other(format!("invalid base url {}: {}", config.base_url, e)))
}

/// Appends path segments to a base URL, percent-encoding each one
///
/// Profile identifiers may contain slashes or spaces; each is kept as a single
/// segment.
fn endpoint_url(base: &Url, segments: &[&str]) -> CollaboratorResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CollaboratorError::Other(format!("{} cannot be a base url", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Maps a transport failure onto the collaborator taxonomy
fn transport_error(e: reqwest::Error) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Navigation(format!("request timed out: {}", e))
    } else {
        CollaboratorError::Transport(e.to_string())
    }
}

/// Classifies an HTTP error status
///
/// | Status | Error |
/// |--------|-------|
/// | 404 | NotFound |
/// | 410 | Deleted |
/// | 403 mentioning "private" | Private |
/// | 403 otherwise | ChallengeDetected |
/// | 422 | Malformed |
/// | 401 | Authentication |
/// | 429 | SiteRateLimited |
/// | 5xx | SessionCrashed |
pub(crate) fn classify_status(status: StatusCode, body: &str, subject: &str) -> CollaboratorError {
    let detail = if body.trim().is_empty() {
        subject.to_string()
    } else {
        format!("{}: {}", subject, body.trim())
    };

    match status {
        StatusCode::NOT_FOUND => CollaboratorError::NotFound(detail),
        StatusCode::GONE => CollaboratorError::Deleted(detail),
        StatusCode::FORBIDDEN if body.to_lowercase().contains("private") => {
            CollaboratorError::Private(detail)
        }
        StatusCode::FORBIDDEN => CollaboratorError::ChallengeDetected(detail),
        StatusCode::UNPROCESSABLE_ENTITY => CollaboratorError::Malformed(detail),
        StatusCode::UNAUTHORIZED => CollaboratorError::Authentication(detail),
        StatusCode::TOO_MANY_REQUESTS => CollaboratorError::SiteRateLimited(detail),
        s if s.is_server_error() => {
            CollaboratorError::SessionCrashed(format!("HTTP {} for {}", s.as_u16(), detail))
        }
        s => CollaboratorError::Other(format!("HTTP {} for {}", s.as_u16(), detail)),
    }
}

/// Returns the response if successful, otherwise its classified error
async fn check_status(response: Response, subject: &str) -> CollaboratorResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body, subject))
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: Response,
    subject: &str,
) -> CollaboratorResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| CollaboratorError::Malformed(format!("{}: {}", subject, e)))
}

// ===== Automation Driver =====

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    credentials_ref: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnumerateRequest<'a> {
    category: Category,
    expansion_passes: u32,
    known: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnumerateResponse {
    identifiers: Vec<String>,

    #[serde(default)]
    metadata: EntityMetadata,

    #[serde(default = "complete_by_default")]
    complete: bool,

    #[serde(default)]
    expansion_passes: u32,

    #[serde(default)]
    reason: Option<String>,
}

fn complete_by_default() -> bool {
    true
}

#[derive(Serialize)]
struct HistoryRequest<'a> {
    identifiers: &'a [String],
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    conversations: HashMap<String, Vec<HistoryMessage>>,
}

/// Client for one browser automation session
///
/// A driver is bound to the session it opened; a healing restart opens a new
/// one rather than reusing it.
pub struct HttpDriver {
    client: Client,
    base: Url,
    session_id: String,
}

impl HttpDriver {
    /// Opens a fresh automation session
    pub async fn open(config: &EndpointConfig) -> CollaboratorResult<Self> {
        let client = build_http_client(config).map_err(transport_error)?;
        let base = parse_base(config)?;

        let url = endpoint_url(&base, &["sessions"])?;
        let response = client.post(url).send().await.map_err(transport_error)?;
        let response = check_status(response, "open session").await?;
        let session: SessionResponse = decode(response, "open session").await?;

        tracing::info!("Opened automation session {}", session.session_id);

        Ok(Self {
            client,
            base,
            session_id: session.session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_url(&self, segments: &[&str]) -> CollaboratorResult<Url> {
        let mut all = vec!["sessions", self.session_id.as_str()];
        all.extend_from_slice(segments);
        endpoint_url(&self.base, &all)
    }
}

#[async_trait]
impl Authenticator for HttpDriver {
    async fn login(&self, credentials_ref: &str) -> CollaboratorResult<()> {
        let url = self.session_url(&["login"])?;
        let response = self
            .client
            .post(url)
            .json(&LoginRequest { credentials_ref })
            .send()
            .await
            .map_err(transport_error)?;

        // Any failure during login is an authentication failure
        check_status(response, "login").await.map_err(|e| match e {
            auth @ CollaboratorError::Authentication(_) => auth,
            other => CollaboratorError::Authentication(other.to_string()),
        })?;
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for HttpDriver {
    async fn enumerate_entities(
        &self,
        category: Category,
        resume: Option<&EnumerationResume>,
    ) -> CollaboratorResult<Enumeration> {
        let url = self.session_url(&["enumerate"])?;
        let known: &[String] = resume.map(|r| r.known.as_slice()).unwrap_or_default();
        let request = EnumerateRequest {
            category,
            expansion_passes: resume.map_or(0, |r| r.expansion_passes),
            known,
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        let subject = format!("enumerate {}", category);
        let response = check_status(response, &subject).await?;
        let listing: EnumerateResponse = decode(response, &subject).await?;

        if !listing.complete {
            return Err(CollaboratorError::EnumerationInterrupted {
                expansion_passes: listing.expansion_passes,
                partial: listing.identifiers,
                reason: listing
                    .reason
                    .unwrap_or_else(|| "listing incomplete".to_string()),
            });
        }

        Ok(Enumeration {
            identifiers: listing.identifiers,
            metadata: listing.metadata,
        })
    }

    async fn fetch_entity_detail(&self, identifier: &str) -> CollaboratorResult<EntityRecord> {
        let url = self.session_url(&["profiles", identifier])?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let response = check_status(response, identifier).await?;
        decode(response, identifier).await
    }
}

#[async_trait]
impl HistoryService for HttpDriver {
    async fn fetch_history(
        &self,
        identifiers: &[String],
    ) -> CollaboratorResult<HashMap<String, Vec<HistoryMessage>>> {
        let url = self.session_url(&["history"])?;
        let response = self
            .client
            .post(url)
            .json(&HistoryRequest { identifiers })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, "history").await?;
        let history: HistoryResponse = decode(response, "history").await?;
        Ok(history.conversations)
    }
}

// ===== Edge Store =====

#[derive(Serialize)]
struct UpsertRequest<'a> {
    status: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<&'a serde_json::Value>,
}

/// Client for the edge store API
pub struct HttpEdgeStore {
    client: Client,
    base: Url,
    token: RwLock<Option<String>>,
}

impl HttpEdgeStore {
    pub fn new(config: &EndpointConfig) -> CollaboratorResult<Self> {
        Ok(Self {
            client: build_http_client(config).map_err(transport_error)?,
            base: parse_base(config)?,
            token: RwLock::new(None),
        })
    }

    fn bearer(&self) -> Option<String> {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Re-labels a failed edge store call so it can never pass as a profile error
///
/// A 404 or 422 from the edge store means the store is misrouted or broken,
/// whatever the body says.
fn store_rejection(error: CollaboratorError) -> CollaboratorError {
    match error {
        CollaboratorError::NotFound(detail)
        | CollaboratorError::Private(detail)
        | CollaboratorError::Deleted(detail)
        | CollaboratorError::Malformed(detail)
        | CollaboratorError::ChallengeDetected(detail)
        | CollaboratorError::Other(detail) => CollaboratorError::StoreRejected(detail),
        other => other,
    }
}

#[async_trait]
impl RemoteStore for HttpEdgeStore {
    async fn exists(&self, identifier: &str) -> CollaboratorResult<bool> {
        let url = endpoint_url(&self.base, &["edges", identifier])?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, identifier)
            .await
            .map_err(store_rejection)?;
        Ok(true)
    }

    async fn upsert_record(
        &self,
        identifier: &str,
        status: &str,
        extra: Option<&serde_json::Value>,
    ) -> CollaboratorResult<()> {
        let url = endpoint_url(&self.base, &["edges", identifier])?;
        let response = self
            .authorize(self.client.put(url))
            .json(&UpsertRequest { status, extra })
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response, identifier)
            .await
            .map_err(store_rejection)?;
        Ok(())
    }

    fn set_auth_token(&self, token: &str) {
        match self.token.write() {
            Ok(mut slot) => *slot = Some(token.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(token.to_string()),
        }
    }
}

// ===== Ingestion =====

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestRequest<'a> {
    profile_id: &'a str,
    payload: &'a serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    document_id: String,
}

/// Client for the ingestion proxy
pub struct HttpIngestClient {
    client: Client,
    base: Url,
}

impl HttpIngestClient {
    pub fn new(config: &EndpointConfig) -> CollaboratorResult<Self> {
        Ok(Self {
            client: build_http_client(config).map_err(transport_error)?,
            base: parse_base(config)?,
        })
    }
}

#[async_trait]
impl IngestionService for HttpIngestClient {
    async fn ingest(
        &self,
        identifier: &str,
        payload: &serde_json::Value,
    ) -> CollaboratorResult<String> {
        let url = endpoint_url(&self.base, &["ingest"])?;
        let response = self
            .client
            .post(url)
            .json(&IngestRequest {
                profile_id: identifier,
                payload,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, identifier).await?;
        let ingested: IngestResponse = decode(response, identifier).await?;
        Ok(ingested.document_id)
    }
}
