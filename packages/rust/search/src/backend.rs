//! Search service backends.
//!
//! A backend performs single REST calls and reports the raw HTTP status. It
//! returns `Err` only when no response was obtained at all; judging a status
//! is left to the provisioner.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;
use url::Url;

use siteindexer_shared::{Result, RetryPolicy, SearchSettings, Secret, SiteIndexerError, retry};

use crate::resource::ResourceRef;

/// User-Agent string for management requests.
const USER_AGENT: &str = concat!("siteindexer/", env!("CARGO_PKG_VERSION"));

/// Status and body of one management call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
}

impl BackendResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Management operations against a search service.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// GET the resource definition.
    async fn exists(&self, resource: &ResourceRef) -> Result<BackendResponse>;

    /// Create or replace the resource with `payload`.
    async fn upsert(&self, resource: &ResourceRef, payload: &Value) -> Result<BackendResponse>;

    /// Clear the indexer's change-tracking state.
    async fn reset_indexer(&self, name: &str) -> Result<BackendResponse>;

    /// Start an on-demand indexer run.
    async fn run_indexer(&self, name: &str) -> Result<BackendResponse>;
}

// ---------------------------------------------------------------------------
// REST backend
// ---------------------------------------------------------------------------

/// Backend speaking the search service's management REST API.
pub struct RestSearchBackend {
    client: Client,
    endpoint: Url,
    api_key: Secret,
    api_version: String,
    retry: RetryPolicy,
}

impl RestSearchBackend {
    pub fn new(settings: &SearchSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SiteIndexerError::Network(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            api_version: settings.api_version.clone(),
            retry: settings.retry.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = self
            .endpoint
            .join(path)
            .map_err(|e| SiteIndexerError::Search(format!("invalid resource path {path}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url)
    }

    /// Send one request, retrying throttling and server errors. When the
    /// retry budget runs out the last response is returned as is.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<BackendResponse> {
        let url = self.url(path)?;
        let last_body = Mutex::new(String::new());

        let result = retry(&self.retry, "search request", || async {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header("api-key", self.api_key.expose());
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SiteIndexerError::Network(format!("{method} {path}: {e}")))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| SiteIndexerError::Network(format!("{method} {path}: {e}")))?;
            debug!(%method, path, status, "search request");

            let error = SiteIndexerError::Http {
                url: format!("{method} {path}"),
                status,
            };
            if error.is_transient() {
                if let Ok(mut last) = last_body.lock() {
                    *last = text;
                }
                return Err(error);
            }
            Ok(BackendResponse::new(status, text))
        })
        .await;

        match result {
            Err(SiteIndexerError::Http { status, .. }) => {
                let body = last_body.into_inner().unwrap_or_default();
                Ok(BackendResponse::new(status, body))
            }
            other => other,
        }
    }
}

#[async_trait]
impl SearchBackend for RestSearchBackend {
    async fn exists(&self, resource: &ResourceRef) -> Result<BackendResponse> {
        self.send(Method::GET, &resource.path(), None).await
    }

    async fn upsert(&self, resource: &ResourceRef, payload: &Value) -> Result<BackendResponse> {
        self.send(Method::PUT, &resource.path(), Some(payload)).await
    }

    async fn reset_indexer(&self, name: &str) -> Result<BackendResponse> {
        self.send(Method::POST, &format!("indexers/{name}/reset"), None)
            .await
    }

    async fn run_indexer(&self, name: &str) -> Result<BackendResponse> {
        self.send(Method::POST, &format!("indexers/{name}/run"), None)
            .await
    }
}
