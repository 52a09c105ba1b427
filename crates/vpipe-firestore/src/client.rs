//! Firestore REST API client.
//!
//! Covers the two calls the transcoding core needs: document get and
//! masked document patch. Requests carry a cached OAuth token, are retried
//! with backoff on transient failures, and are recorded as metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{info_span, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::token_cache::TokenCache;
use crate::types::{Document, Value};

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .ok()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                FirestoreError::auth_error("GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore")
            })?;

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID").unwrap_or_else(|_| "(default)".to_string()),
            timeout: Duration::from_secs(
                std::env::var("FIRESTORE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            connect_timeout: Duration::from_secs(
                std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            retry: RetryConfig::from_env(),
        })
    }

    /// Documents root URL for this project and database.
    pub fn documents_url(&self) -> String {
        format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }
}

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a client authenticated with the service account from
    /// `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| FirestoreError::auth_error(format!("Failed to load service account: {}", e)))?
            .ok_or_else(|| {
                FirestoreError::auth_error(
                    "GOOGLE_APPLICATION_CREDENTIALS not set. Set it to the path of your service account JSON file.",
                )
            })?;
        Self::with_token_provider(config, Arc::new(service_account))
    }

    /// Create a client with an explicit token provider.
    pub fn with_token_provider(config: FirestoreConfig, provider: Arc<dyn TokenProvider>) -> FirestoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("vpipe-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        Ok(Self {
            http,
            base_url: config.documents_url(),
            config,
            token_cache: Arc::new(TokenCache::new(provider)),
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> FirestoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?).await
    }

    fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, doc_id)
    }

    /// Get a document. Missing documents are `Ok(None)`.
    pub async fn get_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<Option<Document>> {
        let url = &self.document_url(collection, doc_id);

        self.observed("get_document", collection, doc_id, || async move {
            let response = self.send_authorized(|| self.http.get(url)).await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json::<Document>().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(error_from_response(status, url, response).await),
            }
        })
        .await
    }

    /// Patch only the fields named in `update_mask`.
    ///
    /// The request carries an `exists` precondition, so a missing document
    /// is reported as [`FirestoreError::NotFound`] and never created.
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: &[&str],
    ) -> FirestoreResult<Document> {
        let url = &patch_url(&self.document_url(collection, doc_id), update_mask);
        let body = &Document::new(fields);

        self.observed("update_document", collection, doc_id, || async move {
            let response = self.send_authorized(|| self.http.patch(url).json(body)).await?;
            let status = response.status();
            if status == StatusCode::OK {
                return Ok(response.json::<Document>().await?);
            }
            let body = response.text().await.unwrap_or_default();
            Err(update_error(status, &format!("{}/{}", collection, doc_id), body))
        })
        .await
    }

    /// Send with a bearer token; on an expired-token 401, refresh once and resend.
    async fn send_authorized<B>(&self, build: B) -> FirestoreResult<Response>
    where
        B: Fn() -> RequestBuilder,
    {
        let token = self.token_cache.get_token().await?;
        let response = build().bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !is_access_token_expired(&body) {
            return Err(FirestoreError::from_http_status(401, body));
        }

        self.token_cache.invalidate().await;
        let token = self.token_cache.get_token().await?;
        Ok(build().bearer_auth(&token).send().await?)
    }

    /// Retry, trace and record one logical operation.
    async fn observed<T, F, Fut>(
        &self,
        operation: &'static str,
        collection: &str,
        doc_id: &str,
        op: F,
    ) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = info_span!("firestore_request", operation, collection = %collection, doc_id = %doc_id);
        let start = Instant::now();
        let result = with_retry(&self.config.retry, operation, op).instrument(span).await;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, start.elapsed().as_secs_f64());

        result
    }
}

fn is_access_token_expired(body: &str) -> bool {
    body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
}

/// Document URL with `updateMask.fieldPaths` parameters and the
/// `currentDocument.exists=true` precondition.
fn patch_url(document_url: &str, update_mask: &[&str]) -> String {
    let mut params: Vec<String> = update_mask
        .iter()
        .map(|f| format!("updateMask.fieldPaths={}", f))
        .collect();
    params.push("currentDocument.exists=true".to_string());
    format!("{}?{}", document_url, params.join("&"))
}

/// Error for a failed patch. A failed `exists` precondition means the
/// document is gone.
fn update_error(status: StatusCode, path: &str, body: String) -> FirestoreError {
    match status {
        StatusCode::NOT_FOUND => FirestoreError::not_found(path),
        _ if body.contains("FAILED_PRECONDITION") => FirestoreError::not_found(path),
        status => FirestoreError::from_http_status(status.as_u16(), format!("{} update failed: {}", path, body)),
    }
}

async fn error_from_response(status: StatusCode, url: &str, response: Response) -> FirestoreError {
    let body = response.text().await.unwrap_or_default();
    FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
}
