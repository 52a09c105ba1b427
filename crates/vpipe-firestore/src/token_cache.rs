//! Access token cache for Firestore authentication.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// OAuth scope for the Firestore REST API.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }

    fn unexpired(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared token cache. Concurrent callers wait on one refresh.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    slot: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            slot: RwLock::new(None),
        }
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }

    /// Return a token valid for at least the refresh margin.
    pub async fn get_token(&self) -> FirestoreResult<String> {
        if let Some(token) = self.slot.read().await.as_ref() {
            if token.fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.slot.write().await;
        if let Some(token) = slot.as_ref() {
            if token.fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        match self.provider.token(&[FIRESTORE_SCOPE]).await {
            Ok(token) => {
                let remaining = (token.expires_at() - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                let cached = CachedToken {
                    value: token.as_str().to_string(),
                    expires_at: Instant::now() + remaining,
                };
                debug!(ttl_secs = remaining.as_secs(), "Refreshed Firestore access token");
                let value = cached.value.clone();
                *slot = Some(cached);
                Ok(value)
            }
            // Keep serving an unexpired token when refresh fails
            Err(e) => match slot.as_ref() {
                Some(token) if token.unexpired(Instant::now()) => {
                    warn!("Token refresh failed, reusing current token: {}", e);
                    Ok(token.value.clone())
                }
                _ => Err(FirestoreError::auth_error(format!(
                    "Failed to obtain auth token: {}",
                    e
                ))),
            },
        }
    }
}
