//! Session credential lifecycle.
//!
//! A long-lived refresh secret is exchanged for short-lived session
//! credentials. [`SessionManager::ensure_valid`] returns the cached credential
//! while it is fresh and renews it otherwise, coalescing concurrent renewals
//! into a single exchange call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::ApiError;

/// Short-lived bearer token with an absolute expiry.
#[derive(Clone, Debug)]
pub struct Credential {
    token: SecretString,
    expires_at: SystemTime,
}

impl Credential {
    pub fn new(token: SecretString, expires_at: SystemTime) -> Self {
        Self { token, expires_at }
    }

    /// Builds a credential from the exchange response's epoch-second expiry.
    pub fn from_epoch_seconds(token: SecretString, expires: u64) -> Self {
        Self::new(token, UNIX_EPOCH + Duration::from_secs(expires))
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

/// Exchanges a refresh secret for a fresh session credential.
///
/// Implemented by [`crate::api::ApiClient`] over HTTP.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_secret: &SecretString) -> Result<Credential, ApiError>;
}

/// Renewal failures. Cloneable so every caller waiting on a coalesced
/// renewal receives the same outcome.
#[derive(Clone, Debug, Error)]
pub enum SessionError {
    /// The refresh secret was rejected.
    #[error("refresh secret was rejected by the token exchange")]
    Unauthorized,

    /// The token exchange failed on the server side.
    #[error("token exchange failed with server status {status}: {detail}")]
    ServerError { status: u16, detail: String },

    /// Transport, parse, or unexpected status failure during the exchange.
    #[error("token exchange failed: {0}")]
    Exchange(Arc<ApiError>),
}

impl From<ApiError> for SessionError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => Self::Unauthorized,
            ApiError::ServerError { status, body } => Self::ServerError {
                status: status.as_u16(),
                detail: body,
            },
            other => Self::Exchange(Arc::new(other)),
        }
    }
}

/// Owns the refresh secret and the cached session credential.
pub struct SessionManager {
    exchange: Arc<dyn TokenExchange>,
    refresh_secret: SecretString,
    current: RwLock<Option<Credential>>,
    // Holds the outcome of the last failed renewal; locking it serializes
    // renewals.
    renewal: Mutex<Option<SessionError>>,
    renewals: AtomicU64,
}

impl SessionManager {
    pub fn new(exchange: Arc<dyn TokenExchange>, refresh_secret: SecretString) -> Self {
        Self {
            exchange,
            refresh_secret,
            current: RwLock::new(None),
            renewal: Mutex::new(None),
            renewals: AtomicU64::new(0),
        }
    }

    /// Returns a credential that has not expired, renewing it when needed.
    ///
    /// Callers that arrive while a renewal is in flight wait for it and share
    /// its result instead of issuing their own exchange. A failed renewal is
    /// not cached; the next call after it completes tries again.
    pub async fn ensure_valid(&self) -> Result<Credential, SessionError> {
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }

        let observed = self.renewals.load(Ordering::Acquire);
        let mut last_failure = self.renewal.lock().await;

        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }
        if self.renewals.load(Ordering::Acquire) != observed {
            if let Some(error) = last_failure.as_ref() {
                return Err(error.clone());
            }
        }

        let outcome = self.exchange.exchange(&self.refresh_secret).await;
        self.renewals.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(credential) => {
                debug!(
                    event = "session_credential_renewed",
                    expires_in_secs = credential
                        .expires_at()
                        .duration_since(SystemTime::now())
                        .unwrap_or_default()
                        .as_secs()
                );
                self.store(Some(credential.clone()));
                *last_failure = None;
                Ok(credential)
            }
            Err(error) => {
                let error = SessionError::from(error);
                warn!(event = "session_credential_renewal_failed", error = %error);
                *last_failure = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Cached credential, which may already be expired.
    pub fn current(&self) -> Option<Credential> {
        self.current
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Drops the cached credential so the next call renews.
    pub fn invalidate(&self) {
        self.store(None);
    }

    fn fresh_credential(&self) -> Option<Credential> {
        self.current().filter(|credential| !credential.is_expired())
    }

    fn store(&self, credential: Option<Credential>) {
        if let Ok(mut guard) = self.current.write() {
            *guard = credential;
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("current", &self.current())
            .field("renewals", &self.renewals.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
