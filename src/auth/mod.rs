//! Authentication and authorisation subsystem.
//!
//! Every decision is delegated to a [`Provider`] (the external authorization
//! service, or a mock for local testing).  Transports never talk to the
//! provider directly; they go through the fail-closed [`AuthorizationGate`].

pub mod authserver;
pub mod gate;
pub mod keys;
pub mod mock;

use std::sync::Arc;

use anyhow::Result;
use russh_keys::key::PublicKey;
use tracing::warn;

use crate::config::{AuthServerConfig, TimeoutConfig};
use crate::git::GitOperation;

pub use gate::AuthorizationGate;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The party a request is authorized for.
///
/// `user` is always the end-user identity.  `token` is the user's access
/// token when the transport obtained one (HTTP); SSH sessions authenticate by
/// public key and carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user: String,
    pub token: Option<String>,
}

impl Subject {
    pub fn with_token(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: Some(token.into()),
        }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("authorization service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("authorization service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed authorization service response: {0}")]
    Malformed(String),
    #[error("authorization service timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Capability interface of an authorization service.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Exchange a username and password for an access token.
    async fn login(&self, user: &str, password: &str) -> Result<String, AuthError>;

    /// Whether `subject` may perform `operation` on `repository`.
    async fn is_authorized(
        &self,
        subject: &Subject,
        repository: &str,
        operation: GitOperation,
    ) -> Result<bool, AuthError>;

    /// Resolve an access token to the user it belongs to.
    async fn fetch_user_profile(&self, token: &str) -> Result<UserProfile, AuthError>;

    /// Public keys registered for `user`.
    async fn fetch_public_keys(&self, user: &str) -> Result<Vec<PublicKey>, AuthError>;

    /// Whether `key` belongs to `user`.  Defaults to an exact match against
    /// [`Provider::fetch_public_keys`].
    async fn validate_public_key(&self, user: &str, key: &PublicKey) -> Result<bool, AuthError> {
        let known = self.fetch_public_keys(user).await?;
        Ok(known.iter().any(|k| keys::same_key(k, key)))
    }

    /// Short name for logs and the health endpoint.
    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured [`Provider`].
pub fn build_provider(
    config: &AuthServerConfig,
    timeouts: &TimeoutConfig,
) -> Result<Arc<dyn Provider>> {
    if config.mock {
        warn!("using mock authorization provider; every request is allowed");
        return Ok(Arc::new(mock::MockProvider));
    }
    Ok(Arc::new(authserver::AuthServerProvider::new(config, timeouts)?))
}
