//! Timeout-bounded, fail-closed access to the configured authorization
//! provider.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh_keys::key::PublicKey;
use tracing::{debug, info, warn};

use super::{keys, AuthError, Provider, Subject};
use crate::git::GitOperation;

/// Fail-closed façade over a [`Provider`].
///
/// Every provider call is bounded by a timeout, and any failure on the
/// authorization path (transport error, timeout, malformed response) is
/// reported as a denial.
#[derive(Clone)]
pub struct AuthorizationGate {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl AuthorizationGate {
    pub fn new(provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider_kind(&self) -> &'static str {
        self.provider.kind()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, AuthError>>,
    ) -> Result<T, AuthError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| AuthError::Timeout)?
    }

    /// Log in with a username and password, returning an access token.
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<String, AuthError> {
        let token = self.bounded(self.provider.login(user, password)).await?;
        if token.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }
        debug!(%user, "login succeeded");
        Ok(token)
    }

    /// Resolve an access token to the [`Subject`] it identifies.
    pub async fn identify(&self, token: &str) -> Result<Subject, AuthError> {
        let profile = self.bounded(self.provider.fetch_user_profile(token)).await?;
        if profile.id.is_empty() {
            return Err(AuthError::Malformed("empty user id".into()));
        }
        Ok(Subject::with_token(profile.id, token))
    }

    pub async fn is_authorized(
        &self,
        subject: &Subject,
        repository: &str,
        operation: GitOperation,
    ) -> bool {
        match self
            .bounded(self.provider.is_authorized(subject, repository, operation))
            .await
        {
            Ok(true) => {
                debug!(user = %subject.user, %repository, %operation, "authorized");
                true
            }
            Ok(false) => {
                info!(user = %subject.user, %repository, %operation, "not authorized");
                false
            }
            Err(e) => {
                warn!(
                    user = %subject.user,
                    %repository,
                    %operation,
                    error = %e,
                    "authorization check failed, denying"
                );
                false
            }
        }
    }

    pub async fn validate_public_key(&self, user: &str, key: &PublicKey) -> bool {
        match self.bounded(self.provider.validate_public_key(user, key)).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(
                    %user,
                    fingerprint = %keys::fingerprint(key),
                    error = %e,
                    "public key validation failed, rejecting"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use russh_keys::key::KeyPair;

    use super::*;
    use crate::auth::UserProfile;

    /// Provider whose answers are fixed at construction.
    struct Scripted {
        authorized: Result<bool, ()>,
        delay: Duration,
        keys: Vec<PublicKey>,
    }

    impl Scripted {
        fn answering(authorized: Result<bool, ()>) -> Self {
            Self {
                authorized,
                delay: Duration::ZERO,
                keys: Vec::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl Provider for Scripted {
        async fn login(&self, user: &str, password: &str) -> Result<String, AuthError> {
            if password == "right" {
                Ok(format!("token-{user}"))
            } else if password == "empty" {
                Ok(String::new())
            } else {
                Err(AuthError::InvalidCredentials)
            }
        }

        async fn is_authorized(
            &self,
            _subject: &Subject,
            _repository: &str,
            _operation: GitOperation,
        ) -> Result<bool, AuthError> {
            tokio::time::sleep(self.delay).await;
            self.authorized
                .map_err(|_| AuthError::Other("backend exploded".into()))
        }

        async fn fetch_user_profile(&self, token: &str) -> Result<UserProfile, AuthError> {
            Ok(UserProfile {
                id: token.trim_start_matches("token-").to_string(),
            })
        }

        async fn fetch_public_keys(&self, _user: &str) -> Result<Vec<PublicKey>, AuthError> {
            Ok(self.keys.clone())
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    fn gate(provider: Scripted) -> AuthorizationGate {
        AuthorizationGate::new(Arc::new(provider), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn allow_and_deny_pass_through() {
        let subject = Subject::user("alice");
        assert!(gate(Scripted::answering(Ok(true)))
            .is_authorized(&subject, "/org/repo", GitOperation::Read)
            .await);
        assert!(!gate(Scripted::answering(Ok(false)))
            .is_authorized(&subject, "/org/repo", GitOperation::Read)
            .await);
    }

    #[tokio::test]
    async fn provider_error_denies() {
        let g = gate(Scripted::answering(Err(())));
        assert!(!g
            .is_authorized(&Subject::user("alice"), "/org/repo", GitOperation::Write)
            .await);
    }

    #[tokio::test]
    async fn slow_provider_denies() {
        let mut provider = Scripted::answering(Ok(true));
        provider.delay = Duration::from_secs(5);
        let g = AuthorizationGate::new(Arc::new(provider), Duration::from_millis(50));
        assert!(!g
            .is_authorized(&Subject::user("alice"), "/org/repo", GitOperation::Read)
            .await);
    }

    #[tokio::test]
    async fn authenticate_and_identify() {
        let g = gate(Scripted::answering(Ok(true)));
        let token = g.authenticate("alice", "right").await.unwrap();
        assert_eq!(token, "token-alice");
        let subject = g.identify(&token).await.unwrap();
        assert_eq!(subject, Subject::with_token("alice", "token-alice"));

        assert!(matches!(
            g.authenticate("alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            g.authenticate("alice", "empty").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn empty_profile_is_rejected() {
        let g = gate(Scripted::answering(Ok(true)));
        assert!(matches!(g.identify("token-").await, Err(AuthError::Malformed(_))));
    }

    #[tokio::test]
    async fn public_key_must_match_exactly() {
        let known = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let stranger = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let mut provider = Scripted::answering(Ok(true));
        provider.keys = vec![known.clone()];
        let g = gate(provider);

        assert!(g.validate_public_key("alice", &known).await);
        assert!(!g.validate_public_key("alice", &stranger).await);
    }
}
