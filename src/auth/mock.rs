//! Allow-everything provider for local development.

use russh_keys::key::PublicKey;

use super::{AuthError, Provider, Subject, UserProfile};
use crate::git::GitOperation;

/// Accepts any login (the token is the user name), any public key and any
/// repository operation.
pub struct MockProvider;

#[async_trait::async_trait]
impl Provider for MockProvider {
    async fn login(&self, user: &str, _password: &str) -> Result<String, AuthError> {
        Ok(user.to_string())
    }

    async fn is_authorized(
        &self,
        _subject: &Subject,
        _repository: &str,
        _operation: GitOperation,
    ) -> Result<bool, AuthError> {
        Ok(true)
    }

    async fn fetch_user_profile(&self, token: &str) -> Result<UserProfile, AuthError> {
        Ok(UserProfile {
            id: token.to_string(),
        })
    }

    async fn fetch_public_keys(&self, _user: &str) -> Result<Vec<PublicKey>, AuthError> {
        Ok(Vec::new())
    }

    async fn validate_public_key(&self, _user: &str, _key: &PublicKey) -> Result<bool, AuthError> {
        Ok(true)
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}
