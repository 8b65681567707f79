//! Client for the external authorization service.
//!
//! | Call | Endpoint |
//! |------|----------|
//! | login | `POST /login` |
//! | authorize | `POST /api/authorize` (Bearer) |
//! | profile | `POST /api/access_token/me` (Bearer) |
//! | public keys | `GET /api/users/{user}/public_keys` (Bearer service token) |

use std::path::PathBuf;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use russh_keys::key::PublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{keys, AuthError, Provider, Subject, UserProfile};
use crate::config::{AuthServerConfig, TimeoutConfig};
use crate::git::GitOperation;

/// Authorization namespace all repository permissions live in.
const NAMESPACE: &str = "vcs";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "AccessToken", alias = "accessToken")]
    access_token: String,
}

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    namespace: &'static str,
    action: &'static str,
    resources: [&'a str; 1],
    subject: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    #[serde(default, alias = "Resources")]
    resources: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(alias = "UserId", alias = "userId")]
    user_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PublicKeysResponse {
    #[serde(default)]
    keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct AuthServerProvider {
    client: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
    public_keys_dir: Option<PathBuf>,
}

impl AuthServerProvider {
    pub fn new(config: &AuthServerConfig, timeouts: &TimeoutConfig) -> Result<Self> {
        let service_token = std::env::var(&config.service_token_env)
            .ok()
            .filter(|t| !t.is_empty());
        if service_token.is_none() {
            warn!(
                env = %config.service_token_env,
                "no service token set; requests on behalf of SSH users will be denied"
            );
        }
        Self::with_service_token(config, timeouts, service_token)
    }

    pub fn with_service_token(
        config: &AuthServerConfig,
        timeouts: &TimeoutConfig,
        service_token: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gitgate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeouts.provider())
            .connect_timeout(timeouts.connect())
            .build()
            .context("failed to build authorization service client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_token,
            public_keys_dir: config.public_keys_dir.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `/api/users/<user>/public_keys` with `user` encoded as a single path
    /// segment.
    fn public_keys_url(&self, user: &str) -> Result<reqwest::Url, AuthError> {
        if matches!(user, "" | "." | "..") {
            return Err(AuthError::Other(format!("refusing key lookup for user {user:?}")));
        }
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| AuthError::Other(format!("invalid authorization service URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| AuthError::Other("authorization service URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["api", "users", user, "public_keys"]);
        Ok(url)
    }

    fn service_token(&self) -> Result<&str, AuthError> {
        self.service_token
            .as_deref()
            .ok_or_else(|| AuthError::Other("no service token configured".into()))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, AuthError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::Status(status));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }

    async fn read_key_file(
        &self,
        dir: &std::path::Path,
        user: &str,
    ) -> Result<Vec<PublicKey>, AuthError> {
        if !is_safe_user_name(user) {
            return Err(AuthError::Other(format!("refusing key lookup for user {user:?}")));
        }
        let path = dir.join(format!("{user}.pub"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(keys::parse_authorized_keys(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AuthError::Other(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}

/// User names become file names; reject anything that could escape the
/// key directory.
fn is_safe_user_name(user: &str) -> bool {
    !user.is_empty()
        && !user.starts_with('.')
        && !user.contains(['/', '\\', '\0'])
        && !user.contains("..")
}

#[async_trait::async_trait]
impl Provider for AuthServerProvider {
    #[instrument(skip(self, password))]
    async fn login(&self, user: &str, password: &str) -> Result<String, AuthError> {
        let resp = self
            .client
            .post(self.url("/login"))
            .json(&LoginRequest {
                username: user,
                password,
            })
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::InvalidCredentials),
            _ => Ok(Self::decode::<LoginResponse>(resp).await?.access_token),
        }
    }

    #[instrument(skip(self, subject), fields(user = %subject.user))]
    async fn is_authorized(
        &self,
        subject: &Subject,
        repository: &str,
        operation: GitOperation,
    ) -> Result<bool, AuthError> {
        let bearer = match &subject.token {
            Some(token) => token.as_str(),
            None => self.service_token()?,
        };
        let resp = self
            .client
            .post(self.url("/api/authorize"))
            .bearer_auth(bearer)
            .json(&AuthorizeRequest {
                namespace: NAMESPACE,
                action: operation.action(),
                resources: [repository],
                subject: &subject.user,
            })
            .send()
            .await?;

        let body: AuthorizeResponse = Self::decode(resp).await?;
        let allowed = body.resources.is_some_and(|r| !r.is_empty());
        debug!(allowed, "authorize response");
        Ok(allowed)
    }

    async fn fetch_user_profile(&self, token: &str) -> Result<UserProfile, AuthError> {
        let resp = self
            .client
            .post(self.url("/api/access_token/me"))
            .bearer_auth(token)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidCredentials);
        }
        let body: ProfileResponse = Self::decode(resp).await?;
        let id = match body.user_id {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(AuthError::Malformed(format!("unexpected user_id: {other}"))),
        };
        Ok(UserProfile { id })
    }

    async fn fetch_public_keys(&self, user: &str) -> Result<Vec<PublicKey>, AuthError> {
        if let Some(dir) = &self.public_keys_dir {
            return self.read_key_file(dir, user).await;
        }

        let resp = self
            .client
            .get(self.public_keys_url(user)?)
            .bearer_auth(self.service_token()?)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: PublicKeysResponse = Self::decode(resp).await?;
        Ok(body
            .keys
            .iter()
            .filter_map(|line| keys::parse_authorized_key(line).ok())
            .collect())
    }

    fn kind(&self) -> &'static str {
        "authserver"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;
    use serde_json::{json, Value};

    use super::*;

    #[derive(Clone, Default)]
    struct Seen {
        authorize: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    fn bearer(headers: &HeaderMap) -> Option<String> {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    async fn spawn_fake(key_line: String) -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/login",
                post(|Json(body): Json<Value>| async move {
                    if body["password"] == "right" {
                        (axum::http::StatusCode::OK, Json(json!({"access_token": "tok-alice"})))
                    } else {
                        (axum::http::StatusCode::UNAUTHORIZED, Json(json!({})))
                    }
                }),
            )
            .route(
                "/api/authorize",
                post(
                    |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                        seen.authorize
                            .lock()
                            .unwrap()
                            .push((bearer(&headers), body.clone()));
                        if body["resources"][0] == "/org/allowed.git" {
                            Json(json!({"resources": ["/org/allowed.git"]}))
                        } else {
                            Json(json!({"resources": []}))
                        }
                    },
                ),
            )
            .route(
                "/api/access_token/me",
                post(|headers: HeaderMap| async move {
                    match bearer(&headers).as_deref() {
                        Some("tok-alice") => (axum::http::StatusCode::OK, Json(json!({"user_id": 42}))),
                        _ => (axum::http::StatusCode::UNAUTHORIZED, Json(json!({}))),
                    }
                }),
            )
            .route(
                "/api/users/{user}/public_keys",
                get(move |Path(user): Path<String>| {
                    let key_line = key_line.clone();
                    async move {
                        if user == "alice" {
                            Json(json!({"keys": [key_line, "garbage"]}))
                        } else {
                            Json(json!({"keys": []}))
                        }
                    }
                }),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}"), seen)
    }

    fn provider(base_url: &str, service_token: Option<&str>) -> AuthServerProvider {
        let config = AuthServerConfig {
            base_url: base_url.to_string(),
            mock: false,
            service_token_env: "UNUSED".into(),
            public_keys_dir: None,
        };
        AuthServerProvider::with_service_token(
            &config,
            &TimeoutConfig::default(),
            service_token.map(str::to_string),
        )
        .unwrap()
    }

    fn key_line(key: &PublicKey) -> String {
        format!("{} {} alice@laptop", key.name(), key.public_key_base64())
    }

    #[tokio::test]
    async fn login_and_profile() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (base, _) = spawn_fake(key_line(&key)).await;
        let p = provider(&base, None);

        assert_eq!(p.login("alice", "right").await.unwrap(), "tok-alice");
        assert!(matches!(
            p.login("alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));

        assert_eq!(p.fetch_user_profile("tok-alice").await.unwrap().id, "42");
        assert!(p.fetch_user_profile("bogus").await.is_err());
    }

    #[tokio::test]
    async fn authorize_uses_subject_token_and_schema() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (base, seen) = spawn_fake(key_line(&key)).await;
        let p = provider(&base, Some("svc-token"));

        let subject = Subject::with_token("42", "tok-alice");
        assert!(p
            .is_authorized(&subject, "/org/allowed.git", GitOperation::Read)
            .await
            .unwrap());
        assert!(!p
            .is_authorized(&subject, "/org/denied.git", GitOperation::Write)
            .await
            .unwrap());

        let calls = seen.authorize.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0.as_deref(), Some("tok-alice"));
        assert_eq!(
            calls[0].1,
            json!({
                "namespace": "vcs",
                "action": "GET",
                "resources": ["/org/allowed.git"],
                "subject": "42"
            })
        );
        assert_eq!(calls[1].1["action"], "POST");
    }

    #[tokio::test]
    async fn authorize_without_token_uses_service_token() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (base, seen) = spawn_fake(key_line(&key)).await;

        let p = provider(&base, Some("svc-token"));
        assert!(p
            .is_authorized(&Subject::user("alice"), "/org/allowed.git", GitOperation::Read)
            .await
            .unwrap());
        assert_eq!(
            seen.authorize.lock().unwrap()[0].0.as_deref(),
            Some("svc-token")
        );
    }

    #[tokio::test]
    async fn authorize_without_any_token_errors() {
        let (base, seen) = spawn_fake(String::new()).await;
        let p = provider(&base, None);
        assert!(p
            .is_authorized(&Subject::user("alice"), "/org/allowed.git", GitOperation::Read)
            .await
            .is_err());
        assert!(seen.authorize.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn public_keys_from_api() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (base, _) = spawn_fake(key_line(&key)).await;
        let p = provider(&base, Some("svc-token"));

        let fetched = p.fetch_public_keys("alice").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert!(p.validate_public_key("alice", &key).await.unwrap());
        assert!(!p.validate_public_key("bob", &key).await.unwrap());
    }

    #[tokio::test]
    async fn crafted_user_names_cannot_borrow_keys() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let (base, _) = spawn_fake(key_line(&key)).await;
        let p = provider(&base, Some("svc-token"));

        for user in [
            "bob/../alice",
            "alice/public_keys?x=",
            "alice/public_keys#",
            "alice/",
            "../alice",
        ] {
            assert!(
                !p.validate_public_key(user, &key).await.unwrap_or(false),
                "{user:?} was given alice's key"
            );
        }
        for user in ["", ".", ".."] {
            assert!(p.fetch_public_keys(user).await.is_err());
        }
    }

    #[tokio::test]
    async fn public_keys_url_encodes_the_user() {
        let p = provider("http://auth.example.com/base/", None);
        assert_eq!(
            p.public_keys_url("bob/../alice").unwrap().as_str(),
            "http://auth.example.com/base/api/users/bob%2F..%2Falice/public_keys"
        );
        assert_eq!(
            p.public_keys_url("a?b#c").unwrap().as_str(),
            "http://auth.example.com/base/api/users/a%3Fb%23c/public_keys"
        );
        let p = provider("http://auth.example.com", None);
        assert_eq!(
            p.public_keys_url("alice").unwrap().as_str(),
            "http://auth.example.com/api/users/alice/public_keys"
        );
    }

    #[tokio::test]
    async fn public_keys_from_directory() {
        let key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alice.pub"), key_line(&key)).unwrap();

        let config = AuthServerConfig {
            base_url: "http://127.0.0.1:9".into(),
            mock: false,
            service_token_env: "GITGATE_TEST_UNSET_SERVICE_TOKEN".into(),
            public_keys_dir: Some(dir.path().to_path_buf()),
        };
        let p = AuthServerProvider::new(&config, &TimeoutConfig::default()).unwrap();

        assert!(p.validate_public_key("alice", &key).await.unwrap());
        assert!(p.fetch_public_keys("nobody").await.unwrap().is_empty());
        assert!(p.fetch_public_keys("../alice").await.is_err());
        assert!(p.fetch_public_keys(".hidden").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let p = provider("http://127.0.0.1:9", None);
        assert!(p.login("alice", "right").await.is_err());
    }

    #[test]
    fn safe_user_names() {
        assert!(is_safe_user_name("alice"));
        assert!(is_safe_user_name("alice.smith"));
        assert!(!is_safe_user_name(""));
        assert!(!is_safe_user_name("a/b"));
        assert!(!is_safe_user_name(".."));
        assert!(!is_safe_user_name("a..b"));
    }
}
