//! Upstream service-account credentials.
//!
//! Accounts are resolved once at startup from their configured source (inline
//! value, environment variable, file, or the kernel keyring) and are immutable
//! afterwards.  Each transport owns one [`AccountPool`] of them.

pub mod keyring;
pub mod pool;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;

use crate::config::{HttpAccountConfig, SshAccountConfig};

pub use pool::AccountPool;

// ---------------------------------------------------------------------------
// Account types
// ---------------------------------------------------------------------------

/// Username and password used as HTTP Basic credentials upstream.
#[derive(Clone)]
pub struct HttpAccount {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for HttpAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAccount")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Username and private key used for public-key authentication upstream.
#[derive(Clone)]
pub struct SshAccount {
    pub user: String,
    pub key: Arc<KeyPair>,
}

impl fmt::Debug for SshAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshAccount")
            .field("user", &self.user)
            .field("key", &self.key.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub async fn load_http_accounts(configs: &[HttpAccountConfig]) -> Result<Vec<HttpAccount>> {
    let mut accounts = Vec::with_capacity(configs.len());
    for cfg in configs {
        let password = resolve_password(cfg)
            .await
            .with_context(|| format!("failed to load password for http account {:?}", cfg.user))?;
        accounts.push(HttpAccount {
            user: cfg.user.clone(),
            password,
        });
    }
    Ok(accounts)
}

pub async fn load_ssh_accounts(configs: &[SshAccountConfig]) -> Result<Vec<SshAccount>> {
    let mut accounts = Vec::with_capacity(configs.len());
    for cfg in configs {
        let key = load_private_key(
            cfg.private_key_file.as_deref(),
            cfg.private_key_keyring.as_deref(),
        )
        .await
        .with_context(|| format!("failed to load private key for ssh account {:?}", cfg.user))?;
        accounts.push(SshAccount {
            user: cfg.user.clone(),
            key: Arc::new(key),
        });
    }
    Ok(accounts)
}

async fn resolve_password(cfg: &HttpAccountConfig) -> Result<String> {
    if let Some(password) = &cfg.password {
        return Ok(password.clone());
    }
    if let Some(var) = &cfg.password_env {
        return std::env::var(var).with_context(|| format!("environment variable {var} is not set"));
    }
    if let Some(path) = &cfg.password_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(contents.trim_end_matches(['\r', '\n']).to_string());
    }
    if let Some(name) = &cfg.password_keyring {
        return keyring::read_secret(name).await;
    }
    anyhow::bail!("no password source configured")
}

/// Decode an unencrypted private key (OpenSSH or PKCS#8 PEM) from a file or
/// from the kernel keyring.
pub async fn load_private_key(file: Option<&Path>, keyring_name: Option<&str>) -> Result<KeyPair> {
    let pem = match (file, keyring_name) {
        (Some(path), _) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read key file: {}", path.display()))?,
        (None, Some(name)) => keyring::read_secret(name).await?,
        (None, None) => anyhow::bail!("no private key source configured"),
    };
    russh_keys::decode_secret_key(&pem, None).context("failed to decode private key")
}
