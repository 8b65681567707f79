use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    pub auth_server: AuthServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// The HTTP section, if present and enabled.
    pub fn http_enabled(&self) -> Option<&HttpConfig> {
        self.http.as_ref().filter(|h| h.enabled)
    }

    /// The SSH section, if present and enabled.
    pub fn ssh_enabled(&self) -> Option<&SshConfig> {
        self.ssh.as_ref().filter(|s| s.enabled)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Authorization service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerConfig {
    /// Base URL of the authorization service (e.g. `https://accounts.example.com`).
    #[serde(default)]
    pub base_url: String,
    /// Replace the authorization service with an allow-everything provider.
    /// Only for local testing.
    #[serde(default)]
    pub mock: bool,
    /// Name of the environment variable holding the gateway's own token, used
    /// for requests made on behalf of SSH users.
    #[serde(default = "default_service_token_env")]
    pub service_token_env: String,
    /// Read user public keys from `<dir>/<user>.pub` instead of the API.
    #[serde(default)]
    pub public_keys_dir: Option<PathBuf>,
}

fn default_service_token_env() -> String {
    "GITGATE_SERVICE_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Outbound connect + handshake, and inbound TLS handshake (seconds).
    #[serde(default = "default_two_secs")]
    pub connect_secs: u64,
    /// Idle pooled upstream HTTP connections are closed after this (seconds).
    #[serde(default = "default_two_secs")]
    pub idle_secs: u64,
    /// Upper bound for every authorization service call (seconds).
    #[serde(default = "default_two_secs")]
    pub provider_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_two_secs(),
            idle_secs: default_two_secs(),
            provider_secs: default_two_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn provider(&self) -> Duration {
        Duration::from_secs(self.provider_secs)
    }
}

fn default_two_secs() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// HTTP listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Socket address for the HTTPS listener (e.g. `0.0.0.0:443`).
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// PEM certificate chain presented to clients.
    pub cert_file: PathBuf,
    /// PEM private key matching `cert_file`.
    pub key_file: PathBuf,
    /// Upstream requests are forwarded to over HTTPS, either as a URL
    /// (`https://git.example.com`) or a bare `host[:port]`.
    pub upstream: String,
    pub accounts: Vec<HttpAccountConfig>,
}

impl HttpConfig {
    /// The `host[:port]` part of [`HttpConfig::upstream`].
    pub fn upstream_authority(&self) -> Result<String> {
        if !self.upstream.contains("://") {
            anyhow::ensure!(
                !self.upstream.is_empty() && !self.upstream.contains('/'),
                "http.upstream must be a URL or host[:port], got {:?}",
                self.upstream
            );
            return Ok(self.upstream.clone());
        }
        let url = reqwest::Url::parse(&self.upstream)
            .with_context(|| format!("invalid http.upstream URL: {:?}", self.upstream))?;
        let host = url
            .host_str()
            .with_context(|| format!("http.upstream has no host: {:?}", self.upstream))?;
        Ok(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:443".to_string()
}

/// An upstream HTTP service account.  Exactly one password source must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpAccountConfig {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Name of an environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    /// Key name in the Linux session keyring.
    #[serde(default)]
    pub password_keyring: Option<String>,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Socket address for the SSH listener (e.g. `0.0.0.0:22`).
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Private host key presented to clients.
    #[serde(default)]
    pub host_key_file: Option<PathBuf>,
    /// Alternatively, key name of the host key in the Linux session keyring.
    #[serde(default)]
    pub host_key_keyring: Option<String>,
    /// Upstream SSH endpoint as `host:port`.
    pub upstream: String,
    /// OpenSSH public key file holding the upstream's host key.
    pub upstream_host_key_file: PathBuf,
    /// Idle inbound connections are closed after this many seconds.
    #[serde(default = "default_ssh_inactivity")]
    pub inactivity_timeout_secs: u64,
    pub accounts: Vec<SshAccountConfig>,
}

fn default_ssh_listen() -> String {
    "0.0.0.0:22".to_string()
}

fn default_ssh_inactivity() -> u64 {
    3600
}

/// An upstream SSH service account.  Exactly one key source must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct SshAccountConfig {
    pub user: String,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    #[serde(default)]
    pub private_key_keyring: Option<String>,
}

// ---------------------------------------------------------------------------
// Admin listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Plain-HTTP socket address serving `/healthz` and `/metrics`.
    pub listen: String,
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.http_enabled().is_some() || config.ssh_enabled().is_some(),
        "at least one of http or ssh must be enabled"
    );
    anyhow::ensure!(
        config.auth_server.mock || !config.auth_server.base_url.is_empty(),
        "auth_server.base_url is required unless auth_server.mock is set"
    );
    anyhow::ensure!(
        config.timeouts.connect_secs > 0
            && config.timeouts.idle_secs > 0
            && config.timeouts.provider_secs > 0,
        "timeouts must be greater than zero"
    );

    if let Some(http) = config.http_enabled() {
        anyhow::ensure!(!http.accounts.is_empty(), "http.accounts must not be empty");
        http.upstream_authority()?;
        for account in &http.accounts {
            let sources = [
                account.password.is_some(),
                account.password_env.is_some(),
                account.password_file.is_some(),
                account.password_keyring.is_some(),
            ];
            anyhow::ensure!(
                sources.iter().filter(|s| **s).count() == 1,
                "http account {:?} needs exactly one password source",
                account.user
            );
        }
    }

    if let Some(ssh) = config.ssh_enabled() {
        anyhow::ensure!(!ssh.accounts.is_empty(), "ssh.accounts must not be empty");
        anyhow::ensure!(
            ssh.host_key_file.is_some() != ssh.host_key_keyring.is_some(),
            "ssh needs exactly one of host_key_file or host_key_keyring"
        );
        anyhow::ensure!(!ssh.upstream.is_empty(), "ssh.upstream must not be empty");
        for account in &ssh.accounts {
            anyhow::ensure!(
                account.private_key_file.is_some() != account.private_key_keyring.is_some(),
                "ssh account {:?} needs exactly one of private_key_file or private_key_keyring",
                account.user
            );
        }
    }

    Ok(())
}
