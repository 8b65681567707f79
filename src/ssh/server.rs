//! SSH listener bootstrap and the [`russh::server::Server`] implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server as _};
use russh::MethodSet;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::session::{SshContext, SshSession};
use super::upstream::UpstreamTarget;
use crate::auth::keys::{fingerprint, load_public_key};
use crate::auth::AuthorizationGate;
use crate::config::{SshConfig, TimeoutConfig};
use crate::credentials::{self, AccountPool};
use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// A bound SSH listener.  Each accepted connection is handed to an
/// [`SshSession`] handler.
pub struct SshServer {
    listener: TcpListener,
    config: Arc<server::Config>,
    ctx: Arc<SshContext>,
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.ctx), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Load key material and accounts and bind the listen socket.  Nothing is
/// served until [`SshServer::serve`] is called.
pub async fn bind_ssh_server(
    config: &SshConfig,
    timeouts: &TimeoutConfig,
    gate: AuthorizationGate,
    metrics: Arc<Metrics>,
) -> Result<SshServer> {
    let host_key = credentials::load_private_key(
        config.host_key_file.as_deref(),
        config.host_key_keyring.as_deref(),
    )
    .await
    .context("failed to load SSH host key")?;

    let upstream_key = load_public_key(&config.upstream_host_key_file)
        .context("failed to load upstream SSH host key")?;
    info!(
        upstream = %config.upstream,
        host_key = %fingerprint(&upstream_key),
        "pinned upstream SSH host key"
    );

    let accounts = credentials::load_ssh_accounts(&config.accounts).await?;
    let pool = AccountPool::new(accounts).context("ssh account pool")?;
    info!(accounts = pool.len(), "loaded SSH service accounts");

    let server_config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(config.inactivity_timeout_secs)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind SSH listener on {}", config.listen))?;

    let ctx = Arc::new(SshContext {
        gate,
        pool,
        upstream: UpstreamTarget::new(config.upstream.clone(), upstream_key, timeouts.connect()),
        metrics,
    });

    Ok(SshServer {
        listener,
        config: server_config,
        ctx,
    })
}

impl SshServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("SSH listener has no local address")
    }

    /// Accept connections until `shutdown` fires.  A failing connection never
    /// affects the listener.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "SSH server listening");

        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "failed to accept SSH connection");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "failed to set TCP_NODELAY");
                    }

                    let handler = self.new_client(Some(peer));
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        let session = match server::run_stream(config, stream, handler).await {
                            Ok(session) => session,
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "SSH handshake failed");
                                return;
                            }
                        };
                        if let Err(e) = session.await {
                            debug!(peer = %peer, error = %e, "SSH connection ended with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("SSH server stopped listening");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use russh_keys::key::KeyPair;
    use russh_keys::PublicKeyBase64;

    use super::*;
    use crate::auth::mock::MockProvider;
    use crate::config::SshAccountConfig;
    use crate::metrics::MetricsRegistry;

    fn write_private_key(dir: &Path, name: &str) -> PathBuf {
        let key = KeyPair::generate_ed25519();
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&key, &mut pem).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, pem).unwrap();
        path
    }

    fn ssh_config(dir: &Path) -> SshConfig {
        let upstream = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let pub_path = dir.join("upstream.pub");
        std::fs::write(
            &pub_path,
            format!("{} {} git.example.com\n", upstream.name(), upstream.public_key_base64()),
        )
        .unwrap();

        SshConfig {
            enabled: true,
            listen: "127.0.0.1:0".into(),
            host_key_file: Some(write_private_key(dir, "host_key")),
            host_key_keyring: None,
            upstream: "git.example.com:22".into(),
            upstream_host_key_file: pub_path,
            inactivity_timeout_secs: 60,
            accounts: vec![SshAccountConfig {
                user: "git".into(),
                private_key_file: Some(write_private_key(dir, "svc_key")),
                private_key_keyring: None,
            }],
        }
    }

    fn gate() -> AuthorizationGate {
        AuthorizationGate::new(Arc::new(MockProvider), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn binds_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = ssh_config(dir.path());
        let server = bind_ssh_server(
            &config,
            &TimeoutConfig::default(),
            gate(),
            MetricsRegistry::new().metrics,
        )
        .await
        .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(shutdown.clone()));
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_upstream_key_fails_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ssh_config(dir.path());
        config.upstream_host_key_file = dir.path().join("absent.pub");
        let err = bind_ssh_server(
            &config,
            &TimeoutConfig::default(),
            gate(),
            MetricsRegistry::new().metrics,
        )
        .await
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("upstream SSH host key"));
    }
}
