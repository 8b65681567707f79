//! HTTPS listener: TLS termination in front of the proxy router.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ConnectInfo;
use axum::{Extension, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::proxy::{create_router, HttpProxy};
use crate::auth::AuthorizationGate;
use crate::config::{HttpConfig, TimeoutConfig};
use crate::credentials::{self, AccountPool};
use crate::metrics::Metrics;

// ---------------------------------------------------------------------------
// TLS material
// ---------------------------------------------------------------------------

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open certificate file: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open private key file: {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
pub fn tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and private key do not form a valid TLS identity")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound HTTPS listener with its router.
pub struct HttpServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    handshake_timeout: Duration,
}

/// Load TLS material and accounts and bind the listen socket.  Nothing is
/// served until [`HttpServer::serve`] is called.
pub async fn bind_http_server(
    config: &HttpConfig,
    timeouts: &TimeoutConfig,
    gate: AuthorizationGate,
    metrics: Arc<Metrics>,
) -> Result<HttpServer> {
    let acceptor = tls_acceptor(&config.cert_file, &config.key_file)?;
    let accounts = credentials::load_http_accounts(&config.accounts).await?;
    let pool = AccountPool::new(accounts).context("http account pool")?;
    info!(accounts = pool.len(), "loaded HTTP service accounts");
    let upstream = config.upstream_authority()?;

    let proxy = HttpProxy::new(gate, pool, upstream, timeouts, metrics)?;
    let router = create_router(Arc::new(proxy));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.listen))?;

    Ok(HttpServer {
        listener,
        acceptor,
        router,
        handshake_timeout: timeouts.connect(),
    })
}

impl HttpServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("HTTP listener has no local address")
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "HTTPS server listening");

        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "failed to accept HTTP connection");
                            continue;
                        }
                    };

                    let acceptor = self.acceptor.clone();
                    let app = self.router.clone().layer(Extension(ConnectInfo(peer)));
                    let handshake_timeout = self.handshake_timeout;
                    tokio::spawn(async move {
                        let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                            Ok(Ok(tls)) => tls,
                            Ok(Err(e)) => {
                                debug!(peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                debug!(peer = %peer, "TLS handshake timed out");
                                return;
                            }
                        };

                        let io = TokioIo::new(tls);
                        let service = TowerToHyperService::new(app);
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(peer = %peer, error = ?err, "connection ended with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("HTTPS server stopped listening");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = tls_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("cert.pem"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();
        assert!(tls_acceptor(&cert, &key).is_err());
    }
}
