mod auth;
mod config;
mod credentials;
mod git;
mod health;
mod http;
mod metrics;
mod ssh;

use std::future::Future;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::AuthorizationGate;
use crate::config::{Config, LogFormat};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Authenticating Git gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "GITGATE_CONFIG",
        default_value = "/etc/gitgate/config.yaml"
    )]
    config: String,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

fn spawn_service<F>(name: &'static str, service: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = service.await {
            tracing::error!(error = %format!("{e:#}"), "{name} server failed");
        }
    })
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- TLS crypto provider ----
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    init_tracing(&config);
    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Authorization ----
    let provider = auth::build_provider(&config.auth_server, &config.timeouts)?;
    let gate = AuthorizationGate::new(provider, config.timeouts.provider());
    tracing::info!(provider = gate.provider_kind(), "authorization provider initialised");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Bind every listener before serving any ----
    let http = match config.http_enabled() {
        Some(http) => Some(
            http::bind_http_server(
                http,
                &config.timeouts,
                gate.clone(),
                metrics.metrics.clone(),
            )
            .await
            .context("failed to start HTTP transport")?,
        ),
        None => None,
    };
    let ssh = match config.ssh_enabled() {
        Some(ssh) => Some(
            ssh::bind_ssh_server(ssh, &config.timeouts, gate.clone(), metrics.metrics.clone())
                .await
                .context("failed to start SSH transport")?,
        ),
        None => None,
    };
    let admin = match &config.admin {
        Some(admin) => Some(health::bind_admin(&admin.listen).await?),
        None => None,
    };

    // ---- Spawn services ----
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    if let Some(server) = http {
        handles.push(spawn_service("HTTP", server.serve(shutdown.clone())));
    }
    if let Some(server) = ssh {
        handles.push(spawn_service("SSH", server.serve(shutdown.clone())));
    }
    if let Some(listener) = admin {
        let state = health::AdminState {
            metrics,
            provider: gate.provider_kind(),
            transports: health::Transports {
                http: config.http_enabled().is_some(),
                ssh: config.ssh_enabled().is_some(),
            },
        };
        handles.push(spawn_service(
            "admin",
            health::serve_admin(listener, state, shutdown.clone()),
        ));
    }

    // ---- Await shutdown ----
    shutdown_signal().await;
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
