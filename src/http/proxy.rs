//! Authenticating reverse proxy for Git smart HTTP.
//!
//! Every request, whatever its path, goes through the same steps:
//!
//! 1. identify the caller from `Authorization` (Basic is exchanged for a token
//!    at the authorization service, Bearer is used as is),
//! 2. classify it from the `service` query parameter and take the path as the
//!    repository,
//! 3. ask the [`AuthorizationGate`],
//! 4. forward it upstream over HTTPS with the next pooled service account.
//!
//! Denied requests get `401` with both `Bearer` and `Basic` challenges and
//! never touch the upstream or the account pool.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use crate::auth::{AuthorizationGate, Subject};
use crate::config::TimeoutConfig;
use crate::credentials::{AccountPool, HttpAccount};
use crate::git::GitOperation;
use crate::metrics::{Metrics, SessionGuard, Transport};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub struct HttpProxy {
    gate: AuthorizationGate,
    pool: AccountPool<HttpAccount>,
    client: reqwest::Client,
    upstream: String,
    scheme: &'static str,
    metrics: Arc<Metrics>,
}

impl HttpProxy {
    pub fn new(
        gate: AuthorizationGate,
        pool: AccountPool<HttpAccount>,
        upstream: String,
        timeouts: &TimeoutConfig,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .pool_idle_timeout(timeouts.idle())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            gate,
            pool,
            client,
            upstream,
            scheme: "https",
            metrics,
        })
    }

    /// Forward over plain HTTP.  Only for tests against an in-process upstream.
    #[cfg(test)]
    pub(crate) fn insecure_upstream(mut self) -> Self {
        self.scheme = "http";
        self
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &AccountPool<HttpAccount> {
        &self.pool
    }

    /// Resolve the caller to a [`Subject`], or `None` if the credentials are
    /// missing or rejected.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Subject> {
        let token = match Credentials::from_headers(headers)? {
            Credentials::Basic { user, password } => {
                match self.gate.authenticate(&user, &password).await {
                    Ok(token) => token,
                    Err(e) => {
                        info!(%user, error = %e, "basic authentication failed");
                        return None;
                    }
                }
            }
            Credentials::Bearer(token) => token,
        };

        match self.gate.identify(&token).await {
            Ok(subject) => Some(subject),
            Err(e) => {
                info!(error = %e, "token could not be resolved to a user");
                None
            }
        }
    }

    /// Re-issue `req` upstream as `account` and stream the response back.
    async fn forward(&self, req: Request, account: &HttpAccount) -> anyhow::Result<Response> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}://{}{}", self.scheme, self.upstream, path_and_query);

        let original_host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        let upstream_host =
            HeaderValue::from_str(&self.upstream).context("upstream host is not a valid header")?;
        let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::HOST);
        if let Some(host) = original_host {
            headers.append(X_FORWARDED_HOST, host);
        }
        headers.append(X_ORIGIN_HOST, upstream_host.clone());
        headers.insert(header::HOST, upstream_host);
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, peer);
        }

        let mut upstream_req = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .basic_auth(&account.user, Some(&account.password));
        if has_body {
            upstream_req = upstream_req.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        debug!(%url, account = %account.user, "forwarding request upstream");
        let upstream_resp = upstream_req
            .send()
            .await
            .with_context(|| format!("upstream request to {url} failed"))?;

        let mut response = Response::builder().status(upstream_resp.status());
        if let Some(h) = response.headers_mut() {
            *h = strip_hop_by_hop(upstream_resp.headers());
        }
        response
            .body(Body::from_stream(upstream_resp.bytes_stream()))
            .context("failed to build proxied response")
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP.iter().chain(named.iter()) {
        out.remove(name);
    }
    out
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: &SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Credentials {
    Basic { user: String, password: String },
    Bearer(String),
}

impl Credentials {
    /// Basic takes precedence; a malformed or empty header yields `None`.
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
        let (scheme, rest) = value.split_once(' ')?;
        let rest = rest.trim();

        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = base64::engine::general_purpose::STANDARD.decode(rest).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, password) = decoded.split_once(':')?;
            return Some(Credentials::Basic {
                user: user.to_string(),
                password: password.to_string(),
            });
        }
        if scheme.eq_ignore_ascii_case("bearer") && !rest.is_empty() {
            return Some(Credentials::Bearer(rest.to_string()));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

/// Build the axum [`Router`]: a single fallback handler covering every path.
pub fn create_router(proxy: Arc<HttpProxy>) -> Router {
    Router::new().fallback(handle_proxy).with_state(proxy)
}

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
async fn handle_proxy(State(proxy): State<Arc<HttpProxy>>, req: Request) -> Response {
    let repository = req.uri().path().to_string();
    let service = Query::<ServiceQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.service)
        .unwrap_or_default();
    let operation = GitOperation::from_service(&service);

    let Some(subject) = proxy.authenticate(req.headers()).await else {
        proxy
            .metrics
            .record_decision(Transport::Http, operation, false);
        return AppError::Unauthorized.into_response();
    };

    let allowed = proxy
        .gate
        .is_authorized(&subject, &repository, operation)
        .await;
    proxy
        .metrics
        .record_decision(Transport::Http, operation, allowed);
    if !allowed {
        return AppError::Unauthorized.into_response();
    }

    let _session = SessionGuard::start(&proxy.metrics, Transport::Http);
    let account = proxy.pool.next();
    proxy.metrics.record_draw(Transport::Http);
    debug!(user = %subject.user, account = %account.user, %repository, "request authorized");

    match proxy.forward(req, account).await {
        Ok(response) => response,
        Err(e) => {
            proxy.metrics.record_upstream_failure(Transport::Http);
            AppError::BadGateway(e).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures that end a request before an upstream response is available.
#[derive(Debug)]
pub enum AppError {
    /// Missing or rejected credentials, or authorization denied.
    Unauthorized,
    /// The upstream could not be reached.
    BadGateway(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => {
                let mut response = StatusCode::UNAUTHORIZED.into_response();
                let headers = response.headers_mut();
                headers.append(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                headers.append(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
                response
            }
            AppError::BadGateway(err) => {
                error!(error = %format!("{err:#}"), "upstream request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}
