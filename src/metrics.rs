use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::git::GitOperation;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transport {
    Http,
    Ssh,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Allowed,
    Denied,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub transport: Transport,
    pub operation: GitOperation,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransportLabels {
    pub transport: Transport,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DirectionLabels {
    pub direction: Direction,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub account_draws_total: Family<TransportLabels, Counter>,
    pub upstream_failures_total: Family<TransportLabels, Counter>,
    pub active_sessions: Family<TransportLabels, Gauge>,
    pub exchange_bytes_total: Family<DirectionLabels, Counter>,
    pub session_duration_seconds: Family<TransportLabels, Histogram>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gitgate_requests",
            "Authorization decisions by transport, operation and outcome",
            requests_total.clone(),
        );

        let account_draws_total = Family::<TransportLabels, Counter>::default();
        registry.register(
            "gitgate_account_draws",
            "Service accounts drawn from the rotation pool",
            account_draws_total.clone(),
        );

        let upstream_failures_total = Family::<TransportLabels, Counter>::default();
        registry.register(
            "gitgate_upstream_failures",
            "Failed attempts to reach the upstream host",
            upstream_failures_total.clone(),
        );

        let active_sessions = Family::<TransportLabels, Gauge>::default();
        registry.register(
            "gitgate_active_sessions",
            "Requests or SSH exchanges currently being proxied",
            active_sessions.clone(),
        );

        let exchange_bytes_total = Family::<DirectionLabels, Counter>::default();
        registry.register(
            "gitgate_exchange_bytes",
            "Bytes bridged between SSH clients and the upstream",
            exchange_bytes_total.clone(),
        );

        let session_duration_seconds =
            Family::<TransportLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 16))
            });
        registry.register(
            "gitgate_session_duration_seconds",
            "Time from authorization to completion of a proxied request",
            session_duration_seconds.clone(),
        );

        Self {
            requests_total,
            account_draws_total,
            upstream_failures_total,
            active_sessions,
            exchange_bytes_total,
            session_duration_seconds,
        }
    }

    pub fn record_decision(&self, transport: Transport, operation: GitOperation, allowed: bool) {
        let outcome = if allowed {
            Outcome::Allowed
        } else {
            Outcome::Denied
        };
        self.requests_total
            .get_or_create(&RequestLabels {
                transport,
                operation,
                outcome,
            })
            .inc();
    }

    pub fn record_draw(&self, transport: Transport) {
        self.account_draws_total
            .get_or_create(&TransportLabels { transport })
            .inc();
    }

    pub fn record_upstream_failure(&self, transport: Transport) {
        self.upstream_failures_total
            .get_or_create(&TransportLabels { transport })
            .inc();
    }

    pub fn record_bytes(&self, direction: Direction, bytes: u64) {
        self.exchange_bytes_total
            .get_or_create(&DirectionLabels { direction })
            .inc_by(bytes);
    }
}

// ---------------------------------------------------------------------------
// Session guard
// ---------------------------------------------------------------------------

/// Tracks one in-flight session: bumps the active gauge while alive and
/// records the duration when dropped.
pub struct SessionGuard {
    metrics: Arc<Metrics>,
    transport: Transport,
    started: std::time::Instant,
}

impl SessionGuard {
    pub fn start(metrics: &Arc<Metrics>, transport: Transport) -> Self {
        metrics
            .active_sessions
            .get_or_create(&TransportLabels { transport })
            .inc();
        Self {
            metrics: Arc::clone(metrics),
            transport,
            started: std::time::Instant::now(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let labels = TransportLabels {
            transport: self.transport,
        };
        self.metrics.active_sessions.get_or_create(&labels).dec();
        self.metrics
            .session_duration_seconds
            .get_or_create(&labels)
            .observe(self.started.elapsed().as_secs_f64());
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
