//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for reconciliation metrics (namespace + name)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for per-replica-set metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReplsetLabels {
    pub namespace: String,
    pub name: String,
    pub replset: String,
}

impl EncodeLabelSet for ReplsetLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("replset", self.replset.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

impl ReplsetLabels {
    fn new(namespace: &str, name: &str, replset: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            replset: replset.to_string(),
        }
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Replica set bootstraps issued
    pub replset_initializations_total: Family<ReplsetLabels, Counter>,
    /// Member probes that failed
    pub member_probe_failures_total: Family<ReplsetLabels, Counter>,
    /// Desired members per replica set
    pub replset_members_desired: Family<ReplsetLabels, Gauge>,
    /// Members that answered the last probe
    pub replset_members_up: Family<ReplsetLabels, Gauge>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "mongodb_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "mongodb_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "mongodb_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let replset_initializations_total = Family::<ReplsetLabels, Counter>::default();
        registry.register(
            "mongodb_operator_replset_initializations",
            "Total number of replica set bootstraps issued",
            replset_initializations_total.clone(),
        );

        let member_probe_failures_total = Family::<ReplsetLabels, Counter>::default();
        registry.register(
            "mongodb_operator_member_probe_failures",
            "Total number of failed member probes",
            member_probe_failures_total.clone(),
        );

        let replset_members_desired = Family::<ReplsetLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_replset_members_desired",
            "Desired number of members for each replica set",
            replset_members_desired.clone(),
        );

        let replset_members_up = Family::<ReplsetLabels, Gauge>::default();
        registry.register(
            "mongodb_operator_replset_members_up",
            "Number of members that answered the last probe",
            replset_members_up.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            replset_initializations_total,
            member_probe_failures_total,
            replset_members_desired,
            replset_members_up,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record a bootstrap command issued for a replica set
    pub fn record_initialization(&self, namespace: &str, name: &str, replset: &str) {
        self.replset_initializations_total
            .get_or_create(&ReplsetLabels::new(namespace, name, replset))
            .inc();
    }

    /// Record the outcome of probing a replica set's members
    pub fn record_member_probe(
        &self,
        namespace: &str,
        name: &str,
        replset: &str,
        up: usize,
        failed: usize,
    ) {
        let labels = ReplsetLabels::new(namespace, name, replset);
        self.replset_members_up
            .get_or_create(&labels)
            .set(i64::try_from(up).unwrap_or(i64::MAX));
        if failed > 0 {
            self.member_probe_failures_total
                .get_or_create(&labels)
                .inc_by(u64::try_from(failed).unwrap_or(u64::MAX));
        }
    }

    /// Update desired member count
    pub fn set_members_desired(&self, namespace: &str, name: &str, replset: &str, desired: i64) {
        self.replset_members_desired
            .get_or_create(&ReplsetLabels::new(namespace, name, replset))
            .set(desired);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controller)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 200 OK if the operator is ready to serve.
/// Returns 503 Service Unavailable if not ready.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0 on `port` and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
