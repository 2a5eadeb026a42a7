//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation
//! - Queue throughput and depth
//! - Confirmation outcomes and latency
//! - Chain connection status

use crate::error::{SubmitterError, SubmitterResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_gauge, CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static! {
    // Nonce metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "tx_submitter_nonces_allocated_total",
        "Nonces handed out, by whether the chain was queried",
        &["source"]
    ).unwrap();

    pub static ref NONCE_QUERY_FAILURES: IntCounter = register_int_counter!(
        "tx_submitter_nonce_query_failures_total",
        "Failed pending-nonce queries"
    ).unwrap();

    // Queue metrics
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "tx_submitter_queue_depth",
        "Submissions waiting behind the one in flight"
    ).unwrap();

    pub static ref QUEUE_EVENTS: CounterVec = register_counter_vec!(
        "tx_submitter_queue_events_total",
        "Queue admissions and closures",
        &["event"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "tx_submitter_transactions_confirmed_total",
        "Transactions observed leaving the pending pool",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_UNCONFIRMED: CounterVec = register_counter_vec!(
        "tx_submitter_transactions_unconfirmed_total",
        "Transactions still pending when the confirmation timeout elapsed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_SEND_FAILED: IntCounter = register_int_counter!(
        "tx_submitter_send_failures_total",
        "Send operations that returned an error"
    ).unwrap();

    pub static ref POLL_ERRORS: CounterVec = register_counter_vec!(
        "tx_submitter_confirmation_poll_errors_total",
        "Failed transaction lookups while polling",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_submitter_confirmation_latency_seconds",
        "Time from broadcast to leaving the pending pool",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "tx_submitter_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: IntCounter = register_int_counter!(
        "tx_submitter_health_checks_total",
        "Periodic health check runs"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> SubmitterResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(%addr, "Starting metrics server");

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SubmitterError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| SubmitterError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> (StatusCode, String) {
    match encode_metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Render all registered metrics in the text exposition format
pub fn encode_metrics() -> SubmitterResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SubmitterError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SubmitterError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_nonce_allocated(source: &str) {
    NONCES_ALLOCATED.with_label_values(&[source]).inc();
}

pub fn record_nonce_query_failed() {
    NONCE_QUERY_FAILURES.inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

pub fn record_enqueued() {
    QUEUE_EVENTS.with_label_values(&["enqueued"]).inc();
}

pub fn record_rejected() {
    QUEUE_EVENTS.with_label_values(&["rejected"]).inc();
}

pub fn record_drained(count: usize) {
    QUEUE_EVENTS
        .with_label_values(&["drained"])
        .inc_by(count as f64);
}

pub fn record_send_failed() {
    TX_SEND_FAILED.inc();
}

pub fn record_tx_confirmed(chain_id: u64, latency_secs: f64) {
    let chain = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&chain]).inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[&chain])
        .observe(latency_secs);
}

pub fn record_tx_unconfirmed(chain_id: u64) {
    TX_UNCONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_poll_error(chain_id: u64) {
    POLL_ERRORS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECKS.inc();
}
