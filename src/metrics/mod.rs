//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Escrow lifecycle outcomes
//! - Records per status
//! - Chain height seen by the poll loop
//! - Poll cycle duration

use crate::error::{EscrowError, EscrowResult};
use crate::state::EscrowStatus;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref ESCROW_TRANSITIONS: CounterVec = register_counter_vec!(
        "escrow_transitions_total",
        "Lifecycle outcomes by kind",
        &["outcome"]
    ).unwrap();

    pub static ref ESCROW_RECORDS: GaugeVec = register_gauge_vec!(
        "escrow_records",
        "Records currently in the ledger by status",
        &["status"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: Gauge = register_gauge!(
        "escrow_chain_block_height",
        "Block height observed at the start of the last poll cycle"
    ).unwrap();

    pub static ref FORWARD_BROADCASTS: Counter = register_counter!(
        "escrow_forward_broadcasts_total",
        "Outbound transfers accepted by the node"
    ).unwrap();

    pub static ref POLL_CYCLE_SECONDS: Histogram = register_histogram!(
        "escrow_poll_cycle_seconds",
        "Duration of one lifecycle poll cycle",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "escrow_rpc_errors_total",
        "Transient chain RPC errors seen by the poll loop",
        &["stage"]
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

    pub async fn run(&self) -> EscrowResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EscrowError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EscrowError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> EscrowResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| EscrowError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| EscrowError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_transition(outcome: &str) {
    ESCROW_TRANSITIONS.with_label_values(&[outcome]).inc();
}

pub fn record_created() {
    record_transition("created");
}

pub fn record_swept(count: usize) {
    ESCROW_TRANSITIONS
        .with_label_values(&["swept"])
        .inc_by(count as f64);
}

pub fn record_forward_broadcast() {
    FORWARD_BROADCASTS.inc();
}

pub fn record_block_height(height: u64) {
    CHAIN_BLOCK_HEIGHT.set(height as f64);
}

pub fn record_rpc_error(stage: &str) {
    RPC_ERRORS.with_label_values(&[stage]).inc();
}

pub fn record_cycle_duration(secs: f64) {
    POLL_CYCLE_SECONDS.observe(secs);
}

pub fn record_status_counts(counts: &HashMap<EscrowStatus, u64>) {
    for (status, count) in counts {
        ESCROW_RECORDS
            .with_label_values(&[status.as_str()])
            .set(*count as f64);
    }
}
