//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Order lifecycle transitions
//! - Verification failures and secret releases
//! - Partial fills and halted orders

use crate::chain::ChainFamily;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::OrderPhase;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_int_counter,
    CounterVec, Encoder, GaugeVec, Histogram, IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "fusion_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).expect("register fusion_chain_connected");

    // Order metrics
    pub static ref ORDERS_SUBMITTED: CounterVec = register_counter_vec!(
        "fusion_orders_submitted_total",
        "Total orders submitted by source chain",
        &["src_chain"]
    ).expect("register fusion_orders_submitted_total");

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "fusion_phase_transitions_total",
        "Order phase transitions",
        &["from", "to"]
    ).expect("register fusion_phase_transitions_total");

    pub static ref ORDERS_BY_PHASE: GaugeVec = register_gauge_vec!(
        "fusion_orders_by_phase",
        "Orders currently in each phase",
        &["phase"]
    ).expect("register fusion_orders_by_phase");

    pub static ref ORDER_DURATION: Histogram = register_histogram!(
        "fusion_order_duration_seconds",
        "Time from submission to a terminal phase",
        vec![30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0]
    ).expect("register fusion_order_duration_seconds");

    pub static ref ORDERS_HALTED: IntCounter = register_int_counter!(
        "fusion_orders_halted_total",
        "Orders halted on an invariant violation"
    ).expect("register fusion_orders_halted_total");

    // Safety metrics
    pub static ref VERIFICATION_FAILURES: CounterVec = register_counter_vec!(
        "fusion_verification_failures_total",
        "Escrow verifications that found issues",
        &["chain"]
    ).expect("register fusion_verification_failures_total");

    pub static ref SECRETS_REVEALED: IntCounter = register_int_counter!(
        "fusion_secrets_revealed_total",
        "Secrets released by the gate"
    ).expect("register fusion_secrets_revealed_total");

    pub static ref REVEALS_REFUSED: IntCounter = register_int_counter!(
        "fusion_reveals_refused_total",
        "Reveal requests refused because conditions were not met"
    ).expect("register fusion_reveals_refused_total");

    pub static ref PARTIAL_FILLS: IntCounter = register_int_counter!(
        "fusion_partial_fills_total",
        "Partial fills recorded"
    ).expect("register fusion_partial_fills_total");

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: IntCounter = register_int_counter!(
        "fusion_health_check_success_total",
        "Total successful health checks"
    ).expect("register fusion_health_check_success_total");

    pub static ref HEALTH_CHECK_FAILURE: IntCounter = register_int_counter!(
        "fusion_health_check_failure_total",
        "Total failed health checks"
    ).expect("register fusion_health_check_failure_total");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

pub async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainFamily, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_order_submitted(src_chain: ChainFamily) {
    ORDERS_SUBMITTED.with_label_values(&[src_chain.as_str()]).inc();
}

pub fn record_transition(from: OrderPhase, to: OrderPhase) {
    PHASE_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_phase_count(phase: OrderPhase, count: usize) {
    ORDERS_BY_PHASE
        .with_label_values(&[phase.as_str()])
        .set(count as f64);
}

pub fn record_order_finished(duration_secs: i64) {
    ORDER_DURATION.observe(duration_secs.max(0) as f64);
}

pub fn record_order_halted() {
    ORDERS_HALTED.inc();
}

pub fn record_verification_failure(chain: ChainFamily) {
    VERIFICATION_FAILURES
        .with_label_values(&[chain.as_str()])
        .inc();
}

pub fn record_secret_revealed() {
    SECRETS_REVEALED.inc();
}

pub fn record_reveal_refused() {
    REVEALS_REFUSED.inc();
}

pub fn record_partial_fill() {
    PARTIAL_FILLS.inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.inc();
}
