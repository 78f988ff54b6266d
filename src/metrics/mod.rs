//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Marketplace activity (intents, matches, sweeps)
//! - HTLC operations and contract rejections per network
//! - Ledger call latency and network health

use crate::error::{SwapError, SwapResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Marketplace metrics
    pub static ref INTENTS_CREATED: CounterVec = register_counter_vec!(
        "htlc_swap_intents_created_total",
        "Total intents created by route",
        &["from_network", "to_network"]
    ).unwrap();

    pub static ref MATCHES_CREATED: CounterVec = register_counter_vec!(
        "htlc_swap_matches_created_total",
        "Total matches created",
        &[]
    ).unwrap();

    pub static ref ACTIVE_INTENTS: Gauge = register_gauge!(
        "htlc_swap_active_intents",
        "Pending intents younger than the expiry horizon"
    ).unwrap();

    pub static ref SWEEP_EXPIRED: CounterVec = register_counter_vec!(
        "htlc_swap_sweep_expired_total",
        "Records expired by the periodic sweep",
        &["kind"]
    ).unwrap();

    // Ledger metrics
    pub static ref HTLC_OPS: CounterVec = register_counter_vec!(
        "htlc_swap_htlc_operations_total",
        "HTLC submissions by outcome",
        &["network", "op", "outcome"]
    ).unwrap();

    pub static ref REJECTIONS: CounterVec = register_counter_vec!(
        "htlc_swap_contract_rejections_total",
        "Contract rejections by reason",
        &["network", "reason"]
    ).unwrap();

    pub static ref SECRETS_REVEALED: CounterVec = register_counter_vec!(
        "htlc_swap_secrets_revealed_total",
        "Secrets extracted from withdrawals",
        &["network"]
    ).unwrap();

    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "htlc_swap_ledger_events_total",
        "Ledger events received by type",
        &["network", "event_type"]
    ).unwrap();

    pub static ref LEDGER_LATENCY: HistogramVec = register_histogram_vec!(
        "htlc_swap_ledger_call_seconds",
        "Ledger call latency",
        &["network", "call"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref NETWORK_HEALTHY: GaugeVec = register_gauge_vec!(
        "htlc_swap_network_healthy",
        "Network reachability (1=healthy, 0=unreachable)",
        &["network"]
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

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Internal(format!("failed to bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_intent_created(from_network: &str, to_network: &str) {
    INTENTS_CREATED
        .with_label_values(&[from_network, to_network])
        .inc();
}

pub fn record_match_created() {
    MATCHES_CREATED.with_label_values(&[]).inc();
}

pub fn set_active_intents(count: usize) {
    ACTIVE_INTENTS.set(count as f64);
}

pub fn record_sweep_expired(kind: &str, count: usize) {
    if count > 0 {
        SWEEP_EXPIRED.with_label_values(&[kind]).inc_by(count as f64);
    }
}

pub fn record_htlc_op(network: &str, op: &str, outcome: &str) {
    HTLC_OPS.with_label_values(&[network, op, outcome]).inc();
}

pub fn record_rejection(network: &str, reason: &str) {
    REJECTIONS.with_label_values(&[network, reason]).inc();
}

pub fn record_secret_revealed(network: &str) {
    SECRETS_REVEALED.with_label_values(&[network]).inc();
}

pub fn record_event(network: &str, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[network, event_type])
        .inc();
}

pub fn observe_ledger_latency(network: &str, call: &str, elapsed: Duration) {
    LEDGER_LATENCY
        .with_label_values(&[network, call])
        .observe(elapsed.as_secs_f64());
}

pub fn record_network_health(network: &str, healthy: bool) {
    NETWORK_HEALTHY
        .with_label_values(&[network])
        .set(if healthy { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_htlc_op("fuji", "create", "success");
        record_network_health("fuji", true);

        let text = render().unwrap();
        assert!(text.contains("htlc_swap_htlc_operations_total"));
        assert!(text.contains("htlc_swap_network_healthy"));
    }
}
