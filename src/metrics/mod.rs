//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Scan progress and fork detections per chain
//! - Deposit relays and outbound broadcasts
//! - Queue depths and endpoint failovers

use crate::error::{EngineError, EngineResult};

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Scan metrics
    pub static ref LOCAL_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_local_scan_height",
        "Last locally analyzed block height per chain",
        &["chain"]
    ).unwrap();

    pub static ref REMOTE_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_remote_tip_height",
        "Last observed remote tip height per chain",
        &["chain"]
    ).unwrap();

    pub static ref FORKS_DETECTED: CounterVec = register_counter_vec!(
        "bridge_forks_detected_total",
        "Fork rollbacks performed by the scanner",
        &["chain"]
    ).unwrap();

    // Relay metrics
    pub static ref DEPOSITS_RELAYED: CounterVec = register_counter_vec!(
        "bridge_deposits_relayed_total",
        "Deposits submitted to the home chain",
        &["chain"]
    ).unwrap();

    pub static ref BROADCASTS_SENT: CounterVec = register_counter_vec!(
        "bridge_broadcasts_sent_total",
        "Outbound multi-sig transactions broadcast by this node",
        &["chain"]
    ).unwrap();

    pub static ref BROADCASTS_CONFIRMED: CounterVec = register_counter_vec!(
        "bridge_broadcasts_confirmed_total",
        "Outbound broadcasts reported confirmed to the home chain",
        &["chain"]
    ).unwrap();

    pub static ref ACCELERATIONS: CounterVec = register_counter_vec!(
        "bridge_gas_accelerations_total",
        "Replacement or override transactions sent for stuck broadcasts",
        &["chain"]
    ).unwrap();

    // Queue metrics
    pub static ref UNCONFIRMED_DEPTH: GaugeVec = register_gauge_vec!(
        "bridge_unconfirmed_queue_depth",
        "Entries in the unconfirmed-transaction queue",
        &["chain"]
    ).unwrap();

    pub static ref WAITING_DEPTH: GaugeVec = register_gauge_vec!(
        "bridge_waiting_broadcast_depth",
        "Pending outbound actions awaiting their broadcast turn",
        &["chain"]
    ).unwrap();

    // Endpoint metrics
    pub static ref ENDPOINT_FAILOVERS: CounterVec = register_counter_vec!(
        "bridge_endpoint_failovers_total",
        "RPC endpoint switches per chain",
        &["chain"]
    ).unwrap();
}

/// Prometheus metrics server with a health probe
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(|| async { "ok" }));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_block_scanned(chain: &str, height: u64) {
    LOCAL_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

pub fn record_remote_height(chain: &str, height: u64) {
    REMOTE_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

pub fn record_fork(chain: &str) {
    FORKS_DETECTED.with_label_values(&[chain]).inc();
}

pub fn record_deposit_relayed(chain: &str) {
    DEPOSITS_RELAYED.with_label_values(&[chain]).inc();
}

pub fn record_broadcast_sent(chain: &str) {
    BROADCASTS_SENT.with_label_values(&[chain]).inc();
}

pub fn record_broadcast_confirmed(chain: &str) {
    BROADCASTS_CONFIRMED.with_label_values(&[chain]).inc();
}

pub fn record_acceleration(chain: &str) {
    ACCELERATIONS.with_label_values(&[chain]).inc();
}

pub fn record_unconfirmed_depth(chain: &str, depth: usize) {
    UNCONFIRMED_DEPTH.with_label_values(&[chain]).set(depth as f64);
}

pub fn record_waiting_depth(chain: &str, depth: usize) {
    WAITING_DEPTH.with_label_values(&[chain]).set(depth as f64);
}

pub fn record_endpoint_failover(chain: &str) {
    ENDPOINT_FAILOVERS.with_label_values(&[chain]).inc();
}
