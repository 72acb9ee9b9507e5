//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Broadcasts, confirmations and fatal errors
//! - Gas bumps and bump ceilings
//! - Reorgs and resumed callbacks
//! - Latency until broadcast and blocks until confirmation

use crate::error::{TxmError, TxmResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref TX_BROADCAST: CounterVec = register_counter_vec!(
        "txm_tx_broadcast_total",
        "Transactions broadcast for the first time",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_tx_confirmed_total",
        "Receipts saved for broadcast attempts",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FATAL: CounterVec = register_counter_vec!(
        "txm_tx_fatal_total",
        "Transactions moved to fatal_error",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref GAS_BUMP: CounterVec = register_counter_vec!(
        "txm_gas_bump_total",
        "Bumped attempts created",
        &["chain_id"]
    ).unwrap();

    pub static ref GAS_BUMP_EXCEEDS_LIMIT: CounterVec = register_counter_vec!(
        "txm_gas_bump_exceeds_limit_total",
        "Bumps capped at the configured max price",
        &["chain_id"]
    ).unwrap();

    pub static ref REORG: CounterVec = register_counter_vec!(
        "txm_reorg_total",
        "Confirmed transactions returned to unconfirmed by a reorg",
        &["chain_id"]
    ).unwrap();

    pub static ref CALLBACKS_RESUMED: CounterVec = register_counter_vec!(
        "txm_callbacks_resumed_total",
        "Resume callbacks completed",
        &["chain_id"]
    ).unwrap();

    pub static ref TIME_UNTIL_BROADCAST: HistogramVec = register_histogram_vec!(
        "txm_time_until_broadcast_seconds",
        "Time from creation to first broadcast",
        &["chain_id"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    pub static ref BLOCKS_UNTIL_CONFIRMED: HistogramVec = register_histogram_vec!(
        "txm_blocks_until_confirmed",
        "Blocks between first broadcast and inclusion",
        &["chain_id"],
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    ).unwrap();

    pub static ref HEAD_NUMBER: GaugeVec = register_gauge_vec!(
        "txm_head_number",
        "Latest canonical head number",
        &["chain_id"]
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

    pub async fn run(&self) -> TxmResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxmError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_head(chain_id: u64, number: u64) {
    HEAD_NUMBER
        .with_label_values(&[&chain_id.to_string()])
        .set(number as f64);
}

pub fn record_broadcast(chain_id: u64, seconds_since_created: f64) {
    let chain = chain_id.to_string();
    TX_BROADCAST.with_label_values(&[&chain]).inc();
    TIME_UNTIL_BROADCAST
        .with_label_values(&[&chain])
        .observe(seconds_since_created.max(0.0));
}

pub fn record_confirmed(chain_id: u64, blocks_until_confirmed: Option<u64>) {
    let chain = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&chain]).inc();
    if let Some(blocks) = blocks_until_confirmed {
        BLOCKS_UNTIL_CONFIRMED
            .with_label_values(&[&chain])
            .observe(blocks as f64);
    }
}

pub fn record_fatal(chain_id: u64, reason: &str) {
    TX_FATAL
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_gas_bump(chain_id: u64) {
    GAS_BUMP.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_gas_bump_exceeds_limit(chain_id: u64) {
    GAS_BUMP_EXCEEDS_LIMIT
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reorg(chain_id: u64) {
    REORG.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_callback_resumed(chain_id: u64) {
    CALLBACKS_RESUMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}
