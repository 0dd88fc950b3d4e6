//! # Metrics Registry
//!
//! Prometheus metrics for the ingestion pipeline and the trade path,
//! registered once and exposed as text through the API server's `/metrics`
//! route.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static BLOCKS_FETCHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "factoryscope_blocks_fetched_total",
        "Blocks fetched with full transaction bodies."
    )
    .expect("Failed to register factoryscope_blocks_fetched_total")
});

pub static BLOCKS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "factoryscope_blocks_failed_total",
        "Blocks dropped after exhausting fetch retries."
    )
    .expect("Failed to register factoryscope_blocks_failed_total")
});

pub static TXS_FILTERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "factoryscope_txs_filtered_total",
        "Transactions matching the factory address."
    )
    .expect("Failed to register factoryscope_txs_filtered_total")
});

pub static TXS_ENRICHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "factoryscope_txs_enriched_total",
        "Enriched transaction records emitted downstream."
    )
    .expect("Failed to register factoryscope_txs_enriched_total")
});

pub static OUTPUT_LINES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "factoryscope_output_lines_total",
        "JSONL lines written to the output sink."
    )
    .expect("Failed to register factoryscope_output_lines_total")
});

pub static CHECKPOINT_BLOCK: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "factoryscope_checkpoint_block",
        "Last durably checkpointed block number."
    )
    .expect("Failed to register factoryscope_checkpoint_block")
});

pub static RPC_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "factoryscope_rpc_retries_total",
        "RPC attempts that failed and were retried, labeled by operation.",
        &["operation"]
    )
    .expect("Failed to register factoryscope_rpc_retries_total")
});

pub static TRADES_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "factoryscope_trades_submitted_total",
        "Signed trade transactions accepted by the node, labeled by kind.",
        &["kind"]
    )
    .expect("Failed to register factoryscope_trades_submitted_total")
});

/// Encodes the full registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(target: "metrics", error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
