//! Message types flowing between pipeline stages, and the externally
//! observable `EnrichedTx` output record.

use ethers::types::H256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed transaction as pulled out of a raw block. Numeric fields that can
/// exceed 64 bits are carried as decimal strings; per-field decode failures
/// accumulate into `parse_errors` instead of discarding the transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTx {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub nonce: u64,
    pub value_wei: String,
    pub gas: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gas_price_wei: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_fee_per_gas_wei: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_priority_fee_wei: String,
    #[serde(rename = "type")]
    pub tx_type: u64,
    pub input_hex: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_errors: Vec<String>,
}

/// Fetcher → filter envelope. Exactly one of `tx` / `end` is set; an END
/// item closes a block after all its transactions have been emitted.
#[derive(Debug, Clone)]
pub struct TxItem {
    pub block_number: u64,
    pub block_hash: H256,
    pub block_timestamp: u64,
    pub tx: Option<RawTx>,
    pub end: bool,
}

/// Filter → enricher envelope; `tx.to` matches the factory address.
#[derive(Debug, Clone)]
pub struct FilteredTx {
    pub block_number: u64,
    pub block_hash: H256,
    pub block_timestamp: u64,
    pub tx: RawTx,
}

/// Filter → tracker: per-block count of forwarded transactions, published
/// once per block after all of its `FilteredTx` items have been enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFiltered {
    pub block_number: u64,
    pub filtered_count: usize,
}

/// Receipt summary captured on an enriched transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptInfo {
    pub status: u64,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    #[serde(
        rename = "effective_gas_price_wei",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub effective_gas_price: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract_address: String,
    pub transaction_index: u64,
    pub logs_count: usize,
}

/// A decoded method call from transaction input data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedMethod {
    pub name: String,
    pub args: serde_json::Map<String, Value>,
}

/// A decoded event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedLog {
    pub event: String,
    pub address: String,
    pub args: serde_json::Map<String, Value>,
    pub topics: Vec<String>,
    pub data: String,
}

/// The externally observable output record: one JSON line per factory
/// transaction, in the order the enricher pool completes them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedTx {
    pub chain: String,
    pub chain_id: u64,
    pub block_number: u64,
    pub block_hash: String,
    pub block_timestamp: u64,
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    pub nonce: u64,
    pub value_wei: String,
    pub gas: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gas_price_wei: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_fee_per_gas_wei: String,
    #[serde(
        rename = "max_priority_fee_wei",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub max_priority_fee: String,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub input_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<DecodedMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ReceiptInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decoded_logs: Vec<DecodedLog>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pool_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}
