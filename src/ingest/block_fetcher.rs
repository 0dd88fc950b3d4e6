//! Block-fetcher worker pool.
//!
//! Each worker pulls block numbers off a shared queue, fetches the full
//! block with transactions (with retry), parses every transaction into a
//! [`RawTx`] with per-field error accumulation, and emits one [`TxItem`]
//! per transaction followed by exactly one END marker for the block.
//! Within a block all transaction items precede the END; across blocks no
//! ordering is guaranteed.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{H256, U256};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::blockchain::{ChainClient, RpcBlock, RpcTx};
use crate::errors::PipelineError;
use crate::ingest::SharedRx;
use crate::metrics;
use crate::types::{RawTx, TxItem};
use crate::utils::retry_with_backoff;

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub retry_max: u32,
    pub retry_backoff: Duration,
}

pub async fn run_block_fetchers(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    workers: usize,
    policy: FetchPolicy,
    input: SharedRx<u64>,
    out: mpsc::Sender<TxItem>,
) -> Result<(), PipelineError> {
    let mut set = JoinSet::new();
    for worker_id in 0..workers.max(1) {
        set.spawn(block_fetcher(
            cancel.child_token(),
            client.clone(),
            policy,
            input.clone(),
            out.clone(),
            worker_id,
        ));
    }
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                cancel.cancel();
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(PipelineError::StagePanic(e.to_string()));
                }
                cancel.cancel();
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn block_fetcher(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    policy: FetchPolicy,
    input: SharedRx<u64>,
    out: mpsc::Sender<TxItem>,
    worker_id: usize,
) -> Result<(), PipelineError> {
    loop {
        let number = {
            let mut rx = input.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Some(n) => n,
                    None => return Ok(()),
                }
            }
        };

        let fetched = retry_with_backoff(&cancel, policy.retry_max, policy.retry_backoff, || {
            let client = client.clone();
            async move {
                client.raw_block_by_number(number).await.map_err(|e| {
                    metrics::RPC_RETRIES.with_label_values(&["block"]).inc();
                    e
                })
            }
        })
        .await;

        match fetched {
            Ok(block) => {
                metrics::BLOCKS_FETCHED.inc();
                if !push_block(&cancel, block, number, &out).await? {
                    return Ok(());
                }
            }
            Err(crate::errors::BlockchainError::Cancelled) => return Ok(()),
            Err(e) => {
                // The tracker never sees an END for this block, so the
                // checkpoint holds below it and a restart re-ingests it.
                metrics::BLOCKS_FAILED.inc();
                error!(target: "block_fetcher", block = number, worker = worker_id, error = %e, "fetch block failed");
            }
        }
    }
}

/// Emits all transaction items for `block`, then its END marker. Returns
/// false when the pipeline is shutting down.
async fn push_block(
    cancel: &CancellationToken,
    block: RpcBlock,
    requested: u64,
    out: &mpsc::Sender<TxItem>,
) -> Result<bool, PipelineError> {
    let block_number = match decode_hex_u64(&block.number) {
        Some(n) => n,
        None => {
            if !block.number.is_empty() {
                warn!(target: "block_fetcher", block = requested, value = %block.number, "block number decode failed");
            }
            requested
        }
    };
    let block_timestamp = match decode_hex_u64(&block.timestamp) {
        Some(ts) => ts,
        None => {
            if !block.timestamp.is_empty() {
                warn!(target: "block_fetcher", block = requested, value = %block.timestamp, "block timestamp decode failed");
            }
            0
        }
    };
    let block_hash: H256 = block.hash.trim().parse().unwrap_or_default();

    debug!(target: "block_fetcher", block = block_number, txs = block.transactions.len(), "block fetched");

    for tx in block.transactions {
        let raw = match parse_raw_tx(tx, block_number) {
            Some(raw) => raw,
            None => continue,
        };
        let item = TxItem {
            block_number,
            block_hash,
            block_timestamp,
            tx: Some(raw),
            end: false,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            sent = out.send(item) => {
                sent.map_err(|_| PipelineError::ChannelClosed("block fetchers -> filter"))?;
            }
        }
    }

    let end = TxItem {
        block_number,
        block_hash,
        block_timestamp,
        tx: None,
        end: true,
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        sent = out.send(end) => {
            sent.map_err(|_| PipelineError::ChannelClosed("block fetchers -> filter"))?;
            Ok(true)
        }
    }
}

/// Parses a wire transaction, accumulating field-level failures instead of
/// discarding the transaction. Only a missing hash drops it entirely.
pub fn parse_raw_tx(tx: RpcTx, block_number: u64) -> Option<RawTx> {
    let mut errs = Vec::new();

    if tx.hash.trim().is_empty() {
        warn!(target: "block_fetcher", block = block_number, "tx missing hash");
        return None;
    }

    let to = tx.to.as_deref().unwrap_or("").trim().to_string();
    let mut input = tx.input.trim().to_string();
    if input.is_empty() {
        input = "0x".to_string();
    }

    let nonce = decode_u64_field(&tx.nonce, "nonce", &mut errs);
    let gas = decode_u64_field(&tx.gas, "gas", &mut errs);
    let tx_type = decode_u64_field(&tx.tx_type, "type", &mut errs);

    let value_wei = decode_big_field(&tx.value, "value", true, &mut errs);
    let gas_price_wei = decode_big_field(&tx.gas_price, "gasPrice", false, &mut errs);
    let max_fee_per_gas_wei = decode_big_field(&tx.max_fee_per_gas, "maxFeePerGas", false, &mut errs);
    let max_priority_fee_wei =
        decode_big_field(&tx.max_priority_fee_per_gas, "maxPriorityFeePerGas", false, &mut errs);

    Some(RawTx {
        hash: tx.hash.trim().to_string(),
        from: tx.from.trim().to_string(),
        to,
        nonce,
        value_wei,
        gas,
        gas_price_wei,
        max_fee_per_gas_wei,
        max_priority_fee_wei,
        tx_type,
        input_hex: input,
        parse_errors: errs,
    })
}

fn decode_hex_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn decode_u64_field(value: &str, field: &str, errs: &mut Vec<String>) -> u64 {
    let value = value.trim();
    if value.is_empty() {
        return 0;
    }
    match decode_hex_u64(value) {
        Some(v) => v,
        None => {
            errs.push(format!("{field}: invalid hex quantity {value:?}"));
            0
        }
    }
}

/// Decodes a hex quantity into a decimal string. Empty or invalid values
/// take the sentinel: "0" when `allow_zero`, "" otherwise.
fn decode_big_field(value: &str, field: &str, allow_zero: bool, errs: &mut Vec<String>) -> String {
    let sentinel = || if allow_zero { "0".to_string() } else { String::new() };
    let value = value.trim();
    if value.is_empty() {
        return sentinel();
    }
    let digits = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(d) if !d.is_empty() => d,
        _ => {
            errs.push(format!("{field}: invalid hex quantity {value:?}"));
            return sentinel();
        }
    };
    match U256::from_str_radix(digits, 16) {
        Ok(v) => v.to_string(),
        Err(e) => {
            errs.push(format!("{field}: {e}"));
            sentinel()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_tx() -> RpcTx {
        RpcTx {
            hash: "0xabc123".into(),
            from: "0x1111111111111111111111111111111111111111".into(),
            to: Some("0x2222222222222222222222222222222222222222".into()),
            nonce: "0x7".into(),
            value: "0xde0b6b3a7640000".into(), // 1 ether
            gas: "0x5208".into(),
            gas_price: "0x3b9aca00".into(),
            max_fee_per_gas: "0x77359400".into(),
            max_priority_fee_per_gas: "0xbebc200".into(),
            tx_type: "0x2".into(),
            input: "0xd6febde8".into(),
        }
    }

    #[test]
    fn parses_well_formed_transaction() {
        let raw = parse_raw_tx(wire_tx(), 10).unwrap();
        assert_eq!(raw.nonce, 7);
        assert_eq!(raw.gas, 21000);
        assert_eq!(raw.tx_type, 2);
        assert_eq!(raw.value_wei, "1000000000000000000");
        assert_eq!(raw.gas_price_wei, "1000000000");
        assert_eq!(raw.max_fee_per_gas_wei, "2000000000");
        assert_eq!(raw.max_priority_fee_wei, "200000000");
        assert!(raw.parse_errors.is_empty());
    }

    #[test]
    fn field_errors_accumulate_without_dropping_tx() {
        let mut tx = wire_tx();
        tx.nonce = "zz".into();
        tx.value = "not-hex".into();
        let raw = parse_raw_tx(tx, 10).unwrap();
        assert_eq!(raw.nonce, 0);
        assert_eq!(raw.value_wei, "0"); // value sentinel is "0"
        assert_eq!(raw.parse_errors.len(), 2);
    }

    #[test]
    fn missing_hash_drops_the_tx() {
        let mut tx = wire_tx();
        tx.hash = "  ".into();
        assert!(parse_raw_tx(tx, 10).is_none());
    }

    #[test]
    fn empty_optional_fee_fields_take_empty_sentinel() {
        let mut tx = wire_tx();
        tx.gas_price = String::new();
        tx.max_fee_per_gas = String::new();
        tx.max_priority_fee_per_gas = String::new();
        let raw = parse_raw_tx(tx, 10).unwrap();
        assert_eq!(raw.gas_price_wei, "");
        assert_eq!(raw.max_fee_per_gas_wei, "");
        assert_eq!(raw.max_priority_fee_wei, "");
        assert!(raw.parse_errors.is_empty());
    }

    #[test]
    fn missing_to_and_empty_input_take_sentinels() {
        let mut tx = wire_tx();
        tx.to = None;
        tx.input = String::new();
        let raw = parse_raw_tx(tx, 10).unwrap();
        assert_eq!(raw.to, "");
        assert_eq!(raw.input_hex, "0x");
    }

    #[test]
    fn value_beyond_u64_keeps_full_precision() {
        let mut tx = wire_tx();
        // 2^128
        tx.value = "0x100000000000000000000000000000000".into();
        let raw = parse_raw_tx(tx, 10).unwrap();
        assert_eq!(raw.value_wei, "340282366920938463463374607431768211456");
    }
}
