//! Enricher worker pool.
//!
//! Each worker consumes a filtered transaction, fetches its receipt with
//! retry, decodes calldata and logs against the configured ABI, and emits
//! the enriched record followed by a per-transaction ack to the tracker.
//! Every per-item failure is non-fatal and lands in `errors[]`.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{TransactionReceipt, H256, U256};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::blockchain::ChainClient;
use crate::decoder::Decoder;
use crate::errors::PipelineError;
use crate::ingest::SharedRx;
use crate::metrics;
use crate::types::{EnrichedTx, FilteredTx, ReceiptInfo};
use crate::utils::retry_with_backoff;

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub chain: String,
    pub chain_id: u64,
    pub decode_input: bool,
    pub decode_logs: bool,
    pub retry_max: u32,
    pub retry_backoff: Duration,
}

pub async fn run_enrichers(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    decoder: Arc<Decoder>,
    cfg: EnricherConfig,
    workers: usize,
    input: SharedRx<FilteredTx>,
    out: mpsc::Sender<EnrichedTx>,
    acks: mpsc::Sender<u64>,
) -> Result<(), PipelineError> {
    let mut set = JoinSet::new();
    for worker_id in 0..workers.max(1) {
        set.spawn(enrich_worker(
            cancel.child_token(),
            client.clone(),
            decoder.clone(),
            cfg.clone(),
            input.clone(),
            out.clone(),
            acks.clone(),
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

#[allow(clippy::too_many_arguments)]
async fn enrich_worker(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    decoder: Arc<Decoder>,
    cfg: EnricherConfig,
    input: SharedRx<FilteredTx>,
    out: mpsc::Sender<EnrichedTx>,
    acks: mpsc::Sender<u64>,
    worker_id: usize,
) -> Result<(), PipelineError> {
    loop {
        let item = {
            let mut rx = input.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Some(item) => item,
                    None => return Ok(()),
                }
            }
        };
        let block_number = item.block_number;

        let enriched = enrich_one(&cancel, &client, &decoder, &cfg, item, worker_id).await;
        metrics::TXS_ENRICHED.inc();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = out.send(enriched) => {
                sent.map_err(|_| PipelineError::ChannelClosed("enrichers -> evaluator"))?;
            }
        }
        // The ack must trail the record so the tracker can never checkpoint
        // past an un-emitted transaction.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = acks.send(block_number) => {
                sent.map_err(|_| PipelineError::ChannelClosed("enrichers -> tracker"))?;
            }
        }
    }
}

async fn enrich_one(
    cancel: &CancellationToken,
    client: &Arc<dyn ChainClient>,
    decoder: &Decoder,
    cfg: &EnricherConfig,
    item: FilteredTx,
    worker_id: usize,
) -> EnrichedTx {
    let tx = item.tx;
    let mut enriched = EnrichedTx {
        chain: cfg.chain.clone(),
        chain_id: cfg.chain_id,
        block_number: item.block_number,
        block_hash: format!("{:#x}", item.block_hash),
        block_timestamp: item.block_timestamp,
        tx_hash: tx.hash.clone(),
        from: tx.from.clone(),
        to: tx.to.clone(),
        nonce: tx.nonce,
        value_wei: tx.value_wei.clone(),
        gas: tx.gas,
        gas_price_wei: tx.gas_price_wei.clone(),
        max_fee_per_gas_wei: tx.max_fee_per_gas_wei.clone(),
        max_priority_fee: tx.max_priority_fee_wei.clone(),
        input_hex: tx.input_hex.clone(),
        errors: tx.parse_errors.clone(),
        ..Default::default()
    };

    enriched.tx_type = saturate_tx_type(tx.tx_type, &mut enriched.errors);

    match tx.hash.parse::<H256>() {
        Err(_) => enriched.errors.push("invalid_tx_hash".to_string()),
        Ok(hash) => {
            let receipt =
                retry_with_backoff(cancel, cfg.retry_max, cfg.retry_backoff, || {
                    let client = client.clone();
                    async move {
                        client.transaction_receipt(hash).await.map_err(|e| {
                            metrics::RPC_RETRIES.with_label_values(&["receipt"]).inc();
                            e
                        })
                    }
                })
                .await;
            match receipt {
                Err(e) => {
                    error!(target: "enricher", tx = %tx.hash, worker = worker_id, error = %e, "receipt fetch failed");
                    enriched.errors.push(format!("receipt: {e}"));
                }
                Ok(None) => {
                    enriched.errors.push("receipt: not found".to_string());
                }
                Ok(Some(receipt)) => {
                    enriched.receipt = Some(receipt_info(&receipt));
                    if cfg.decode_logs {
                        match decoder.decode_logs(&receipt.logs) {
                            Ok(decoded) => {
                                enriched.decoded_logs = decoded.logs;
                                enriched.pool_address = decoded.pool_address;
                                enriched.token_addresses = decoded.token_addresses;
                            }
                            Err(e) => enriched.errors.push(format!("decode_logs: {e}")),
                        }
                    }
                }
            }
        }
    }

    if cfg.decode_input && !tx.input_hex.is_empty() {
        match decode_input_hex(&tx.input_hex) {
            Err(e) => enriched.errors.push(format!("decode_input_hex: {e}")),
            Ok(bytes) => match decoder.decode_input(&bytes) {
                Ok(method) => enriched.method = method,
                Err(e) => enriched.errors.push(format!("decode_input: {e}")),
            },
        }
    }

    enriched
}

fn receipt_info(receipt: &TransactionReceipt) -> ReceiptInfo {
    ReceiptInfo {
        status: receipt.status.map(|s| s.as_u64()).unwrap_or(0),
        cumulative_gas_used: clamp_u64(receipt.cumulative_gas_used),
        gas_used: receipt.gas_used.map(clamp_u64).unwrap_or(0),
        effective_gas_price: receipt
            .effective_gas_price
            .map(|p| p.to_string())
            .unwrap_or_default(),
        contract_address: receipt
            .contract_address
            .map(|a| format!("{a:#x}"))
            .unwrap_or_default(),
        transaction_index: receipt.transaction_index.as_u64(),
        logs_count: receipt.logs.len(),
    }
}

fn clamp_u64(v: U256) -> u64 {
    if v > U256::from(u64::MAX) {
        u64::MAX
    } else {
        v.as_u64()
    }
}

fn saturate_tx_type(tx_type: u64, errors: &mut Vec<String>) -> u8 {
    if tx_type > u8::MAX as u64 {
        errors.push("tx_type_overflow".to_string());
        u8::MAX
    } else {
        tx_type as u8
    }
}

fn decode_input_hex(input: &str) -> Result<Vec<u8>, String> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .ok_or_else(|| "missing 0x prefix".to_string())?;
    hex::decode(digits).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_type_saturates_at_255() {
        let mut errs = Vec::new();
        assert_eq!(saturate_tx_type(2, &mut errs), 2);
        assert!(errs.is_empty());
        assert_eq!(saturate_tx_type(300, &mut errs), 255);
        assert_eq!(errs, vec!["tx_type_overflow"]);
    }

    #[test]
    fn input_hex_requires_prefix() {
        assert_eq!(decode_input_hex("0xd6febde8").unwrap(), vec![0xd6, 0xfe, 0xbd, 0xe8]);
        assert!(decode_input_hex("d6febde8").is_err());
        assert!(decode_input_hex("0xzz").is_err());
    }

    #[test]
    fn receipt_info_captures_optional_fields() {
        let receipt = TransactionReceipt {
            status: Some(1u64.into()),
            cumulative_gas_used: U256::from(123_456u64),
            gas_used: Some(U256::from(21_000u64)),
            effective_gas_price: Some(U256::from(1_000_000_000u64)),
            contract_address: Some(
                "0x00000000000000000000000000000000000000cc".parse().unwrap(),
            ),
            transaction_index: 4u64.into(),
            ..Default::default()
        };
        let info = receipt_info(&receipt);
        assert_eq!(info.status, 1);
        assert_eq!(info.cumulative_gas_used, 123_456);
        assert_eq!(info.gas_used, 21_000);
        assert_eq!(info.effective_gas_price, "1000000000");
        assert_eq!(info.contract_address, "0x00000000000000000000000000000000000000cc");
        assert_eq!(info.transaction_index, 4);
        assert_eq!(info.logs_count, 0);
    }

    #[test]
    fn receipt_info_tolerates_missing_fields() {
        let info = receipt_info(&TransactionReceipt::default());
        assert_eq!(info.status, 0);
        assert_eq!(info.gas_used, 0);
        assert!(info.effective_gas_price.is_empty());
        assert!(info.contract_address.is_empty());
    }
}
