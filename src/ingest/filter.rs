//! Factory-address filter.
//!
//! Single-consumer stage. Forwards only transactions whose `to` equals the
//! configured factory address (case-insensitive hex compare) and counts
//! them per block; the END marker flushes the count to the tracker (even
//! when it is zero) after every forwarded transaction for that block has
//! been enqueued.

use std::collections::HashMap;

use ethers::types::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::PipelineError;
use crate::metrics;
use crate::types::{BlockFiltered, FilteredTx, TxItem};

pub async fn run_filter(
    cancel: CancellationToken,
    factory: Address,
    mut input: mpsc::Receiver<TxItem>,
    out: mpsc::Sender<FilteredTx>,
    block_filtered: mpsc::Sender<BlockFiltered>,
) -> Result<(), PipelineError> {
    let mut counts: HashMap<u64, usize> = HashMap::new();

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = input.recv() => match received {
                Some(item) => item,
                None => return Ok(()),
            }
        };

        if item.end {
            let count = counts.remove(&item.block_number).unwrap_or(0);
            debug!(target: "filter", block = item.block_number, count, "block complete");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = block_filtered.send(BlockFiltered {
                    block_number: item.block_number,
                    filtered_count: count,
                }) => {
                    sent.map_err(|_| PipelineError::ChannelClosed("filter -> tracker"))?;
                }
            }
            continue;
        }

        let tx = match item.tx {
            Some(tx) => tx,
            None => continue,
        };
        if !matches_factory(&tx.to, factory) {
            continue;
        }

        *counts.entry(item.block_number).or_insert(0) += 1;
        metrics::TXS_FILTERED.inc();
        let filtered = FilteredTx {
            block_number: item.block_number,
            block_hash: item.block_hash,
            block_timestamp: item.block_timestamp,
            tx,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = out.send(filtered) => {
                sent.map_err(|_| PipelineError::ChannelClosed("filter -> enrichers"))?;
            }
        }
    }
}

fn matches_factory(to: &str, factory: Address) -> bool {
    let to = to.trim();
    if to.is_empty() {
        return false;
    }
    matches!(to.parse::<Address>(), Ok(addr) if addr == factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawTx;
    use ethers::types::H256;
    use tokio_util::sync::CancellationToken;

    const FACTORY: &str = "0x00000000000000000000000000000000000000fa";

    fn item(block: u64, to: &str) -> TxItem {
        TxItem {
            block_number: block,
            block_hash: H256::zero(),
            block_timestamp: 0,
            tx: Some(RawTx {
                hash: format!("0x{block:x}"),
                to: to.to_string(),
                ..Default::default()
            }),
            end: false,
        }
    }

    fn end(block: u64) -> TxItem {
        TxItem {
            block_number: block,
            block_hash: H256::zero(),
            block_timestamp: 0,
            tx: None,
            end: true,
        }
    }

    #[test]
    fn address_match_is_case_insensitive() {
        let factory: Address = FACTORY.parse().unwrap();
        assert!(matches_factory(FACTORY, factory));
        assert!(matches_factory(&FACTORY.to_uppercase().replace("0X", "0x"), factory));
        assert!(!matches_factory("0x00000000000000000000000000000000000000fb", factory));
        assert!(!matches_factory("", factory));
        assert!(!matches_factory("not-an-address", factory));
    }

    #[tokio::test]
    async fn counts_per_block_and_flushes_on_end() {
        let factory: Address = FACTORY.parse().unwrap();
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (bf_tx, mut bf_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_filter(cancel.clone(), factory, in_rx, out_tx, bf_tx));

        // block 5: two matches and one miss; block 6: empty
        in_tx.send(item(5, FACTORY)).await.unwrap();
        in_tx.send(item(5, "0x1111111111111111111111111111111111111111")).await.unwrap();
        in_tx.send(item(5, &FACTORY.to_uppercase().replace("0X", "0x"))).await.unwrap();
        in_tx.send(end(5)).await.unwrap();
        in_tx.send(end(6)).await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap().block_number, 5);
        assert_eq!(out_rx.recv().await.unwrap().block_number, 5);
        let b5 = bf_rx.recv().await.unwrap();
        assert_eq!((b5.block_number, b5.filtered_count), (5, 2));
        let b6 = bf_rx.recv().await.unwrap();
        assert_eq!((b6.block_number, b6.filtered_count), (6, 0));

        drop(in_tx);
        handle.await.unwrap().unwrap();
    }
}
