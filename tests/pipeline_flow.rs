//! End-to-end reconciliation tests: filter and tracker stages wired over
//! real channels with a durable checkpoint on disk.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, H256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use factoryscope::checkpoint::CheckpointStore;
use factoryscope::config::StartBlock;
use factoryscope::ingest::filter::run_filter;
use factoryscope::ingest::reader::resolve_start_block;
use factoryscope::ingest::tracker::run_tracker;
use factoryscope::types::{BlockFiltered, RawTx, TxItem};

const FACTORY: &str = "0x00000000000000000000000000000000000000fa";

fn factory() -> Address {
    FACTORY.parse().unwrap()
}

fn tx_item(block: u64, to: &str, hash: &str) -> TxItem {
    TxItem {
        block_number: block,
        block_hash: H256::repeat_byte(block as u8),
        block_timestamp: 1_700_000_000 + block,
        tx: Some(RawTx {
            hash: hash.to_string(),
            to: to.to_string(),
            ..Default::default()
        }),
        end: false,
    }
}

fn end_item(block: u64) -> TxItem {
    TxItem {
        block_number: block,
        block_hash: H256::repeat_byte(block as u8),
        block_timestamp: 1_700_000_000 + block,
        tx: None,
        end: true,
    }
}

async fn wait_for_checkpoint(store: &CheckpointStore, want: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.last() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("checkpoint never reached {want}, at {}", store.last()));
}

#[tokio::test]
async fn empty_block_advances_checkpoint_without_acks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path().join("checkpoint.json")));
    let cancel = CancellationToken::new();

    let (item_tx, item_rx) = mpsc::channel(64);
    let (filtered_tx, mut filtered_rx) = mpsc::channel(64);
    let (bf_tx, bf_rx) = mpsc::channel(64);
    let (_ack_tx, ack_rx) = mpsc::channel::<u64>(64);

    let filter = tokio::spawn(run_filter(
        cancel.child_token(),
        factory(),
        item_rx,
        filtered_tx,
        bf_tx,
    ));
    let tracker = tokio::spawn(run_tracker(cancel.child_token(), store.clone(), bf_rx, ack_rx));

    // block 1 contains only a non-matching tx
    item_tx.send(tx_item(1, "0x1111111111111111111111111111111111111111", "0xa")).await.unwrap();
    item_tx.send(end_item(1)).await.unwrap();

    wait_for_checkpoint(&store, 1).await;
    assert!(filtered_rx.try_recv().is_err());

    cancel.cancel();
    filter.await.unwrap().unwrap();
    tracker.await.unwrap().unwrap();
}

#[tokio::test]
async fn out_of_order_acks_advance_in_block_order() {
    // S6: three acks for block 10 interleaved with block 11 traffic
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path().join("checkpoint.json")));
    store.save(9).unwrap();
    let cancel = CancellationToken::new();

    let (bf_tx, bf_rx) = mpsc::channel(64);
    let (ack_tx, ack_rx) = mpsc::channel(64);
    let tracker = tokio::spawn(run_tracker(cancel.child_token(), store.clone(), bf_rx, ack_rx));

    bf_tx.send(BlockFiltered { block_number: 10, filtered_count: 3 }).await.unwrap();
    bf_tx.send(BlockFiltered { block_number: 11, filtered_count: 1 }).await.unwrap();

    ack_tx.send(11).await.unwrap();
    ack_tx.send(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.last(), 9, "no advance before block 10 completes");

    ack_tx.send(10).await.unwrap();
    ack_tx.send(10).await.unwrap();
    wait_for_checkpoint(&store, 11).await;

    cancel.cancel();
    tracker.await.unwrap().unwrap();
}

#[tokio::test]
async fn filter_to_tracker_full_flow_checkpoints_contiguously() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    let store = Arc::new(CheckpointStore::new(&path));
    let cancel = CancellationToken::new();

    let (item_tx, item_rx) = mpsc::channel(256);
    let (filtered_tx, mut filtered_rx) = mpsc::channel(256);
    let (bf_tx, bf_rx) = mpsc::channel(256);
    let (ack_tx, ack_rx) = mpsc::channel(256);

    let filter = tokio::spawn(run_filter(
        cancel.child_token(),
        factory(),
        item_rx,
        filtered_tx,
        bf_tx,
    ));
    let tracker = tokio::spawn(run_tracker(cancel.child_token(), store.clone(), bf_rx, ack_rx));

    // a stand-in enricher: ack every forwarded tx
    let ack_pump = tokio::spawn(async move {
        while let Some(item) = filtered_rx.recv().await {
            ack_tx.send(item.block_number).await.unwrap();
        }
    });

    // blocks 1..=5, each with one matching tx, one miss, fetched out of order
    for block in [3u64, 1, 5, 2, 4] {
        item_tx
            .send(tx_item(block, FACTORY, &format!("0x{block:x}1")))
            .await
            .unwrap();
        item_tx
            .send(tx_item(block, "0x9999999999999999999999999999999999999999", &format!("0x{block:x}2")))
            .await
            .unwrap();
        item_tx.send(end_item(block)).await.unwrap();
    }

    wait_for_checkpoint(&store, 5).await;

    let reloaded = CheckpointStore::new(&path);
    assert_eq!(reloaded.load().unwrap(), 5);

    cancel.cancel();
    filter.await.unwrap().unwrap();
    tracker.await.unwrap().unwrap();
    drop(item_tx);
    ack_pump.await.unwrap();
}

#[tokio::test]
async fn replayed_blocks_never_regress_the_checkpoint() {
    // S5: restart with checkpoint 100 and replay depth 5 re-emits 96..100;
    // the tracker ignores anything at or below its committed block
    assert_eq!(resolve_start_block(100, StartBlock::Latest, 500, 2, 5), 96);

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::new(dir.path().join("checkpoint.json")));
    store.save(100).unwrap();
    let cancel = CancellationToken::new();

    let (bf_tx, bf_rx) = mpsc::channel(64);
    let (ack_tx, ack_rx) = mpsc::channel(64);
    let tracker = tokio::spawn(run_tracker(cancel.child_token(), store.clone(), bf_rx, ack_rx));

    // replayed prefix arrives first
    for block in 96u64..=100 {
        bf_tx.send(BlockFiltered { block_number: block, filtered_count: 1 }).await.unwrap();
        ack_tx.send(block).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.last(), 100, "replay must not move the checkpoint");

    // then fresh blocks advance normally
    bf_tx.send(BlockFiltered { block_number: 101, filtered_count: 0 }).await.unwrap();
    wait_for_checkpoint(&store, 101).await;

    cancel.cancel();
    tracker.await.unwrap().unwrap();
}
