//! # Ingestion Pipeline
//!
//! Six stages connected by bounded channels:
//! reader → block-fetcher pool → filter → enricher pool → evaluator, with
//! the tracker reconciling the filter's per-block counts against the
//! enrichers' acks into a durable checkpoint. Bounded channels are the only
//! backpressure mechanism; a slow stage stalls its upstream all the way to
//! the reader. A single cancellation token fans out to every stage, and a
//! cancelled run is a clean shutdown, not an error.

pub mod block_fetcher;
pub mod enricher;
pub mod evaluator;
pub mod filter;
pub mod reader;
pub mod tracker;

use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blockchain::ChainClient;
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::decoder::Decoder;
use crate::errors::PipelineError;

use block_fetcher::FetchPolicy;
use enricher::EnricherConfig;
use reader::ReaderConfig;

/// A worker-pool input: one receiver shared by N workers.
pub type SharedRx<T> = Arc<Mutex<mpsc::Receiver<T>>>;

fn shared<T>(rx: mpsc::Receiver<T>) -> SharedRx<T> {
    Arc::new(Mutex::new(rx))
}

/// Runs the full pipeline until cancellation or the first stage failure.
pub async fn run_pipeline(
    cfg: Arc<Config>,
    client: Arc<dyn ChainClient>,
    decoder: Arc<Decoder>,
    store: Arc<CheckpointStore>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let factory: Address = cfg
        .factory_address
        .parse()
        .expect("factory_address validated at config load");
    let queue_size = cfg.performance.queue_size;

    let (block_num_tx, block_num_rx) = mpsc::channel::<u64>(queue_size);
    let (tx_item_tx, tx_item_rx) = mpsc::channel(queue_size);
    let (filtered_tx, filtered_rx) = mpsc::channel(queue_size);
    let (enriched_tx, enriched_rx) = mpsc::channel(queue_size);
    let (block_filtered_tx, block_filtered_rx) = mpsc::channel(queue_size);
    let (ack_tx, ack_rx) = mpsc::channel(queue_size);

    let checkpoint_last = store.last();
    info!(target: "pipeline", checkpoint = checkpoint_last, queue_size, "pipeline starting");

    let mut stages: JoinSet<Result<(), PipelineError>> = JoinSet::new();

    stages.spawn(reader::run_reader(
        cancel.child_token(),
        client.clone(),
        ReaderConfig {
            start_block: cfg.start_block().expect("start_block validated at config load"),
            confirmations: cfg.ingestion.confirmations,
            reorg_replay_depth: cfg.ingestion.reorg_replay_depth,
            poll_interval: cfg.ingestion.poll_interval.get(),
            ws_url: cfg.rpc.ws.clone(),
        },
        checkpoint_last,
        block_num_tx,
    ));

    stages.spawn(block_fetcher::run_block_fetchers(
        cancel.child_token(),
        client.clone(),
        cfg.performance.block_fetch_concurrency,
        FetchPolicy {
            retry_max: cfg.performance.retry_max,
            retry_backoff: cfg.performance.retry_backoff.get(),
        },
        shared(block_num_rx),
        tx_item_tx,
    ));

    stages.spawn(filter::run_filter(
        cancel.child_token(),
        factory,
        tx_item_rx,
        filtered_tx,
        block_filtered_tx,
    ));

    stages.spawn(enricher::run_enrichers(
        cancel.child_token(),
        client.clone(),
        decoder,
        EnricherConfig {
            chain: cfg.chain.clone(),
            chain_id: cfg.chain_id,
            decode_input: cfg.decoding.decode_input,
            decode_logs: cfg.decoding.decode_logs,
            retry_max: cfg.performance.retry_max,
            retry_backoff: cfg.performance.retry_backoff.get(),
        },
        cfg.performance.receipt_fetch_concurrency,
        shared(filtered_rx),
        enriched_tx,
        ack_tx,
    ));

    stages.spawn(evaluator::run_evaluator(
        cancel.child_token(),
        cfg.output.jsonl_path.clone(),
        enriched_rx,
    ));

    stages.spawn(tracker::run_tracker(
        cancel.child_token(),
        store,
        block_filtered_rx,
        ack_rx,
    ));

    let mut first_err: Option<PipelineError> = None;
    while let Some(joined) = stages.join_next().await {
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
        None => {
            info!(target: "pipeline", "pipeline stopped");
            Ok(())
        }
    }
}
