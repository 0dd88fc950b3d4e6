//! Head tracking and block-number emission.
//!
//! The reader owns two independent head sources: a polling loop against the
//! HTTP provider and a websocket `newHeads` subscription that reconnects
//! with exponential backoff. Both push into a small head channel; the main
//! loop emits every confirmed block number in strictly increasing order,
//! blocking on the downstream channel for backpressure.

use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Middleware, Provider, Ws};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blockchain::ChainClient;
use crate::config::StartBlock;
use crate::errors::PipelineError;
use crate::utils::sleep_cancellable;

const CAUGHT_UP_PAUSE: Duration = Duration::from_millis(200);
const WS_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const WS_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub start_block: StartBlock,
    pub confirmations: u64,
    pub reorg_replay_depth: u64,
    pub poll_interval: Duration,
    pub ws_url: String,
}

/// Computes the first block to emit.
///
/// A non-zero checkpoint wins over the configured start; `latest` resolves
/// against the observed head minus confirmations; the replay depth is then
/// subtracted so a restart re-ingests the most recent blocks (clamped to 0).
pub fn resolve_start_block(
    checkpoint: u64,
    configured: StartBlock,
    head: u64,
    confirmations: u64,
    reorg_replay_depth: u64,
) -> u64 {
    let start = if checkpoint > 0 {
        checkpoint + 1
    } else {
        match configured {
            StartBlock::Number(n) => n,
            StartBlock::Latest => head.saturating_sub(confirmations),
        }
    };
    start.saturating_sub(reorg_replay_depth)
}

pub async fn run_reader(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    cfg: ReaderConfig,
    checkpoint_last: u64,
    out: mpsc::Sender<u64>,
) -> Result<(), PipelineError> {
    let head = client.head_number().await?;
    let start_block = resolve_start_block(
        checkpoint_last,
        cfg.start_block,
        head,
        cfg.confirmations,
        cfg.reorg_replay_depth,
    );
    info!(
        target: "reader",
        head,
        start_block,
        confirmations = cfg.confirmations,
        reorg_replay_depth = cfg.reorg_replay_depth,
        "reader start"
    );

    let (head_tx, mut head_rx) = mpsc::channel::<u64>(4);
    tokio::spawn(poll_heads(
        cancel.child_token(),
        client.clone(),
        cfg.poll_interval,
        head_tx.clone(),
    ));
    tokio::spawn(subscribe_heads(
        cancel.child_token(),
        cfg.ws_url.clone(),
        head_tx,
    ));

    let mut next_block = start_block;
    let mut current_head = head;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        while let Ok(h) = head_rx.try_recv() {
            if h > current_head {
                current_head = h;
            }
        }

        let ready = current_head.saturating_sub(cfg.confirmations);
        while next_block <= ready {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = out.send(next_block) => {
                    sent.map_err(|_| PipelineError::ChannelClosed("reader -> block fetchers"))?;
                    next_block += 1;
                }
            }
        }

        if !sleep_cancellable(&cancel, CAUGHT_UP_PAUSE).await {
            return Ok(());
        }
    }
}

async fn poll_heads(
    cancel: CancellationToken,
    client: Arc<dyn ChainClient>,
    interval: Duration,
    out: mpsc::Sender<u64>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match client.head_number().await {
            Ok(head) => {
                let _ = out.try_send(head);
            }
            Err(e) => warn!(target: "reader", error = %e, "poll head failed"),
        }
    }
}

/// Subscribes to `newHeads` over websocket, pushing head numbers into the
/// reader. Reconnects forever with exponential backoff; never fatal.
async fn subscribe_heads(cancel: CancellationToken, ws_url: String, out: mpsc::Sender<u64>) {
    let mut backoff = WS_BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let provider = match Provider::<Ws>::connect(&ws_url).await {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "reader", error = %e, "ws dial failed");
                if !sleep_cancellable(&cancel, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(WS_BACKOFF_MAX);
                continue;
            }
        };
        let mut stream = match provider.subscribe_blocks().await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "reader", error = %e, "ws subscribe failed");
                if !sleep_cancellable(&cancel, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(WS_BACKOFF_MAX);
                continue;
            }
        };
        info!(target: "reader", "ws subscribed to newHeads");
        backoff = WS_BACKOFF_INITIAL;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                header = stream.next() => match header {
                    Some(h) => {
                        if let Some(number) = h.number {
                            let _ = out.try_send(number.as_u64());
                        }
                    }
                    None => {
                        warn!(target: "reader", "ws subscription ended, reconnecting");
                        break;
                    }
                }
            }
        }
        if !sleep_cancellable(&cancel, backoff).await {
            return;
        }
        backoff = (backoff * 2).min(WS_BACKOFF_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_wins_over_configured_start() {
        // replay depth pulls the start below the checkpoint
        assert_eq!(
            resolve_start_block(100, StartBlock::Number(5), 500, 2, 5),
            96
        );
        assert_eq!(
            resolve_start_block(100, StartBlock::Latest, 500, 2, 0),
            101
        );
    }

    #[test]
    fn latest_resolves_against_head_minus_confirmations() {
        assert_eq!(resolve_start_block(0, StartBlock::Latest, 500, 2, 0), 498);
        assert_eq!(resolve_start_block(0, StartBlock::Latest, 500, 2, 5), 493);
        // head below confirmations clamps to zero
        assert_eq!(resolve_start_block(0, StartBlock::Latest, 1, 2, 0), 0);
    }

    #[test]
    fn numeric_start_applies_replay_depth_clamped() {
        assert_eq!(resolve_start_block(0, StartBlock::Number(50), 500, 2, 5), 45);
        assert_eq!(resolve_start_block(0, StartBlock::Number(3), 500, 2, 5), 0);
    }
}
