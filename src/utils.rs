//! Small shared helpers: retry with exponential backoff and
//! cancellation-aware sleeping.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::BlockchainError;

/// Runs `op` up to `max + 1` times, doubling the delay after each failure
/// (`backoff`, `backoff*2`, `backoff*4`, …). Returns the last error when all
/// attempts fail, or `Cancelled` as soon as the token fires.
pub async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    max: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, BlockchainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BlockchainError>>,
{
    let mut last_err = BlockchainError::Cancelled;
    for attempt in 0..=max {
        if cancel.is_cancelled() {
            return Err(BlockchainError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => last_err = e,
        }
        if attempt == max {
            break;
        }
        let wait = backoff.saturating_mul(1u32 << attempt.min(16));
        if !sleep_cancellable(cancel, wait).await {
            return Err(BlockchainError::Cancelled);
        }
    }
    Err(last_err)
}

/// Sleeps for `dur` unless the token fires first. Returns false on cancel.
pub async fn sleep_cancellable(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}
