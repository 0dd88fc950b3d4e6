//! Checkpoint tracker.
//!
//! Reconciles two unordered streams, the filter's per-block expected
//! counts and the enrichers' per-transaction acks, into a strictly
//! monotonic durable checkpoint. A block is complete when
//! `expected > 0 && done >= expected`, or immediately when `expected == 0`
//! arrives with no acks outstanding; the two signals may arrive in either
//! order. Completion is then drained contiguously from `last + 1`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checkpoint::CheckpointStore;
use crate::errors::PipelineError;
use crate::metrics;
use crate::types::BlockFiltered;

#[derive(Debug, Default, Clone, Copy)]
struct BlockState {
    expected: usize,
    done: usize,
}

/// The tracker's reconciliation state, factored out of the channel loop so
/// its transitions can be exercised directly.
#[derive(Debug)]
pub struct TrackerState {
    last: u64,
    next: u64,
    states: HashMap<u64, BlockState>,
    completed: HashSet<u64>,
}

impl TrackerState {
    pub fn new(last: u64) -> Self {
        Self {
            last,
            next: last + 1,
            states: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn on_filtered(&mut self, block: u64, expected: usize) {
        if block <= self.last {
            return;
        }
        let state = self.states.entry(block).or_default();
        state.expected = expected;
        // Acks may have raced ahead of the count publish; evaluate the full
        // completion predicate here as well so arrival order never matters.
        let complete = (state.expected == 0 && state.done == 0)
            || (state.expected > 0 && state.done >= state.expected);
        if complete {
            self.states.remove(&block);
            self.completed.insert(block);
        }
    }

    pub fn on_ack(&mut self, block: u64) {
        if block <= self.last {
            return;
        }
        let state = self.states.entry(block).or_default();
        state.done += 1;
        if state.expected > 0 && state.done >= state.expected {
            self.states.remove(&block);
            self.completed.insert(block);
        }
    }

    /// Drains contiguous completion starting at `last + 1`, invoking
    /// `persist` for each advanced block. A persist failure stops the drain
    /// for this tick; the block stays completed and is retried on the next
    /// input.
    pub fn drain<F>(&mut self, mut persist: F)
    where
        F: FnMut(u64) -> bool,
    {
        while self.completed.contains(&self.next) {
            if !persist(self.next) {
                break;
            }
            self.completed.remove(&self.next);
            self.last = self.next;
            self.next += 1;
        }
    }
}

pub async fn run_tracker(
    cancel: CancellationToken,
    store: Arc<CheckpointStore>,
    mut filtered: mpsc::Receiver<BlockFiltered>,
    mut acks: mpsc::Receiver<u64>,
) -> Result<(), PipelineError> {
    let mut state = TrackerState::new(store.last());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = filtered.recv() => match received {
                Some(f) => state.on_filtered(f.block_number, f.filtered_count),
                None => return Ok(()),
            },
            received = acks.recv() => match received {
                Some(block) => state.on_ack(block),
                None => return Ok(()),
            },
        }

        state.drain(|block| match store.save(block) {
            Ok(()) => {
                info!(target: "tracker", block, "checkpoint advanced");
                metrics::CHECKPOINT_BLOCK.set(block as i64);
                true
            }
            Err(e) => {
                error!(target: "tracker", block, error = %e, "checkpoint save failed");
                false
            }
        });
    }
}
