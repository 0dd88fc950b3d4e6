//! Output sink.
//!
//! Serialises each enriched record as one JSON line to an append-only file
//! (or stdout when the configured path is `"-"`). Writes happen in
//! consumption order; a failed write is logged and the record is still
//! treated as emitted; the pipeline never blocks on the sink.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::PipelineError;
use crate::metrics;
use crate::types::EnrichedTx;

enum Sink {
    Stdout(tokio::io::Stdout),
    File(tokio::fs::File),
}

impl Sink {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Stdout(out) => {
                out.write_all(line).await?;
                out.write_all(b"\n").await?;
                out.flush().await
            }
            Sink::File(f) => {
                f.write_all(line).await?;
                f.write_all(b"\n").await?;
                f.flush().await
            }
        }
    }
}

async fn open_sink(path: &str) -> Result<Sink, PipelineError> {
    if path == "-" {
        return Ok(Sink::Stdout(tokio::io::stdout()));
    }
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| PipelineError::Output(format!("create {}: {e}", dir.display())))?;
        }
    }
    let file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .map_err(|e| PipelineError::Output(format!("open {path}: {e}")))?;
    Ok(Sink::File(file))
}

pub async fn run_evaluator(
    cancel: CancellationToken,
    jsonl_path: String,
    mut input: mpsc::Receiver<EnrichedTx>,
) -> Result<(), PipelineError> {
    let mut sink = open_sink(&jsonl_path).await?;
    info!(target: "evaluator", path = %jsonl_path, "output sink open");

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = input.recv() => match received {
                Some(item) => item,
                None => return Ok(()),
            }
        };
        let line = match serde_json::to_vec(&item) {
            Ok(line) => line,
            Err(e) => {
                error!(target: "evaluator", tx = %item.tx_hash, error = %e, "output encode failed");
                continue;
            }
        };
        if let Err(e) = sink.write_line(&line).await {
            error!(target: "evaluator", tx = %item.tx_hash, error = %e, "output write failed");
        }
        metrics::OUTPUT_LINES.inc();
    }
}
