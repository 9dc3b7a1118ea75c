//! Record loop for the stage runner
//!
//! Reads one JSON record per line, drives it through a stage with bounded
//! concurrency and writes every record a stage hands back as a JSON line.
//! Output keeps input order even though records are processed concurrently.

use anyhow::Context;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, warn};
use transform_stage::{CompletionSignal, LineCollaborator, Record, Stage};

/// Counts reported when the input is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records handed to the stage
    pub records: u64,
    pub accepted: u64,
    /// Accepted records that carried a result, written to the output
    pub emitted: u64,
    pub rejected: u64,
    /// Lines that were not a valid record
    pub malformed: u64,
}

enum Outcome {
    Blank,
    Malformed(String),
    Processed(CompletionSignal),
}

/// Process every line of `input` through `stage`.
///
/// Rejections and malformed lines are logged and counted, never fatal. Only a
/// failure to read the input or write the output stops the run.
pub async fn run<R, W>(
    stage: Arc<dyn Stage>,
    input: R,
    output: &LineCollaborator<W>,
    concurrency: usize,
) -> anyhow::Result<RunSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let lines = stream::unfold(Some(input.lines()), |state| async move {
        let mut lines = state?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    });

    let mut outcomes = lines
        .map(|line| {
            let stage = stage.clone();
            async move {
                match line {
                    Ok(line) => Ok(process_line(stage.as_ref(), &line).await),
                    Err(e) => Err(e),
                }
            }
        })
        .buffered(concurrency.max(1));
    futures::pin_mut!(outcomes);

    let mut summary = RunSummary::default();
    let mut line_number = 0u64;
    while let Some(outcome) = outcomes.next().await {
        line_number += 1;
        match outcome.context("Failed to read input")? {
            Outcome::Blank => {}
            Outcome::Malformed(reason) => {
                summary.malformed += 1;
                warn!("Skipping line {}: {}", line_number, reason);
            }
            Outcome::Processed(signal) => {
                summary.records += 1;
                match signal {
                    CompletionSignal::Accepted => summary.accepted += 1,
                    CompletionSignal::AcceptedWith(record) => {
                        summary.accepted += 1;
                        summary.emitted += 1;
                        output
                            .write_record(&record)
                            .await
                            .context("Failed to write result")?;
                    }
                    CompletionSignal::Rejected(err) => {
                        summary.rejected += 1;
                        debug!("Line {} rejected ({}): {}", line_number, err.kind(), err);
                    }
                }
            }
        }
    }

    Ok(summary)
}

async fn process_line(stage: &dyn Stage, line: &str) -> Outcome {
    if line.trim().is_empty() {
        return Outcome::Blank;
    }
    match serde_json::from_str::<Record>(line) {
        Ok(record) => Outcome::Processed(stage.process(record).await),
        Err(e) => Outcome::Malformed(e.to_string()),
    }
}
