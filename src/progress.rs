use serde::{Deserialize, Serialize};

use crate::models::ProgressSnapshot;

/// What the reported percentage is relative to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PercentBasis {
    /// Relative to the chunk currently being streamed. In chunked mode the
    /// percentage restarts from zero at every chunk.
    #[default]
    Chunk,
    /// Cumulative bytes against the whole remote size.
    File,
}

/// Throttles progress callbacks to one per `cadence` blocks.
///
/// The read count restarts with every stream. `bytes_transferred` is passed
/// through as given; the caller only hands in bytes that are already final.
#[derive(Debug)]
pub struct ProgressReporter {
    cadence: u64,
    reads: u64,
}

impl ProgressReporter {
    pub fn new(cadence: u32) -> Self {
        assert!(cadence > 0, "progress cadence must be greater than 0");
        Self { cadence: cadence as u64, reads: 0 }
    }

    /// Reset the read count at the start of a new stream.
    pub fn begin_stream(&mut self) {
        self.reads = 0;
    }

    /// Record one block. Returns a snapshot on every `cadence`-th call.
    ///
    /// `done` is measured against `total_size` for the percentage;
    /// `bytes_transferred` is the session-wide count.
    pub fn report(
        &mut self,
        total_size: Option<u64>,
        done: u64,
        bytes_transferred: u64,
    ) -> Option<ProgressSnapshot> {
        self.reads += 1;
        if self.reads % self.cadence != 0 {
            return None;
        }
        Some(self.snapshot(total_size, done, bytes_transferred))
    }

    /// The end-of-stream report, emitted regardless of the cadence.
    pub fn finish(
        &mut self,
        total_size: Option<u64>,
        done: u64,
        bytes_transferred: u64,
    ) -> ProgressSnapshot {
        self.snapshot(total_size, done, bytes_transferred)
    }

    /// Report a failed attempt that is about to be retried.
    pub fn failed(
        &mut self,
        total_size: Option<u64>,
        done: u64,
        bytes_transferred: u64,
        error: impl Into<String>,
    ) -> ProgressSnapshot {
        ProgressSnapshot { error: Some(error.into()), ..self.snapshot(total_size, done, bytes_transferred) }
    }

    fn snapshot(&self, total_size: Option<u64>, done: u64, bytes_transferred: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_size,
            bytes_transferred,
            percent: total_size.map(|total| percent(done, total)),
            error: None,
        }
    }
}

/// `done / total * 100` rounded to two decimals and clamped to `0..=100`.
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let raw = done as f64 / total as f64 * 100.0;
    ((raw * 100.0).round() / 100.0).clamp(0.0, 100.0)
}
