// src/models.rs

use serde::{Deserialize, Serialize};

/// A half-open byte range `[from, to)` of the remote content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub from: u64,
    /// Exclusive upper bound.
    pub to: u64,
}

impl ByteRange {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "range start {from} past end {to}");
        Self { from, to }
    }

    /// Number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

/// What the server told us about the resource before the transfer starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHeaders {
    pub total_size: Option<u64>,
    pub supports_ranges: bool,
    pub expected_digest: Option<ExpectedDigest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

/// A digest advertised by the server for the complete resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub bytes: Vec<u8>,
}

impl ExpectedDigest {
    pub fn md5(bytes: impl Into<Vec<u8>>) -> Self {
        Self { algorithm: DigestAlgorithm::Md5, bytes: bytes.into() }
    }

    pub fn sha256(bytes: impl Into<Vec<u8>>) -> Self {
        Self { algorithm: DigestAlgorithm::Sha256, bytes: bytes.into() }
    }
}

/// Progress information handed to the caller's callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Size the percentage is computed against, if known.
    pub total_size: Option<u64>,
    /// Bytes in the destination that no retry can discard. A chunk counts
    /// once its stream has fully drained. Never decreases within a session.
    pub bytes_transferred: u64,
    /// Rounded to two decimals, always within `0.0..=100.0`.
    pub percent: Option<f64>,
    /// Set on the report sent when a chunk fails and is about to be retried.
    pub error: Option<String>,
}

/// Lifecycle of a single `download` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Probing,
    ChunkedTransfer,
    WholeTransfer,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationResult {
    Verified,
    Mismatched,
    /// The server supplied no digest to compare against.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// `Downloader::cancel` was called.
    Requested,
    /// No bytes arrived within the stall timeout.
    Stalled,
}

/// Terminal outcome of a download that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadOutcome {
    Completed(VerificationResult),
    Cancelled(CancelReason),
}
