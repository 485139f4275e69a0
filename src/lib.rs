//! Resumable, integrity-checked file downloads.
//!
//! A [`Downloader`](downloader::Downloader) probes the remote resource, fetches
//! it in ranged chunks when the server allows it (whole otherwise), retries
//! chunks that fail on a flaky connection, cancels transfers that stall, and
//! checks the finished file against the digest the server advertised.

pub mod cancel;
pub mod downloader;
pub mod integrity;
pub mod models;
pub mod monitor;
pub mod planner;
pub mod progress;
pub mod streamer;
pub mod transport;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::downloader::{DownloadError, DownloadOptions, Downloader};
    pub use crate::models::{
        ByteRange, CancelReason, DownloadOutcome, DownloadState, ExpectedDigest, ProgressSnapshot,
        RemoteHeaders, VerificationResult,
    };
    pub use crate::progress::PercentBasis;
    pub use crate::transport::{ByteStream, HttpTransport, Transport, TransportError, TransportErrorKind};
}
