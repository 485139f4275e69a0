use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use thiserror::Error;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationController;
use crate::integrity::{self, IntegrityError};
use crate::models::{
    ByteRange, CancelReason, DownloadOutcome, DownloadState, ProgressSnapshot, RemoteHeaders,
    VerificationResult,
};
use crate::monitor::{ByteCounter, StallMonitor};
use crate::planner;
use crate::progress::{PercentBasis, ProgressReporter};
use crate::streamer::{ContentStreamer, StreamError, StreamTick, Streamed, DEFAULT_BLOCK_SIZE};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Custom errors for download operations.
///
/// Any of these is the `Failed` outcome of a download. Cancellation is not an
/// error, see [`DownloadOutcome::Cancelled`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("integrity check could not run: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
}

impl DownloadError {
    /// Whether the failed chunk may be re-issued.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_transient())
    }
}

impl From<StreamError> for DownloadError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Source(err) => Self::Transport(err),
            StreamError::Sink(err) => Self::Io(err),
        }
    }
}

/// Options for a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Number of ranges the file is split into when the server accepts ranges.
    pub chunk_count: usize,
    /// Delay before a failed chunk is requested again.
    pub retry_backoff: Duration,
    /// A transfer that writes nothing for this long is cancelled.
    pub stall_timeout: Duration,
    /// Progress is reported every `progress_cadence` blocks and at the end of each stream.
    pub progress_cadence: u32,
    pub block_size: usize,
    pub percent_basis: PercentBasis,
    /// Connect and probe timeout for [`HttpTransport`].
    pub request_timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_count: 100,
            retry_backoff: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(5),
            progress_cadence: 10,
            block_size: DEFAULT_BLOCK_SIZE,
            percent_basis: PercentBasis::Chunk,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloadOptions {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.chunk_count == 0 {
            return Err(DownloadError::InvalidOptions("chunk_count must be greater than 0"));
        }
        if self.progress_cadence == 0 {
            return Err(DownloadError::InvalidOptions("progress_cadence must be greater than 0"));
        }
        if self.block_size == 0 {
            return Err(DownloadError::InvalidOptions("block_size must be greater than 0"));
        }
        if self.stall_timeout.is_zero() {
            return Err(DownloadError::InvalidOptions("stall_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Downloads one remote file at a time into a local path.
///
/// The cancellation signal belongs to the downloader, not to a single call:
/// once [`cancel`](Self::cancel) ran, or a transfer stalled, every later
/// `download` returns `Cancelled` right away. Build a new downloader to start
/// over.
#[derive(Debug)]
pub struct Downloader<T = HttpTransport> {
    transport: T,
    options: DownloadOptions,
    cancel: CancellationController,
    stalled: Arc<AtomicBool>,
    state: Mutex<DownloadState>,
    transferred: AtomicU64,
    // Serialises `download` calls; a session owns the destination for its lifetime.
    session: Mutex<()>,
}

/// How a transfer loop ended when it did not fail.
enum Transfer {
    Done,
    Cancelled,
}

/// One stream into the destination: a chunk, or the whole file.
#[derive(Debug, Clone, Copy)]
struct Attempt {
    range: Option<ByteRange>,
    /// Bytes already committed before this stream.
    offset: u64,
    expected_len: Option<u64>,
    file_size: Option<u64>,
}

impl Downloader<HttpTransport> {
    /// Create a downloader over HTTP with the provided options.
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        let transport = HttpTransport::new(options.request_timeout)?;
        Ok(Self::with_transport(transport, options))
    }
}

impl<T: Transport> Downloader<T> {
    pub fn with_transport(transport: T, options: DownloadOptions) -> Self {
        Self {
            transport,
            options,
            cancel: CancellationController::new(),
            stalled: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(DownloadState::Idle),
            transferred: AtomicU64::new(0),
            session: Mutex::new(()),
        }
    }

    /// Request cancellation. Safe to call from any task, at any time.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.cancel.request_cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get the current state of the download.
    pub async fn state(&self) -> DownloadState {
        *self.state.lock().await
    }

    /// Bytes of the current (or last) download that reached the destination.
    /// A chunk in flight is not included until its stream has drained.
    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Fetch `url` into `destination`, replacing whatever is there.
    ///
    /// `on_progress` receives zero or more snapshots before the call returns.
    /// The result is the single terminal outcome: `Ok(Completed)`,
    /// `Ok(Cancelled)`, or `Err` for a failure.
    #[instrument(skip_all, fields(url = %url, destination = %destination.display()))]
    pub async fn download<F>(
        &self,
        url: &str,
        destination: &Path,
        mut on_progress: F,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        self.options.validate()?;
        validate_url(url)?;

        let _session = self.session.lock().await;
        self.transferred.store(0, Ordering::SeqCst);
        self.set_state(DownloadState::Idle).await;

        let result = self.run(url, destination, &mut on_progress).await;
        let terminal = match &result {
            Ok(DownloadOutcome::Completed(_)) => DownloadState::Completed,
            Ok(DownloadOutcome::Cancelled(reason)) => {
                info!(?reason, bytes = self.bytes_transferred(), "download cancelled");
                DownloadState::Cancelled
            }
            Err(err) => {
                warn!(error = %err, bytes = self.bytes_transferred(), "download failed");
                DownloadState::Failed
            }
        };
        self.set_state(terminal).await;
        result
    }

    async fn run<F>(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &mut F,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        remove_existing(destination).await?;
        if self.cancel.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled(self.cancel_reason()));
        }

        self.set_state(DownloadState::Probing).await;
        let headers: RemoteHeaders = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(DownloadOutcome::Cancelled(self.cancel_reason())),
            headers = self.transport.fetch_headers(url) => headers?,
        };
        info!(
            total_size = ?headers.total_size,
            supports_ranges = headers.supports_ranges,
            has_digest = headers.expected_digest.is_some(),
            "probed remote headers"
        );

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        File::create(destination).await?;

        let counter = ByteCounter::new();
        let mut reporter = ProgressReporter::new(self.options.progress_cadence);

        let transfer = match (headers.supports_ranges, headers.total_size) {
            (true, Some(total)) => {
                self.set_state(DownloadState::ChunkedTransfer).await;
                self.transfer_chunked(url, destination, total, &counter, &mut reporter, on_progress).await
            }
            _ => {
                self.set_state(DownloadState::WholeTransfer).await;
                self.transfer_whole(url, destination, headers.total_size, &counter, &mut reporter, on_progress).await
            }
        }?;

        if let Transfer::Cancelled = transfer {
            if counter.get() == 0 {
                // Nothing arrived: leave no empty file behind.
                remove_existing(destination).await?;
            }
            return Ok(DownloadOutcome::Cancelled(self.cancel_reason()));
        }

        self.set_state(DownloadState::Verifying).await;
        let verification = integrity::verify(destination, headers.expected_digest.as_ref()).await?;
        match verification {
            VerificationResult::Verified => info!("digest verified"),
            VerificationResult::Mismatched => warn!("digest mismatch, keeping downloaded file"),
            VerificationResult::Skipped => debug!("no digest advertised, verification skipped"),
        }
        Ok(DownloadOutcome::Completed(verification))
    }

    async fn transfer_chunked<F>(
        &self,
        url: &str,
        destination: &Path,
        total: u64,
        counter: &ByteCounter,
        reporter: &mut ProgressReporter,
        on_progress: &mut F,
    ) -> Result<Transfer, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        let ranges = planner::plan(total, self.options.chunk_count);
        debug!(chunks = ranges.len(), total, "planned ranged transfer");

        let mut committed = 0u64;
        for (index, range) in ranges.into_iter().enumerate() {
            let mut attempt = 0u32;
            loop {
                if self.cancel.is_cancelled() {
                    return Ok(Transfer::Cancelled);
                }
                attempt += 1;
                let job = Attempt {
                    range: Some(range),
                    offset: committed,
                    expected_len: Some(range.len()),
                    file_size: Some(total),
                };
                match self.stream_once(url, destination, job, counter, reporter, on_progress).await {
                    Ok(Streamed { cancelled: true, .. }) => return Ok(Transfer::Cancelled),
                    Ok(streamed) => {
                        committed += streamed.bytes;
                        break;
                    }
                    Err(err) if err.is_transient() => {
                        warn!(
                            chunk = index,
                            from = range.from,
                            to = range.to,
                            attempt,
                            error = %err,
                            backoff = ?self.options.retry_backoff,
                            "chunk failed, retrying"
                        );
                        let (basis_total, done) = match self.options.percent_basis {
                            PercentBasis::Chunk => (Some(range.len()), 0),
                            PercentBasis::File => (Some(total), committed),
                        };
                        on_progress(reporter.failed(basis_total, done, committed, err.to_string()));
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Ok(Transfer::Cancelled),
                            _ = tokio::time::sleep(self.options.retry_backoff) => {}
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(Transfer::Done)
    }

    async fn transfer_whole<F>(
        &self,
        url: &str,
        destination: &Path,
        total: Option<u64>,
        counter: &ByteCounter,
        reporter: &mut ProgressReporter,
        on_progress: &mut F,
    ) -> Result<Transfer, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        let job = Attempt { range: None, offset: 0, expected_len: total, file_size: total };
        let streamed = self.stream_once(url, destination, job, counter, reporter, on_progress).await?;
        if streamed.cancelled {
            Ok(Transfer::Cancelled)
        } else {
            Ok(Transfer::Done)
        }
    }

    /// Open the stream for `job` and drain it into the destination, under a
    /// stall monitor that lives exactly as long as this call.
    async fn stream_once<F>(
        &self,
        url: &str,
        destination: &Path,
        job: Attempt,
        counter: &ByteCounter,
        reporter: &mut ProgressReporter,
        on_progress: &mut F,
    ) -> Result<Streamed, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        let mut file = open_at(destination, job.offset).await?;

        let mut monitor = self.start_stall_monitor(counter);
        let result = self.fetch_and_stream(url, &mut file, job, counter, reporter, on_progress).await;
        monitor.stop();

        file.flush().await?;
        drop(file);
        result
    }

    async fn fetch_and_stream<F>(
        &self,
        url: &str,
        file: &mut File,
        job: Attempt,
        counter: &ByteCounter,
        reporter: &mut ProgressReporter,
        on_progress: &mut F,
    ) -> Result<Streamed, DownloadError>
    where
        F: FnMut(ProgressSnapshot) + Send,
    {
        let fetch = async {
            match job.range {
                Some(range) => self.transport.fetch_range(url, range).await,
                None => self.transport.fetch_whole(url).await,
            }
        };
        let source = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Streamed { bytes: 0, cancelled: true }),
            source = fetch => source?,
        };

        let basis = self.options.percent_basis;
        reporter.begin_stream();
        let on_tick = |tick: StreamTick| {
            let so_far = job.offset + tick.written;
            // A chunk can still be truncated away by a retry until it drains.
            let counted = if job.range.is_some() && !tick.end_of_stream { job.offset } else { so_far };
            self.transferred.store(counted, Ordering::SeqCst);
            let (total, done) = match basis {
                PercentBasis::Chunk => (job.expected_len, tick.written),
                PercentBasis::File => (job.file_size, so_far),
            };
            let snapshot = if tick.end_of_stream {
                Some(reporter.finish(total, done, counted))
            } else {
                reporter.report(total, done, counted)
            };
            if let Some(snapshot) = snapshot {
                on_progress(snapshot);
            }
        };

        let streamer = ContentStreamer::new(&self.cancel, counter, self.options.block_size);
        Ok(streamer.stream(source, file, job.expected_len, on_tick).await?)
    }

    fn start_stall_monitor(&self, counter: &ByteCounter) -> StallMonitor {
        let reader = counter.reader();
        let cancel = self.cancel.clone();
        let stalled = self.stalled.clone();
        let timeout = self.options.stall_timeout;
        StallMonitor::start(move || reader.get(), timeout, move || {
            if !cancel.is_cancelled() {
                warn!(?timeout, "no bytes received within stall timeout, cancelling");
                stalled.store(true, Ordering::SeqCst);
            }
            cancel.request_cancel();
        })
    }

    fn cancel_reason(&self) -> CancelReason {
        if self.stalled.load(Ordering::SeqCst) {
            CancelReason::Stalled
        } else {
            CancelReason::Requested
        }
    }

    async fn set_state(&self, next: DownloadState) {
        let mut state = self.state.lock().await;
        debug!(from = ?*state, to = ?next, "state change");
        *state = next;
    }
}

fn validate_url(url: &str) -> Result<(), DownloadError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DownloadError::InvalidUrl(format!("{url}: unsupported scheme {other}"))),
    }
}

async fn remove_existing(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed existing file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Open the destination for appending at `offset`, cutting off anything a
/// failed attempt left past it.
async fn open_at(path: &Path, offset: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if file.metadata().await?.len() != offset {
        file.set_len(offset).await?;
    }
    Ok(file)
}
