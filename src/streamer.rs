use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cancel::CancellationController;
use crate::monitor::ByteCounter;
use crate::transport::{ByteStream, TransportError, TransportErrorKind};

pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Reading from the transport failed.
    #[error("source failed: {0}")]
    Source(#[from] TransportError),
    /// Writing to the destination failed.
    #[error("write failed: {0}")]
    Sink(#[from] std::io::Error),
}

/// Passed to the `on_bytes` callback after every block and once at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTick {
    /// Bytes appended since the previous tick.
    pub delta: u64,
    /// Bytes appended by this stream so far.
    pub written: u64,
    pub expected_len: Option<u64>,
    pub end_of_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Streamed {
    pub bytes: u64,
    /// The stream was abandoned because cancellation was requested.
    pub cancelled: bool,
}

/// Copies a transport stream into the destination block by block.
///
/// Each block is written before it is counted, so the byte counter never runs
/// ahead of the file.
#[derive(Debug)]
pub struct ContentStreamer<'a> {
    cancel: &'a CancellationController,
    counter: &'a ByteCounter,
    block_size: usize,
}

impl<'a> ContentStreamer<'a> {
    pub fn new(cancel: &'a CancellationController, counter: &'a ByteCounter, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be greater than 0");
        Self { cancel, counter, block_size }
    }

    /// Drain `source` into `destination`.
    ///
    /// Returns early with `cancelled: true` when the signal is set; a read that
    /// is still waiting on the network is abandoned at that point. A stream
    /// that ends before `expected_len` bytes is reported as an interrupted
    /// source.
    pub async fn stream<W, F>(
        &self,
        mut source: ByteStream,
        destination: &mut W,
        expected_len: Option<u64>,
        mut on_bytes: F,
    ) -> Result<Streamed, StreamError>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(StreamTick),
    {
        let mut pending = Bytes::new();
        let mut written = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                destination.flush().await?;
                return Ok(Streamed { bytes: written, cancelled: true });
            }

            if pending.is_empty() {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    next = source.next() => Some(next),
                };
                match next {
                    None => continue,
                    Some(Some(Ok(frame))) => pending = frame,
                    Some(Some(Err(err))) => {
                        destination.flush().await?;
                        return Err(err.into());
                    }
                    Some(None) => break,
                }
                if pending.is_empty() {
                    continue;
                }
            }

            let block = pending.split_to(pending.len().min(self.block_size));
            destination.write_all(&block).await?;

            let delta = block.len() as u64;
            written += delta;
            self.counter.add(delta);
            on_bytes(StreamTick { delta, written, expected_len, end_of_stream: false });
        }

        destination.flush().await?;

        if let Some(expected) = expected_len {
            if written < expected {
                return Err(StreamError::Source(TransportError::new(
                    TransportErrorKind::Interrupted,
                    format!("stream ended after {written} of {expected} bytes"),
                )));
            }
        }

        on_bytes(StreamTick { delta: 0, written, expected_len, end_of_stream: true });
        Ok(Streamed { bytes: written, cancelled: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn frames(frames: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(stream::iter(frames.into_iter().map(|f| Ok::<_, TransportError>(Bytes::from(f)))))
    }

    #[tokio::test]
    async fn splits_into_blocks_and_reports_end() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let mut out = Vec::new();
        let mut ticks = Vec::new();
        let result = streamer
            .stream(frames(vec![vec![1u8; 20_000], vec![2u8; 100]]), &mut out, Some(20_100), |t| ticks.push(t))
            .await
            .unwrap();

        assert_eq!(result, Streamed { bytes: 20_100, cancelled: false });
        assert_eq!(out.len(), 20_100);
        assert_eq!(counter.get(), 20_100);
        let deltas: Vec<_> = ticks.iter().map(|t| t.delta).collect();
        assert_eq!(deltas, vec![8192, 8192, 3616, 100, 0]);
        let last = ticks.last().unwrap();
        assert!(last.end_of_stream);
        assert_eq!(last.written, 20_100);
    }

    #[tokio::test]
    async fn empty_stream_still_reports_end() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let mut out = Vec::new();
        let mut ticks = Vec::new();
        streamer.stream(frames(vec![]), &mut out, None, |t| ticks.push(t)).await.unwrap();
        assert_eq!(ticks.len(), 1);
        assert!(ticks[0].end_of_stream);
    }

    #[tokio::test]
    async fn cancelled_before_first_read() {
        let cancel = CancellationController::new();
        cancel.request_cancel();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let mut out = Vec::new();
        let result = streamer
            .stream(frames(vec![vec![0u8; 100]]), &mut out, None, |_| panic!("no progress expected"))
            .await
            .unwrap();
        assert_eq!(result, Streamed { bytes: 0, cancelled: true });
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn cancel_unblocks_a_silent_source() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let first = stream::iter(vec![Ok::<_, TransportError>(Bytes::from_static(b"abc"))]);
        let silent: ByteStream = Box::pin(first.chain(stream::pending()));

        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.request_cancel();
        });

        let mut out = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            streamer.stream(silent, &mut out, None, |_| {}),
        )
        .await
        .expect("stream did not observe cancellation")
        .unwrap();
        assert_eq!(result, Streamed { bytes: 3, cancelled: true });
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn source_error_keeps_what_was_written() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let source: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from(vec![9u8; 10])),
            Err(TransportError::new(TransportErrorKind::Interrupted, "reset by peer")),
        ]));
        let mut out = Vec::new();
        let err = streamer.stream(source, &mut out, None, |_| {}).await.unwrap_err();
        match err {
            StreamError::Source(e) => assert!(e.is_transient()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.len(), 10);
        assert_eq!(counter.get(), 10);
    }

    #[tokio::test]
    async fn short_stream_is_interrupted() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let mut out = Vec::new();
        let mut saw_end = false;
        let err = streamer
            .stream(frames(vec![vec![0u8; 50]]), &mut out, Some(100), |t| saw_end |= t.end_of_stream)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Source(ref e) if e.kind() == TransportErrorKind::Interrupted));
        assert!(!saw_end);
    }

    struct BrokenDisk;

    impl AsyncWrite for BrokenDisk {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failed_write_is_not_counted() {
        let cancel = CancellationController::new();
        let counter = ByteCounter::new();
        let streamer = ContentStreamer::new(&cancel, &counter, DEFAULT_BLOCK_SIZE);

        let err = streamer
            .stream(frames(vec![vec![0u8; 10]]), &mut BrokenDisk, None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Sink(_)));
        assert_eq!(counter.get(), 0);
    }
}
