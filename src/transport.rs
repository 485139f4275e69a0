//! The HTTP side of a download.
//!
//! The engine only talks to a [`Transport`]: one headers probe and two ways to
//! open a body stream. [`HttpTransport`] is the `reqwest` implementation;
//! tests plug in their own.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use crate::models::{ByteRange, ExpectedDigest, RemoteHeaders};

/// Response body as a stream of byte frames.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not establish a connection.
    Connect,
    Timeout,
    /// The connection dropped while a request or body was in flight.
    Interrupted,
    /// The server answered with an unexpected status code.
    Status(u16),
    /// Anything else: malformed responses, ignored range requests.
    Protocol,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connection failed"),
            Self::Timeout => f.write_str("timed out"),
            Self::Interrupted => f.write_str("connection interrupted"),
            Self::Status(code) => write!(f, "http status {code}"),
            Self::Protocol => f.write_str("protocol error"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Whether re-issuing the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            TransportErrorKind::Connect
            | TransportErrorKind::Timeout
            | TransportErrorKind::Interrupted => true,
            TransportErrorKind::Status(code) => code == 408 || code == 429 || (500..600).contains(&code),
            TransportErrorKind::Protocol => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if let Some(status) = err.status() {
            TransportErrorKind::Status(status.as_u16())
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_request() || err.is_decode() {
            TransportErrorKind::Interrupted
        } else {
            TransportErrorKind::Protocol
        };
        Self::new(kind, err.to_string())
    }
}

/// Raw transport used by the downloader. Implementations must be cheap to
/// share between tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Probe size, range support and digest without fetching the body.
    async fn fetch_headers(&self, url: &str) -> Result<RemoteHeaders, TransportError>;

    /// Open the whole body.
    async fn fetch_whole(&self, url: &str) -> Result<ByteStream, TransportError>;

    /// Open the body restricted to `range`.
    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<ByteStream, TransportError>;
}

/// [`Transport`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// `request_timeout` bounds connecting and the headers probe. Body streams
    /// have no overall deadline; the downloader's stall timeout covers them.
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, request_timeout))
    }

    pub fn with_client(client: Client, request_timeout: Duration) -> Self {
        Self { client, request_timeout }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_headers(&self, url: &str) -> Result<RemoteHeaders, TransportError> {
        let resp = self.client.head(url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(parse_headers(resp.headers()))
    }

    async fn fetch_whole(&self, url: &str) -> Result<ByteStream, TransportError> {
        let resp = self.client.get(url)
            .send()
            .await?
            .error_for_status()?;
        Ok(into_byte_stream(resp))
    }

    async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<ByteStream, TransportError> {
        if range.is_empty() {
            return Ok(Box::pin(futures_util::stream::empty()));
        }
        // HTTP ranges are inclusive on both ends.
        let resp = self.client.get(url)
            .header(RANGE, format!("bytes={}-{}", range.from, range.to - 1))
            .send()
            .await?
            .error_for_status()?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                format!("range {}-{} answered with {}", range.from, range.to, resp.status()),
            ));
        }
        Ok(into_byte_stream(resp))
    }
}

fn into_byte_stream(resp: reqwest::Response) -> ByteStream {
    Box::pin(resp.bytes_stream().map(|frame| frame.map_err(TransportError::from)))
}

/// Extract what the downloader needs from a `HEAD` response.
pub fn parse_headers(headers: &HeaderMap) -> RemoteHeaders {
    let total_size = headers.get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());
    let supports_ranges = headers.get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false);
    RemoteHeaders { total_size, supports_ranges, expected_digest: expected_digest(headers) }
}

/// SHA-256 from `Repr-Digest`/`Digest` wins over `Content-MD5`.
fn expected_digest(headers: &HeaderMap) -> Option<ExpectedDigest> {
    for name in ["repr-digest", "digest"] {
        let sha = headers.get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|entry| entry.split_once('='))
            .find(|(alg, _)| alg.trim().eq_ignore_ascii_case("sha-256"))
            .and_then(|(_, value)| decode_base64(value.trim().trim_matches(':'), 32));
        if let Some(bytes) = sha {
            return Some(ExpectedDigest::sha256(bytes));
        }
    }
    headers.get("content-md5")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| decode_base64(v.trim(), 16))
        .map(ExpectedDigest::md5)
}

fn decode_base64(value: &str, expected_len: usize) -> Option<Vec<u8>> {
    STANDARD.decode(value).ok().filter(|bytes| bytes.len() == expected_len)
}
