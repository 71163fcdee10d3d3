//! Byte-range sources for remote images.
//!
//! [`RangeSource`] is the seam between the block cache and the network.
//! [`HttpRangeSource`] talks to a real server; [`InMemorySource`] serves
//! images from memory and records every request, for tests and for
//! callers that already hold the bytes.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::error::{StreamError, StreamResult};
use crate::BoxFuture;

/// Body of a fetch, delivered as fragments in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = StreamResult<Bytes>> + Send>>;

/// An HTTP byte range. `end` is inclusive; `None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn open_ended(start: u64) -> Self {
        Self { start, end: None }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "bytes={}-{}", self.start, end),
            None => write!(f, "bytes={}-", self.start),
        }
    }
}

/// What a HEAD probe revealed about a remote image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Advertised `Content-Length`, if any.
    pub length: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// Source of image bytes.
///
/// Dyn-compatible so the cache can hold `Arc<dyn RangeSource>`.
pub trait RangeSource: Send + Sync {
    /// Probe an image for its length and range support.
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StreamResult<ProbeInfo>>;

    /// Open a body stream for `range`, or for the whole image if `None`.
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, StreamResult<ByteStream>>;
}

// =============================================================================
// HTTP
// =============================================================================

/// Default timeout for HTTP requests in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// HTTP source using ranged GET requests.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: Client,
    timeout: Duration,
}

impl HttpRangeSource {
    /// Create a source with the given request timeout.
    pub fn new(timeout: Duration) -> StreamResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamError::http("<client>", e))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe_inner(&self, url: &str) -> StreamResult<ProbeInfo> {
        let response = self
            .client
            .head(url)
            .header(RANGE, "bytes=0-")
            .send()
            .await
            .map_err(|e| StreamError::http(url, e))?;

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "HEAD probe not successful");
            return Ok(ProbeInfo {
                length: None,
                accepts_ranges: false,
            });
        }

        let headers = response.headers();
        let length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(ProbeInfo {
            length,
            accepts_ranges,
        })
    }

    async fn fetch_inner(&self, url: &str, range: Option<ByteRange>) -> StreamResult<ByteStream> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range.to_string());
        }
        let response = request
            .send()
            .await
            .map_err(|e| StreamError::http(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(range) = range {
            // A 200 for a range that does not start at 0 would misplace
            // every byte that follows.
            if range.start > 0 && status != StatusCode::PARTIAL_CONTENT {
                return Err(StreamError::RangeIgnored {
                    url: url.to_string(),
                    start: range.start,
                });
            }
        }

        let owned_url = url.to_string();
        let body = response
            .bytes_stream()
            .map_err(move |e| StreamError::http(&owned_url, e));
        Ok(Box::pin(body))
    }
}

impl RangeSource for HttpRangeSource {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StreamResult<ProbeInfo>> {
        Box::pin(self.probe_inner(url))
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, StreamResult<ByteStream>> {
        Box::pin(self.fetch_inner(url, range))
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// A fetch observed by [`InMemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFetch {
    pub url: String,
    pub range: Option<ByteRange>,
}

/// Serves images from memory, splitting bodies into fixed-size fragments.
#[derive(Debug)]
pub struct InMemorySource {
    images: Mutex<HashMap<String, Bytes>>,
    accepts_ranges: bool,
    advertises_length: bool,
    chunk_size: usize,
    failures_remaining: AtomicU32,
    fetches: Mutex<Vec<RecordedFetch>>,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySource {
    /// Create an empty source that supports ranges and advertises lengths.
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            accepts_ranges: true,
            advertises_length: true,
            chunk_size: 1024,
            failures_remaining: AtomicU32::new(0),
            fetches: Mutex::new(Vec::new()),
        }
    }

    /// Add an image served at `url`.
    pub fn with_image(self, url: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.images.lock().insert(url.into(), data.into());
        self
    }

    /// Behave like a server without `Accept-Ranges: bytes`.
    pub fn without_ranges(mut self) -> Self {
        self.accepts_ranges = false;
        self
    }

    /// Behave like a server that sends no `Content-Length`.
    pub fn without_length(mut self) -> Self {
        self.advertises_length = false;
        self
    }

    /// Set the fragment size bodies are split into.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fail the next `count` fetches with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Every fetch issued so far, in order.
    pub fn fetches(&self) -> Vec<RecordedFetch> {
        self.fetches.lock().clone()
    }

    fn image(&self, url: &str) -> StreamResult<Bytes> {
        self.images
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| StreamError::Status {
                url: url.to_string(),
                status: 404,
            })
    }

    fn fetch_sync(&self, url: &str, range: Option<ByteRange>) -> StreamResult<ByteStream> {
        self.fetches.lock().push(RecordedFetch {
            url: url.to_string(),
            range,
        });

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StreamError::http(url, "injected failure"));
        }

        let image = self.image(url)?;
        let body = match range {
            Some(range) if self.accepts_ranges => {
                let len = image.len() as u64;
                if range.start >= len {
                    return Err(StreamError::Status {
                        url: url.to_string(),
                        status: 416,
                    });
                }
                let end = range.end.map_or(len - 1, |end| end.min(len - 1));
                image.slice(range.start as usize..=end as usize)
            }
            Some(range) if range.start > 0 => {
                return Err(StreamError::RangeIgnored {
                    url: url.to_string(),
                    start: range.start,
                });
            }
            _ => image,
        };

        let chunk_size = self.chunk_size;
        let fragments: Vec<StreamResult<Bytes>> = (0..body.len())
            .step_by(chunk_size)
            .map(|start| Ok(body.slice(start..(start + chunk_size).min(body.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}

impl RangeSource for InMemorySource {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, StreamResult<ProbeInfo>> {
        Box::pin(async move {
            let image = self.image(url)?;
            Ok(ProbeInfo {
                length: self.advertises_length.then_some(image.len() as u64),
                accepts_ranges: self.accepts_ranges,
            })
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        range: Option<ByteRange>,
    ) -> BoxFuture<'a, StreamResult<ByteStream>> {
        Box::pin(async move { self.fetch_sync(url, range) })
    }
}

/// Drain a body stream into one buffer.
pub(crate) async fn collect_body(mut body: ByteStream) -> StreamResult<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(fragment) = body.next().await {
        out.extend_from_slice(&fragment?);
    }
    Ok(out)
}
