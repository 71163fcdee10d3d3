//! Error types for block streaming.

use thiserror::Error;

/// Result type for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors raised while streaming a remote image.
///
/// `Clone` so that one failed fetch can be reported to every task
/// awaiting the blocks it covered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Transport-level failure.
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// Non-success HTTP status.
    #[error("HTTP request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Server answered a ranged request with the whole body.
    #[error("server for {url} ignored the requested range starting at {start}")]
    RangeIgnored { url: String, start: u64 },

    /// Ranged reads requested on an image in full-file mode.
    #[error("range requests are unavailable for {url}")]
    RangeUnsupported { url: String },

    /// A fragment arrived at an offset that does not continue its block.
    #[error("integrity error in block {block}: expected offset {expected}, got {actual}")]
    Integrity {
        block: u32,
        expected: u64,
        actual: u64,
    },

    /// Block index outside the image.
    #[error("block {block} is outside the image ({count} blocks)")]
    UnknownBlock { block: u32, count: u32 },

    /// A fetch finished without delivering the whole block.
    #[error("block {block} incomplete: {received} of {expected} bytes")]
    ShortBlock {
        block: u32,
        received: u32,
        expected: u32,
    },

    /// A block size of zero or the failure sentinel.
    #[error("unusable block size {block_size}")]
    InvalidBlockSize { block_size: u32 },

    /// More blocks than a 32-bit block index addresses.
    #[error("image of {file_size} bytes in {block_size}-byte blocks exceeds the block index range")]
    TooManyBlocks { file_size: u64, block_size: u32 },

    /// The superblock could not be decoded.
    #[error("invalid superblock: {0}")]
    Superblock(String),

    /// The fetch task panicked or was cancelled.
    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

impl StreamError {
    pub(crate) fn http(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Http {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
