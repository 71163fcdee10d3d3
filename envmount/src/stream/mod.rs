//! Block streaming for remote read-only images.
//!
//! A [`BlockStreamCache`] turns a remote image into fixed-size blocks
//! fetched on demand through a [`RangeSource`].

mod cache;
mod error;
mod source;
mod superblock;

pub use cache::{
    BlockSizing, BlockStreamCache, FetchMode, Geometry, StreamConfig, DEFAULT_FIRST_SECTOR_BYTES,
};
pub use error::{StreamError, StreamResult};
pub use source::{
    ByteRange, ByteStream, HttpRangeSource, InMemorySource, ProbeInfo, RangeSource,
    RecordedFetch, DEFAULT_TIMEOUT_SECS,
};
pub use superblock::{Superblock, SUPERBLOCK_MIN_BYTES};
