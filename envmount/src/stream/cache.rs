//! Block cache for one remote image.
//!
//! The image is divided into fixed-size blocks. Blocks are filled by
//! byte-range fetches that run as spawned tasks; each fetch streams
//! fragments into the blocks it covers, in order. Waiters hold a shared
//! handle to every fetch covering their block.
//!
//! ```text
//!   read_request_block_range(0, 4)
//!
//!   block:     0        1        2        3        4
//!   state:   cached   empty    empty   in-flight  empty
//!                     └──── run ────┘            └ run ┘
//!   fetches:          bytes=bs-(3bs-1)           bytes=4bs-(5bs-1)
//! ```
//!
//! A partially filled block resumes from its received offset and always
//! starts a new run.
//!
//! # Modes
//!
//! - **Ranged**: the server advertises a length and `Accept-Ranges: bytes`.
//!   Blocks are fetched on demand.
//! - **Full-file**: anything else. The whole body is streamed once from
//!   the start and distributed over the blocks as it arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::{FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::error::{StreamError, StreamResult};
use super::source::{collect_body, ByteRange, ByteStream, RangeSource, DEFAULT_TIMEOUT_SECS};
use super::superblock::{Superblock, SUPERBLOCK_MIN_BYTES};
use crate::BoxFuture;

/// Default size of the first-sector read used to decode the superblock.
pub const DEFAULT_FIRST_SECTOR_BYTES: u32 = 4096;

// =============================================================================
// Configuration
// =============================================================================

/// How the block size of an image is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizing {
    /// Use a fixed block size.
    Fixed(u32),
    /// Read the first sector and use the squashfs superblock's block size.
    Superblock,
}

/// Configuration for block streaming.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Block size source.
    pub block_size: BlockSizing,

    /// Bytes read up front to decode the superblock in ranged mode.
    pub first_sector_bytes: u32,

    /// Extra attempts when opening a fetch fails.
    pub fetch_retries: u32,

    /// HTTP request timeout.
    pub timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSizing::Superblock,
            first_sector_bytes: DEFAULT_FIRST_SECTOR_BYTES,
            fetch_retries: 0,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl StreamConfig {
    /// Set the block size source.
    pub fn with_block_size(mut self, sizing: BlockSizing) -> Self {
        self.block_size = sizing;
        self
    }

    /// Set the first-sector read size.
    pub fn with_first_sector_bytes(mut self, bytes: u32) -> Self {
        self.first_sector_bytes = bytes;
        self
    }

    /// Set the number of retries for opening a fetch.
    pub fn with_fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = retries;
        self
    }

    /// Set the HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// How the image body is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Ranged,
    FullFile,
}

/// Size and block layout of an image, determined once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub file_size: u64,
    pub block_size: u32,
    pub mode: FetchMode,
}

impl Geometry {
    fn new(file_size: u64, block_size: u32, mode: FetchMode) -> StreamResult<Self> {
        if block_size == 0 || block_size == u32::MAX {
            return Err(StreamError::InvalidBlockSize { block_size });
        }
        if file_size.div_ceil(block_size as u64) > u32::MAX as u64 {
            return Err(StreamError::TooManyBlocks {
                file_size,
                block_size,
            });
        }
        Ok(Self {
            file_size,
            block_size,
            mode,
        })
    }

    /// Number of blocks covering the image.
    pub fn block_count(&self) -> u32 {
        self.file_size.div_ceil(self.block_size as u64) as u32
    }

    /// Length of block `index`; the final block may be short.
    pub fn block_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.block_size as u64;
        self.file_size
            .saturating_sub(start)
            .min(self.block_size as u64) as u32
    }

    /// Block containing byte `offset`.
    pub fn block_of(&self, offset: u64) -> u32 {
        (offset / self.block_size as u64) as u32
    }

    fn check_block(&self, block: u32) -> StreamResult<()> {
        if block >= self.block_count() {
            return Err(StreamError::UnknownBlock {
                block,
                count: self.block_count(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Block state
// =============================================================================

type FetchHandle = Shared<BoxFuture<'static, StreamResult<()>>>;

#[derive(Default)]
struct BlockEntry {
    fragments: Vec<Bytes>,
    received: u32,
    /// Fetches currently covering this block, keyed by fetch id.
    pending: Vec<(u64, FetchHandle)>,
}

impl BlockEntry {
    /// Join the fragments into one buffer, keeping the joined copy.
    fn coalesce(&mut self) -> Bytes {
        if self.fragments.len() != 1 {
            let mut joined = BytesMut::with_capacity(self.received as usize);
            for fragment in &self.fragments {
                joined.extend_from_slice(fragment);
            }
            self.fragments = vec![joined.freeze()];
        }
        self.fragments.first().cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct CacheState {
    blocks: Vec<BlockEntry>,
    next_fetch_id: u64,
}

/// Distribute `data`, which starts at byte `offset`, over the blocks.
///
/// Bytes past the declared file size are dropped. Each fragment must
/// continue exactly where its block left off.
fn store_read(
    blocks: &mut [BlockEntry],
    geometry: &Geometry,
    offset: u64,
    mut data: Bytes,
) -> StreamResult<()> {
    if offset >= geometry.file_size {
        return Ok(());
    }
    let remaining = geometry.file_size - offset;
    if data.len() as u64 > remaining {
        data.truncate(remaining as usize);
    }

    let block_size = geometry.block_size as u64;
    let mut offset = offset;
    while !data.is_empty() {
        let index = geometry.block_of(offset);
        let within = offset - index as u64 * block_size;
        let entry = blocks
            .get_mut(index as usize)
            .ok_or(StreamError::UnknownBlock {
                block: index,
                count: geometry.block_count(),
            })?;
        if entry.received as u64 != within {
            return Err(StreamError::Integrity {
                block: index,
                expected: entry.received as u64,
                actual: within,
            });
        }
        let take = ((block_size - within) as usize).min(data.len());
        entry.fragments.push(data.split_to(take));
        entry.received += take as u32;
        offset += take as u64;
    }
    Ok(())
}

async fn open_with_retries(
    source: &dyn RangeSource,
    url: &str,
    range: Option<ByteRange>,
    retries: u32,
    fetch_count: &AtomicU64,
) -> StreamResult<ByteStream> {
    let mut attempt = 0;
    loop {
        fetch_count.fetch_add(1, Ordering::Relaxed);
        match source.fetch(url, range).await {
            Ok(body) => return Ok(body),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(url = %url, attempt, error = %e, "fetch failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

enum FetchBody {
    Range(ByteRange),
    Open(ByteStream),
}

struct Run {
    first: u32,
    last: u32,
    resume: u32,
}

// =============================================================================
// BlockStreamCache
// =============================================================================

/// Block cache for one remote image.
pub struct BlockStreamCache {
    url: String,
    source: Arc<dyn RangeSource>,
    config: StreamConfig,
    geometry: OnceCell<Geometry>,
    state: Arc<Mutex<CacheState>>,
    fetch_count: Arc<AtomicU64>,
}

impl BlockStreamCache {
    /// Create a cache for `url`. Nothing is fetched until first use.
    pub fn new(url: impl Into<String>, source: Arc<dyn RangeSource>, config: StreamConfig) -> Self {
        Self {
            url: url.into(),
            source,
            config,
            geometry: OnceCell::new(),
            state: Arc::new(Mutex::new(CacheState::default())),
            fetch_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of body fetches issued, retries included.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    /// Size and block layout of the image.
    ///
    /// Resolved on first call; a failed resolution is retried by the next
    /// caller.
    pub async fn geometry(&self) -> StreamResult<Geometry> {
        self.geometry
            .get_or_try_init(|| self.resolve_geometry())
            .await
            .copied()
    }

    /// Issue the minimal set of range fetches covering blocks
    /// `start..=end` that are neither cached nor in flight.
    ///
    /// Returns the number of fetches issued.
    pub async fn read_request_block_range(&self, start: u32, end: u32) -> StreamResult<usize> {
        let geometry = self.geometry().await?;
        if geometry.mode == FetchMode::FullFile {
            return Err(StreamError::RangeUnsupported {
                url: self.url.clone(),
            });
        }
        geometry.check_block(end)?;
        if start > end {
            return Ok(0);
        }
        Ok(self.issue_runs(&geometry, start, end))
    }

    /// Return the bytes of block `index`, waiting for in-flight fetches
    /// and requesting the block if nothing covers it.
    pub async fn get_block(&self, index: u32) -> StreamResult<Bytes> {
        let geometry = self.geometry().await?;
        geometry.check_block(index)?;
        let expected = geometry.block_len(index);
        let mut requested = false;

        loop {
            let (pending, received) = {
                let mut state = self.state.lock();
                let entry = &mut state.blocks[index as usize];
                if entry.received >= expected {
                    return Ok(entry.coalesce());
                }
                let pending: Vec<FetchHandle> =
                    entry.pending.iter().map(|(_, h)| h.clone()).collect();
                (pending, entry.received)
            };

            if pending.is_empty() {
                if requested || geometry.mode == FetchMode::FullFile {
                    return Err(StreamError::ShortBlock {
                        block: index,
                        received,
                        expected,
                    });
                }
                debug!(url = %self.url, block = index, "block not covered, requesting");
                self.issue_runs(&geometry, index, index);
                requested = true;
                continue;
            }

            for result in futures::future::join_all(pending).await {
                result?;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Geometry resolution
    // -------------------------------------------------------------------------

    async fn resolve_geometry(&self) -> StreamResult<Geometry> {
        let probe = self.source.probe(&self.url).await?;
        debug!(
            url = %self.url,
            length = ?probe.length,
            accepts_ranges = probe.accepts_ranges,
            "probed image"
        );

        let geometry = match (probe.length, probe.accepts_ranges) {
            (Some(length), true) => self.init_ranged(length).await?,
            (length, _) => self.init_full_file(length).await?,
        };
        debug!(
            url = %self.url,
            file_size = geometry.file_size,
            block_size = geometry.block_size,
            mode = ?geometry.mode,
            "image geometry resolved"
        );
        Ok(geometry)
    }

    async fn open(&self, range: Option<ByteRange>) -> StreamResult<ByteStream> {
        open_with_retries(
            self.source.as_ref(),
            &self.url,
            range,
            self.config.fetch_retries,
            &self.fetch_count,
        )
        .await
    }

    fn install_blocks(&self, geometry: &Geometry) -> parking_lot::MutexGuard<'_, CacheState> {
        let mut state = self.state.lock();
        state.blocks = (0..geometry.block_count())
            .map(|_| BlockEntry::default())
            .collect();
        state
    }

    async fn init_ranged(&self, length: u64) -> StreamResult<Geometry> {
        match self.config.block_size {
            BlockSizing::Fixed(block_size) => {
                let geometry = Geometry::new(length, block_size, FetchMode::Ranged)?;
                drop(self.install_blocks(&geometry));
                Ok(geometry)
            }
            BlockSizing::Superblock => {
                let sector = (self.config.first_sector_bytes as u64).min(length).max(1);
                let head = collect_body(self.open(Some(ByteRange::new(0, sector - 1))).await?).await?;
                let superblock = Superblock::parse(&head)?;
                superblock.validate_length(Some(length))?;

                let geometry = Geometry::new(length, superblock.block_size, FetchMode::Ranged)?;
                let mut state = self.install_blocks(&geometry);
                store_read(&mut state.blocks, &geometry, 0, Bytes::from(head))?;
                Ok(geometry)
            }
        }
    }

    async fn init_full_file(&self, length: Option<u64>) -> StreamResult<Geometry> {
        let mut body = self.open(None).await?;

        match (self.config.block_size, length) {
            (BlockSizing::Fixed(block_size), Some(length)) => {
                let geometry = Geometry::new(length, block_size, FetchMode::FullFile)?;
                let mut state = self.install_blocks(&geometry);
                self.spawn_full_stream(&mut state, geometry, body, 0);
                Ok(geometry)
            }
            (BlockSizing::Fixed(block_size), None) => {
                // Length unknown: the body has to be buffered to learn it.
                let data = collect_body(body).await?;
                let geometry =
                    Geometry::new(data.len() as u64, block_size, FetchMode::FullFile)?;
                let mut state = self.install_blocks(&geometry);
                store_read(&mut state.blocks, &geometry, 0, Bytes::from(data))?;
                Ok(geometry)
            }
            (BlockSizing::Superblock, length) => {
                let mut head = BytesMut::new();
                while head.len() < SUPERBLOCK_MIN_BYTES {
                    match body.next().await {
                        Some(fragment) => head.extend_from_slice(&fragment?),
                        None => break,
                    }
                }
                let superblock = Superblock::parse(&head)?;
                superblock.validate_length(length)?;

                let file_size = length.unwrap_or(superblock.bytes_used);
                let geometry =
                    Geometry::new(file_size, superblock.block_size, FetchMode::FullFile)?;
                let head = head.freeze();
                let offset = head.len() as u64;
                let mut state = self.install_blocks(&geometry);
                store_read(&mut state.blocks, &geometry, 0, head)?;
                self.spawn_full_stream(&mut state, geometry, body, offset);
                Ok(geometry)
            }
        }
    }

    fn spawn_full_stream(
        &self,
        state: &mut CacheState,
        geometry: Geometry,
        body: ByteStream,
        offset: u64,
    ) {
        let count = geometry.block_count();
        if count == 0 || offset >= geometry.file_size {
            return;
        }
        let first = geometry.block_of(offset);
        self.spawn_fetch(state, geometry, FetchBody::Open(body), offset, first, count - 1);
    }

    // -------------------------------------------------------------------------
    // Fetching
    // -------------------------------------------------------------------------

    fn issue_runs(&self, geometry: &Geometry, start: u32, end: u32) -> usize {
        let mut state = self.state.lock();
        let mut runs: Vec<Run> = Vec::new();
        let mut current: Option<Run> = None;

        for block in start..=end {
            let entry = &state.blocks[block as usize];
            let wanted = entry.received < geometry.block_len(block) && entry.pending.is_empty();
            if !wanted {
                runs.extend(current.take());
                continue;
            }
            match current.as_mut() {
                Some(run) if entry.received == 0 => run.last = block,
                _ => {
                    runs.extend(current.take());
                    current = Some(Run {
                        first: block,
                        last: block,
                        resume: entry.received,
                    });
                }
            }
        }
        runs.extend(current);

        let block_size = geometry.block_size as u64;
        for run in &runs {
            let range = ByteRange::new(
                run.first as u64 * block_size + run.resume as u64,
                (run.last as u64 + 1) * block_size - 1,
            );
            debug!(url = %self.url, first = run.first, last = run.last, range = %range, "issuing block fetch");
            self.spawn_fetch(
                &mut state,
                *geometry,
                FetchBody::Range(range),
                range.start,
                run.first,
                run.last,
            );
        }
        runs.len()
    }

    /// Spawn a fetch task covering blocks `first..=last` and register its
    /// handle on each of them.
    ///
    /// Must be called with the state lock held so the task cannot finish
    /// before its handle is registered.
    fn spawn_fetch(
        &self,
        state: &mut CacheState,
        geometry: Geometry,
        body: FetchBody,
        offset: u64,
        first: u32,
        last: u32,
    ) {
        let id = state.next_fetch_id;
        state.next_fetch_id += 1;

        let source = Arc::clone(&self.source);
        let shared_state = Arc::clone(&self.state);
        let fetch_count = Arc::clone(&self.fetch_count);
        let url = self.url.clone();
        let retries = self.config.fetch_retries;

        let task = tokio::spawn(async move {
            let result: StreamResult<()> = async {
                let mut stream = match body {
                    FetchBody::Open(stream) => stream,
                    FetchBody::Range(range) => {
                        open_with_retries(source.as_ref(), &url, Some(range), retries, &fetch_count)
                            .await?
                    }
                };
                let mut offset = offset;
                while let Some(fragment) = stream.next().await {
                    let fragment = fragment?;
                    let len = fragment.len() as u64;
                    store_read(&mut shared_state.lock().blocks, &geometry, offset, fragment)?;
                    offset += len;
                }
                Ok(())
            }
            .await;

            let mut state = shared_state.lock();
            for entry in &mut state.blocks[first as usize..=last as usize] {
                entry.pending.retain(|(fetch, _)| *fetch != id);
            }
            drop(state);

            if let Err(e) = &result {
                warn!(url = %url, first, last, error = %e, "block fetch failed");
            }
            result
        });

        let handle: BoxFuture<'static, StreamResult<()>> = Box::pin(async move {
            task.await
                .unwrap_or_else(|e| Err(StreamError::Aborted(e.to_string())))
        });
        let handle = handle.shared();
        for entry in &mut state.blocks[first as usize..=last as usize] {
            entry.pending.push((id, handle.clone()));
        }
    }
}

impl std::fmt::Debug for BlockStreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStreamCache")
            .field("url", &self.url)
            .field("geometry", &self.geometry.get())
            .field("fetch_count", &self.fetch_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::source::InMemorySource;
    use crate::stream::superblock;
    use proptest::prelude::*;

    const URL: &str = "mem://image.sqshfs";

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fixed(source: Arc<InMemorySource>, block_size: u32) -> BlockStreamCache {
        BlockStreamCache::new(
            URL,
            source,
            StreamConfig::default().with_block_size(BlockSizing::Fixed(block_size)),
        )
    }

    #[tokio::test]
    async fn test_coalesced_range_fetch_and_short_last_block() {
        let data = image(10_000);
        let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
        let cache = fixed(Arc::clone(&source), 4096);

        assert_eq!(cache.read_request_block_range(0, 2).await.unwrap(), 1);
        let fetches = source.fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].range, Some(ByteRange::new(0, 12287)));

        let last = cache.get_block(2).await.unwrap();
        assert_eq!(last.len(), 1808);
        assert_eq!(&last[..], &data[8192..]);
        assert_eq!(&cache.get_block(0).await.unwrap()[..], &data[..4096]);
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_and_cached_blocks_are_not_refetched() {
        let source = Arc::new(InMemorySource::new().with_image(URL, image(5 * 1000)));
        let cache = fixed(Arc::clone(&source), 1000);

        cache.read_request_block_range(1, 2).await.unwrap();
        cache.get_block(1).await.unwrap();
        assert_eq!(cache.read_request_block_range(0, 4).await.unwrap(), 2);

        let ranges: Vec<_> = source.fetches().into_iter().map(|f| f.range).collect();
        assert_eq!(
            ranges,
            vec![
                Some(ByteRange::new(1000, 2999)),
                Some(ByteRange::new(0, 999)),
                Some(ByteRange::new(3000, 4999)),
            ]
        );
    }

    #[tokio::test]
    async fn test_get_block_requests_uncovered_block() {
        let data = image(3000);
        let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
        let cache = fixed(Arc::clone(&source), 1024);

        let block = cache.get_block(1).await.unwrap();
        assert_eq!(&block[..], &data[1024..2048]);
        assert_eq!(source.fetches()[0].range, Some(ByteRange::new(1024, 2047)));
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_fetch() {
        let source = Arc::new(InMemorySource::new().with_image(URL, image(4096)));
        let cache = Arc::new(fixed(Arc::clone(&source), 4096));
        cache.geometry().await.unwrap();

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_block(0).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_block(0).await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(source.fetches().len(), 1);
    }

    #[tokio::test]
    async fn test_superblock_first_sector_is_cached_and_resumed() {
        let mut data = image(20_000);
        data[..superblock::SUPERBLOCK_MIN_BYTES].copy_from_slice(&superblock::encode(8192, 20_000));
        let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
        let cache = BlockStreamCache::new(URL, Arc::clone(&source) as Arc<dyn RangeSource>, StreamConfig::default());

        let geometry = cache.geometry().await.unwrap();
        assert_eq!(geometry.block_size, 8192);
        assert_eq!(geometry.block_count(), 3);
        assert_eq!(geometry.mode, FetchMode::Ranged);

        assert_eq!(cache.read_request_block_range(0, 2).await.unwrap(), 1);
        let fetches = source.fetches();
        assert_eq!(fetches[0].range, Some(ByteRange::new(0, 4095)));
        assert_eq!(fetches[1].range, Some(ByteRange::new(4096, 24575)));

        assert_eq!(&cache.get_block(0).await.unwrap()[..], &data[..8192]);
        assert_eq!(&cache.get_block(2).await.unwrap()[..], &data[16384..]);
    }

    #[tokio::test]
    async fn test_superblock_larger_than_image_is_rejected() {
        let mut data = image(4096);
        data[..superblock::SUPERBLOCK_MIN_BYTES].copy_from_slice(&superblock::encode(4096, 9000));
        let source = Arc::new(InMemorySource::new().with_image(URL, data));
        let cache = BlockStreamCache::new(URL, source, StreamConfig::default());
        assert!(matches!(
            cache.geometry().await.unwrap_err(),
            StreamError::Superblock(_)
        ));
    }

    #[tokio::test]
    async fn test_full_file_mode_streams_once() {
        let data = image(10_000);
        let source = Arc::new(
            InMemorySource::new()
                .with_image(URL, data.clone())
                .without_ranges()
                .with_chunk_size(777),
        );
        let cache = fixed(Arc::clone(&source), 4096);

        let geometry = cache.geometry().await.unwrap();
        assert_eq!(geometry.mode, FetchMode::FullFile);
        assert!(matches!(
            cache.read_request_block_range(0, 1).await.unwrap_err(),
            StreamError::RangeUnsupported { .. }
        ));
        for block in 0..3u32 {
            let bytes = cache.get_block(block).await.unwrap();
            let start = block as usize * 4096;
            assert_eq!(&bytes[..], &data[start..(start + 4096).min(data.len())]);
        }
        assert_eq!(source.fetches().len(), 1);
        assert_eq!(source.fetches()[0].range, None);
    }

    #[tokio::test]
    async fn test_full_file_superblock_without_length_uses_bytes_used() {
        let mut data = image(9000);
        data[..superblock::SUPERBLOCK_MIN_BYTES].copy_from_slice(&superblock::encode(4096, 8500));
        let source = Arc::new(
            InMemorySource::new()
                .with_image(URL, data.clone())
                .without_length()
                .with_chunk_size(50),
        );
        let cache = BlockStreamCache::new(URL, source, StreamConfig::default());

        let geometry = cache.geometry().await.unwrap();
        assert_eq!(geometry.file_size, 8500);
        // Trailing bytes past bytes_used are discarded.
        let last = cache.get_block(2).await.unwrap();
        assert_eq!(&last[..], &data[8192..8500]);
    }

    #[tokio::test]
    async fn test_unknown_length_fixed_buffers_body() {
        let data = image(5000);
        let source = Arc::new(
            InMemorySource::new()
                .with_image(URL, data.clone())
                .without_length(),
        );
        let cache = fixed(source, 2048);
        let geometry = cache.geometry().await.unwrap();
        assert_eq!(geometry.file_size, 5000);
        assert_eq!(&cache.get_block(2).await.unwrap()[..], &data[4096..]);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_block_requestable() {
        let data = image(2048);
        let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
        let cache = fixed(Arc::clone(&source), 1024);
        cache.geometry().await.unwrap();

        source.fail_next(1);
        assert!(matches!(
            cache.get_block(0).await.unwrap_err(),
            StreamError::Http { .. }
        ));
        assert_eq!(&cache.get_block(0).await.unwrap()[..], &data[..1024]);
    }

    #[tokio::test]
    async fn test_fetch_retries_reopen_request() {
        let source = Arc::new(InMemorySource::new().with_image(URL, image(1024)));
        let cache = BlockStreamCache::new(
            URL,
            Arc::clone(&source) as Arc<dyn RangeSource>,
            StreamConfig::default()
                .with_block_size(BlockSizing::Fixed(1024))
                .with_fetch_retries(2),
        );
        cache.geometry().await.unwrap();
        source.fail_next(2);
        assert_eq!(cache.get_block(0).await.unwrap().len(), 1024);
        assert_eq!(cache.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_block_rejected() {
        let source = Arc::new(InMemorySource::new().with_image(URL, image(100)));
        let cache = fixed(source, 64);
        assert!(matches!(
            cache.get_block(2).await.unwrap_err(),
            StreamError::UnknownBlock { block: 2, count: 2 }
        ));
    }

    #[test]
    fn test_store_read_rejects_wrong_offset() {
        let geometry = Geometry::new(100, 10, FetchMode::Ranged).unwrap();
        let mut blocks: Vec<BlockEntry> = (0..10).map(|_| BlockEntry::default()).collect();
        store_read(&mut blocks, &geometry, 0, Bytes::from_static(&[1; 5])).unwrap();
        let err = store_read(&mut blocks, &geometry, 7, Bytes::from_static(&[2; 3])).unwrap_err();
        assert_eq!(
            err,
            StreamError::Integrity {
                block: 0,
                expected: 5,
                actual: 7
            }
        );
    }

    #[test]
    fn test_geometry_beyond_block_index_range_is_rejected() {
        assert_eq!(
            Geometry::new(1u64 << 40, 64, FetchMode::Ranged).unwrap_err(),
            StreamError::TooManyBlocks {
                file_size: 1u64 << 40,
                block_size: 64,
            }
        );
        let geometry = Geometry::new(1u64 << 40, 1 << 20, FetchMode::Ranged).unwrap();
        assert_eq!(geometry.block_count(), 1 << 20);
    }

    proptest! {
        #[test]
        fn prop_store_read_splits_at_block_boundaries(
            len in 1usize..4000,
            block_size in 1u32..700,
            cuts in proptest::collection::vec(1usize..900, 1..20),
        ) {
            let data = image(len);
            let geometry = Geometry::new(len as u64, block_size, FetchMode::FullFile).unwrap();
            let mut blocks: Vec<BlockEntry> =
                (0..geometry.block_count()).map(|_| BlockEntry::default()).collect();

            let mut offset = 0usize;
            let mut cut = cuts.iter().cycle();
            while offset < len {
                let take = (*cut.next().unwrap()).min(len - offset);
                let fragment = Bytes::copy_from_slice(&data[offset..offset + take]);
                store_read(&mut blocks, &geometry, offset as u64, fragment).unwrap();
                offset += take;
            }

            for (index, entry) in blocks.iter_mut().enumerate() {
                let start = index * block_size as usize;
                let end = (start + block_size as usize).min(len);
                prop_assert_eq!(entry.received, geometry.block_len(index as u32));
                prop_assert_eq!(&entry.coalesce()[..], &data[start..end]);
            }
        }
    }
}
