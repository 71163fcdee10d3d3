//! Primary-side block reader for one image.

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{BridgeError, BridgeResult};
use crate::rendezvous::{ImageHandle, PublishedGeometry, RendezvousHeader, SlotState};
use crate::vfs::{BlockDevice, VfsError, VfsResult};
use crate::BoxFuture;

/// Reads blocks of one image through the bridge.
///
/// Slot buffers act as the primary-side cache: a block is requested from
/// the bridge at most once. A block the bridge failed to fetch stays
/// failed for the lifetime of the reader.
#[derive(Debug)]
pub struct ImageReader {
    url: String,
    file_id: u32,
    handle: ImageHandle,
    header: RendezvousHeader,
    geometry: PublishedGeometry,
    block_count: u32,
    shutdown: CancellationToken,
    /// Serializes requests for this handle; it has one pending range.
    request_lock: Mutex<()>,
}

impl ImageReader {
    pub(crate) fn new(
        url: String,
        file_id: u32,
        handle: ImageHandle,
        header: RendezvousHeader,
        geometry: PublishedGeometry,
        block_count: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            file_id,
            handle,
            header,
            geometry,
            block_count,
            shutdown,
            request_lock: Mutex::new(()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Image size in bytes.
    pub fn size(&self) -> u64 {
        self.geometry.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Read one block.
    pub async fn read_block(&self, index: u32) -> BridgeResult<Vec<u8>> {
        let mut blocks = self.read_blocks(index, index).await?;
        blocks.pop().ok_or_else(|| self.block_failed(index))
    }

    /// Read blocks `start..=end`, requesting the missing ones with a
    /// single pending range.
    pub async fn read_blocks(&self, start: u32, end: u32) -> BridgeResult<Vec<Vec<u8>>> {
        let count = self.block_count();
        if start > end || end >= count {
            return Err(BridgeError::OutOfRange {
                url: self.url.clone(),
                block: end,
                count,
            });
        }

        let _guard = self.request_lock.lock().await;

        let mut missing = Vec::new();
        for block in start..=end {
            let slot = self.handle.slot(block)?;
            match slot.state()? {
                SlotState::Ready(_) => {}
                SlotState::Failed => return Err(self.block_failed(block)),
                SlotState::Empty => {
                    if !slot.has_buffer()? {
                        slot.attach_buffer(self.geometry.block_size)?;
                    }
                    missing.push(block);
                }
            }
        }

        if let (Some(&first), Some(&last)) = (missing.first(), missing.last()) {
            trace!(url = %self.url, first, last, "requesting blocks");
            self.handle.set_pending_range(first, last)?;
            self.header.post_request(self.file_id).await?;

            for &block in &missing {
                let slot = self.handle.slot(block)?;
                let state = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(BridgeError::Closed),
                    state = slot.await_ready() => state?,
                };
                if state == SlotState::Failed {
                    return Err(self.block_failed(block));
                }
            }
        }

        let mut blocks = Vec::with_capacity((end - start + 1) as usize);
        for block in start..=end {
            let slot = self.handle.slot(block)?;
            match slot.state()? {
                SlotState::Ready(len) => blocks.push(slot.read(len)?),
                _ => return Err(self.block_failed(block)),
            }
        }
        Ok(blocks)
    }

    /// Read into `buf` from byte `offset`. Returns the number of bytes
    /// read, short only at the end of the image.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> BridgeResult<usize> {
        let size = self.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let block_size = self.geometry.block_size as u64;
        let first = (offset / block_size) as u32;
        let last = ((offset + len as u64 - 1) / block_size) as u32;

        let blocks = self.read_blocks(first, last).await?;
        let mut copied = 0;
        let mut skip = (offset - first as u64 * block_size) as usize;
        for block in &blocks {
            let available = &block[skip.min(block.len())..];
            let take = available.len().min(len - copied);
            buf[copied..copied + take].copy_from_slice(&available[..take]);
            copied += take;
            skip = 0;
            if copied == len {
                break;
            }
        }
        Ok(copied)
    }

    fn block_failed(&self, block: u32) -> BridgeError {
        BridgeError::BlockFailed {
            url: self.url.clone(),
            block,
        }
    }
}

impl BlockDevice for ImageReader {
    fn size(&self) -> u64 {
        ImageReader::size(self)
    }

    fn read_at<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> BoxFuture<'a, VfsResult<usize>> {
        Box::pin(async move {
            ImageReader::read_at(self, offset, buf)
                .await
                .map_err(|e| VfsError::Device {
                    reason: e.to_string(),
                })
        })
    }
}
