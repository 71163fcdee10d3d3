//! Typed views over the fixed-layout records in a [`SharedRegion`].
//!
//! # Layout
//!
//! All fields are little-endian 32-bit words.
//!
//! ```text
//! RendezvousHeader (8 bytes)
//!   +0  next_request     file id to service, 0 = idle
//!   +4  capabilities     capability flags
//!
//! ImageHandle (32 bytes)
//!   +0  file_size_lo     ┐ published by the bridge before block_size
//!   +4  file_size_hi     ┘
//!   +8  file_id
//!   +12 block_size       0 = unset, u32::MAX = geometry failed
//!   +16 pending_start    first block of the pending request
//!   +20 pending_end      last block of the pending request (inclusive)
//!   +24 header           address of the RendezvousHeader
//!   +28 slots            address of the BlockSlot table, 0 = unset
//!
//! BlockSlot (8 bytes)
//!   +0  bytes_read       0 = not ready, u32::MAX = fetch failed
//!   +4  data             address of a block_size-byte data buffer
//! ```

use std::sync::Arc;

use super::region::{LayoutError, LayoutResult, SharedRegion};

/// Opaque address of a record inside a shared region.
///
/// Passed across the control channel so the bridge can attach to records
/// the primary allocated. The raw value never leaves this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordAddr(u32);

/// Capability flag: the region is shared with a live bridge context.
pub const CAP_SHARED_MEMORY: u32 = 1;

/// `bytes_read` value published when a block could not be fetched.
const SLOT_FAILED: u32 = u32::MAX;

/// `block_size` value published when geometry could not be determined.
const GEOMETRY_FAILED: u32 = u32::MAX;

// =============================================================================
// RendezvousHeader
// =============================================================================

const HEADER_NEXT_REQUEST: u32 = 0;
const HEADER_CAPABILITIES: u32 = 4;
const HEADER_SIZE: u32 = 8;

/// The single global request slot.
#[derive(Debug, Clone)]
pub struct RendezvousHeader {
    region: Arc<SharedRegion>,
    addr: u32,
}

impl RendezvousHeader {
    /// Allocate a new, idle header.
    pub fn allocate(region: Arc<SharedRegion>) -> LayoutResult<Self> {
        let addr = region.alloc(HEADER_SIZE)?;
        Ok(Self { region, addr })
    }

    /// Attach to a header allocated elsewhere.
    pub fn attach(region: Arc<SharedRegion>, addr: RecordAddr) -> LayoutResult<Self> {
        if addr.0 == 0 {
            return Err(LayoutError::Null);
        }
        region.check(addr.0, HEADER_SIZE)?;
        Ok(Self {
            region,
            addr: addr.0,
        })
    }

    pub fn addr(&self) -> RecordAddr {
        RecordAddr(self.addr)
    }

    /// Currently posted file id, 0 when idle.
    pub fn pending_request(&self) -> LayoutResult<u32> {
        self.region.load(self.addr + HEADER_NEXT_REQUEST)
    }

    /// Post a request for `file_id`, waiting for the slot to become idle.
    ///
    /// Primary side. Posting is a compare-exchange from idle so concurrent
    /// primary tasks never overwrite each other's request.
    pub async fn post_request(&self, file_id: u32) -> LayoutResult<()> {
        debug_assert!(file_id != 0, "file id 0 means idle");
        let addr = self.addr + HEADER_NEXT_REQUEST;
        loop {
            match self.region.compare_exchange_and_notify(addr, 0, file_id)? {
                Ok(_) => return Ok(()),
                Err(current) => {
                    self.region.await_change(addr, current).await?;
                }
            }
        }
    }

    /// Wait for a posted request and return its file id. Bridge side.
    pub async fn wait_for_request(&self) -> LayoutResult<u32> {
        self.region
            .await_change(self.addr + HEADER_NEXT_REQUEST, 0)
            .await
    }

    /// Reset the slot to idle after picking up a request. Bridge side.
    pub fn acknowledge_request(&self) -> LayoutResult<()> {
        self.region
            .store_and_notify(self.addr + HEADER_NEXT_REQUEST, 0)
    }

    pub fn capabilities(&self) -> LayoutResult<u32> {
        self.region.load(self.addr + HEADER_CAPABILITIES)
    }

    pub fn set_capabilities(&self, flags: u32) -> LayoutResult<()> {
        self.region
            .store_and_notify(self.addr + HEADER_CAPABILITIES, flags)
    }
}

// =============================================================================
// ImageHandle
// =============================================================================

const HANDLE_FILE_SIZE_LO: u32 = 0;
const HANDLE_FILE_SIZE_HI: u32 = 4;
const HANDLE_FILE_ID: u32 = 8;
const HANDLE_BLOCK_SIZE: u32 = 12;
const HANDLE_PENDING_START: u32 = 16;
const HANDLE_PENDING_END: u32 = 20;
const HANDLE_HEADER: u32 = 24;
const HANDLE_SLOTS: u32 = 28;
const HANDLE_SIZE: u32 = 32;

const SLOT_BYTES_READ: u32 = 0;
const SLOT_DATA: u32 = 4;
const SLOT_SIZE: u32 = 8;

/// Geometry of a streamed image as published through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedGeometry {
    pub file_size: u64,
    pub block_size: u32,
}

impl PublishedGeometry {
    /// Number of blocks covering the image.
    pub fn block_count(&self) -> LayoutResult<u32> {
        u32::try_from(self.file_size.div_ceil(self.block_size as u64)).map_err(|_| {
            LayoutError::TooManyBlocks {
                file_size: self.file_size,
                block_size: self.block_size,
            }
        })
    }

    /// Length of block `index`; the last block may be short.
    pub fn block_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.block_size as u64;
        (self.file_size.saturating_sub(start)).min(self.block_size as u64) as u32
    }
}

/// Geometry state observed on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryState {
    Unset,
    Ready(PublishedGeometry),
    Failed,
}

/// Per-image record shared by the reader and the bridge.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    region: Arc<SharedRegion>,
    addr: u32,
}

impl ImageHandle {
    /// Allocate a handle for `file_id`, linked to `header`. Primary side.
    pub fn allocate(
        region: Arc<SharedRegion>,
        file_id: u32,
        header: &RendezvousHeader,
    ) -> LayoutResult<Self> {
        let addr = region.alloc(HANDLE_SIZE)?;
        region.store_and_notify(addr + HANDLE_FILE_ID, file_id)?;
        region.store_and_notify(addr + HANDLE_HEADER, header.addr)?;
        Ok(Self { region, addr })
    }

    /// Attach to a handle allocated by the other context.
    pub fn attach(region: Arc<SharedRegion>, addr: RecordAddr) -> LayoutResult<Self> {
        if addr.0 == 0 {
            return Err(LayoutError::Null);
        }
        region.check(addr.0, HANDLE_SIZE)?;
        Ok(Self {
            region,
            addr: addr.0,
        })
    }

    pub fn addr(&self) -> RecordAddr {
        RecordAddr(self.addr)
    }

    pub fn file_id(&self) -> LayoutResult<u32> {
        self.region.load(self.addr + HANDLE_FILE_ID)
    }

    /// The header this handle posts its requests to.
    pub fn header(&self) -> LayoutResult<RendezvousHeader> {
        let header = self.region.load(self.addr + HANDLE_HEADER)?;
        RendezvousHeader::attach(Arc::clone(&self.region), RecordAddr(header))
    }

    /// Current geometry state.
    pub fn geometry(&self) -> LayoutResult<GeometryState> {
        let block_size = self.region.load(self.addr + HANDLE_BLOCK_SIZE)?;
        match block_size {
            0 => Ok(GeometryState::Unset),
            GEOMETRY_FAILED => Ok(GeometryState::Failed),
            block_size => {
                let lo = self.region.load(self.addr + HANDLE_FILE_SIZE_LO)? as u64;
                let hi = self.region.load(self.addr + HANDLE_FILE_SIZE_HI)? as u64;
                Ok(GeometryState::Ready(PublishedGeometry {
                    file_size: (hi << 32) | lo,
                    block_size,
                }))
            }
        }
    }

    /// Publish file and block size. Bridge side.
    ///
    /// The block size is stored last; it is the word the primary waits on.
    pub fn publish_geometry(&self, geometry: PublishedGeometry) -> LayoutResult<()> {
        let size = geometry.file_size;
        self.region
            .store_and_notify(self.addr + HANDLE_FILE_SIZE_HI, (size >> 32) as u32)?;
        self.region
            .store_and_notify(self.addr + HANDLE_FILE_SIZE_LO, size as u32)?;
        self.region
            .store_and_notify(self.addr + HANDLE_BLOCK_SIZE, geometry.block_size)
    }

    /// Publish that geometry could not be determined. Bridge side.
    pub fn publish_geometry_failure(&self) -> LayoutResult<()> {
        self.region
            .store_and_notify(self.addr + HANDLE_BLOCK_SIZE, GEOMETRY_FAILED)
    }

    /// Suspend until the bridge publishes geometry (or its failure).
    pub async fn await_geometry(&self) -> LayoutResult<GeometryState> {
        self.region
            .await_change(self.addr + HANDLE_BLOCK_SIZE, 0)
            .await?;
        self.geometry()
    }

    /// Allocate and link the slot table once geometry is known. Primary side.
    pub fn configure_slots(&self, block_count: u32) -> LayoutResult<()> {
        let len = block_count
            .checked_mul(SLOT_SIZE)
            .ok_or(LayoutError::Exhausted {
                requested: u32::MAX,
                available: self.region.available(),
            })?;
        let table = self.region.alloc(len.max(SLOT_SIZE))?;
        self.region.store_and_notify(self.addr + HANDLE_SLOTS, table)
    }

    /// Whether the slot table has been linked.
    pub fn slots_configured(&self) -> LayoutResult<bool> {
        Ok(self.region.load(self.addr + HANDLE_SLOTS)? != 0)
    }

    /// Record the block range the next request covers. Primary side.
    pub fn set_pending_range(&self, start: u32, end: u32) -> LayoutResult<()> {
        self.region
            .store_and_notify(self.addr + HANDLE_PENDING_START, start)?;
        self.region
            .store_and_notify(self.addr + HANDLE_PENDING_END, end)
    }

    /// Read and clear the pending block range. Bridge side.
    pub fn take_pending_range(&self) -> LayoutResult<(u32, u32)> {
        let start = self.region.load(self.addr + HANDLE_PENDING_START)?;
        let end = self.region.load(self.addr + HANDLE_PENDING_END)?;
        self.region
            .store_and_notify(self.addr + HANDLE_PENDING_START, 0)?;
        self.region
            .store_and_notify(self.addr + HANDLE_PENDING_END, 0)?;
        Ok((start, end))
    }

    /// View of the slot for block `index`.
    pub fn slot(&self, index: u32) -> LayoutResult<BlockSlot> {
        let table = self.region.load(self.addr + HANDLE_SLOTS)?;
        if table == 0 {
            return Err(LayoutError::Null);
        }
        let addr = index
            .checked_mul(SLOT_SIZE)
            .and_then(|offset| table.checked_add(offset))
            .ok_or(LayoutError::OutOfBounds {
                addr: table,
                len: SLOT_SIZE,
                size: self.region.size(),
            })?;
        self.region.check(addr, SLOT_SIZE)?;
        Ok(BlockSlot {
            region: Arc::clone(&self.region),
            addr,
        })
    }
}

// =============================================================================
// BlockSlot
// =============================================================================

/// Readiness of a block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Ready(u32),
    Failed,
}

/// Per-block record: byte count plus data buffer.
#[derive(Debug, Clone)]
pub struct BlockSlot {
    region: Arc<SharedRegion>,
    addr: u32,
}

impl BlockSlot {
    pub fn state(&self) -> LayoutResult<SlotState> {
        Ok(match self.region.load(self.addr + SLOT_BYTES_READ)? {
            0 => SlotState::Empty,
            SLOT_FAILED => SlotState::Failed,
            n => SlotState::Ready(n),
        })
    }

    /// Whether a data buffer is linked.
    pub fn has_buffer(&self) -> LayoutResult<bool> {
        Ok(self.region.load(self.addr + SLOT_DATA)? != 0)
    }

    /// Allocate and link a data buffer of `len` bytes. Primary side.
    pub fn attach_buffer(&self, len: u32) -> LayoutResult<()> {
        let data = self.region.alloc(len)?;
        self.region.store_and_notify(self.addr + SLOT_DATA, data)
    }

    /// Copy `bytes` into the buffer and publish the count. Bridge side.
    pub fn publish(&self, bytes: &[u8]) -> LayoutResult<()> {
        let data = self.region.load(self.addr + SLOT_DATA)?;
        if data == 0 {
            return Err(LayoutError::Null);
        }
        self.region.write_bytes(data, bytes)?;
        // An empty block would be indistinguishable from "not ready".
        let count = (bytes.len() as u32).max(1).min(SLOT_FAILED - 1);
        self.region
            .store_and_notify(self.addr + SLOT_BYTES_READ, count)
    }

    /// Publish that this block could not be fetched. Bridge side.
    pub fn publish_failure(&self) -> LayoutResult<()> {
        self.region
            .store_and_notify(self.addr + SLOT_BYTES_READ, SLOT_FAILED)
    }

    /// Suspend until the bridge publishes this block.
    pub async fn await_ready(&self) -> LayoutResult<SlotState> {
        self.region
            .await_change(self.addr + SLOT_BYTES_READ, 0)
            .await?;
        self.state()
    }

    /// Copy the first `len` published bytes out of the buffer.
    pub fn read(&self, len: u32) -> LayoutResult<Vec<u8>> {
        let data = self.region.load(self.addr + SLOT_DATA)?;
        if data == 0 {
            return Err(LayoutError::Null);
        }
        self.region.read_bytes(data, len)
    }
}
