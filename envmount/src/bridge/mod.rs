//! Cross-context block bridge.
//!
//! The bridge runs in its own task and is the only place network fetches
//! happen. The primary side never blocks on the network: it posts a
//! request through the shared region and suspends until the bridge
//! publishes the blocks.
//!
//! ```text
//!  ┌──────────── primary ────────────┐        ┌──────────── bridge ───────────┐
//!  │ BridgeClient::open_image(url)   │        │ BlockBridge worker loop       │
//!  │   ImageHandle::allocate         │        │                               │
//!  │   RegisterImage ────────────────┼─ mpsc ─┼─▶ attach handle, new cache    │
//!  │   post_request(file_id) ────────┼─ shm ──┼─▶ publish geometry            │
//!  │                                 │        │                               │
//!  │ ImageReader::read_at            │        │                               │
//!  │   set_pending_range, post ──────┼─ shm ──┼─▶ read_request_block_range    │
//!  │   BlockSlot::await_ready ◀──────┼─ shm ──┼── get_block, slot.publish     │
//!  └─────────────────────────────────┘        └───────────────────────────────┘
//! ```
//!
//! Only [`RecordAddr`](crate::rendezvous::RecordAddr)s and URLs travel over
//! the control channel; all block data moves through the region.

mod client;
mod control;
mod reader;
mod worker;

use thiserror::Error;

use crate::rendezvous::LayoutError;
use crate::stream::StreamError;

pub use client::BridgeClient;
pub use reader::ImageReader;
pub use worker::BlockBridge;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced to the primary side of the bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("shared region error: {0}")]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The bridge could not determine the image's geometry.
    #[error("could not determine size of {url}")]
    GeometryFailed { url: String },

    /// The bridge could not fetch a block.
    #[error("failed to fetch block {block} of {url}")]
    BlockFailed { url: String, block: u32 },

    /// Block index outside the image.
    #[error("block {block} is outside {url} ({count} blocks)")]
    OutOfRange { url: String, block: u32, count: u32 },

    /// The bridge task has stopped.
    #[error("block bridge is not running")]
    Closed,
}
