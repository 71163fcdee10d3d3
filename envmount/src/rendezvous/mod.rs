//! Shared-memory rendezvous between the primary and the bridge context.
//!
//! A [`SharedRegion`] is the only memory both contexts see. The primary
//! allocates records inside it; the bridge attaches to them by
//! [`RecordAddr`] and publishes results with atomic store+notify.
//!
//! ```text
//!   primary (VFS driver)                     bridge (network)
//!   ────────────────────                     ────────────────
//!   ImageHandle::set_pending_range
//!   RendezvousHeader::post_request ──┐
//!                                    └──▶ wait_for_request
//!                                         acknowledge_request
//!                                         take_pending_range
//!                                         fetch blocks ...
//!   BlockSlot::await_ready  ◀────────────  BlockSlot::publish
//! ```

mod records;
mod region;

pub use records::{
    BlockSlot, GeometryState, ImageHandle, PublishedGeometry, RecordAddr, RendezvousHeader,
    SlotState, CAP_SHARED_MEMORY,
};
pub use region::{LayoutError, LayoutResult, SharedRegion, MIN_REGION_BYTES};
