//! Out-of-band control messages from the primary to the bridge.

use tokio::sync::oneshot;

use crate::rendezvous::{LayoutResult, RecordAddr};

/// Capacity of the control channel.
pub(crate) const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// Messages the primary sends to the bridge worker.
#[derive(Debug)]
pub(crate) enum ControlMessage {
    /// Start serving requests for the image behind `handle`.
    RegisterImage {
        handle: RecordAddr,
        url: String,
        ack: oneshot::Sender<LayoutResult<()>>,
    },
}
