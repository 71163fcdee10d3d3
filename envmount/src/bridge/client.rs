//! Primary-side handle to a running bridge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::control::ControlMessage;
use super::reader::ImageReader;
use super::{BridgeError, BridgeResult};
use crate::rendezvous::{GeometryState, ImageHandle, RendezvousHeader, SharedRegion};

/// Cloneable primary-side client of a [`BlockBridge`](super::BlockBridge).
#[derive(Debug, Clone)]
pub struct BridgeClient {
    region: Arc<SharedRegion>,
    header: RendezvousHeader,
    control: mpsc::Sender<ControlMessage>,
    next_file_id: Arc<AtomicU32>,
    shutdown: CancellationToken,
}

impl BridgeClient {
    pub(crate) fn new(
        region: Arc<SharedRegion>,
        header: RendezvousHeader,
        control: mpsc::Sender<ControlMessage>,
        next_file_id: Arc<AtomicU32>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            region,
            header,
            control,
            next_file_id,
            shutdown,
        }
    }

    /// The shared region this client allocates from.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Open a remote image for block reads.
    ///
    /// Allocates the image handle, registers it with the bridge, waits for
    /// the geometry and allocates the slot table. The handle is never
    /// released.
    pub async fn open_image(&self, url: &str) -> BridgeResult<ImageReader> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let handle = ImageHandle::allocate(Arc::clone(&self.region), file_id, &self.header)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(ControlMessage::RegisterImage {
                handle: handle.addr(),
                url: url.to_string(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| BridgeError::Closed)?;
        ack_rx.await.map_err(|_| BridgeError::Closed)??;

        self.header.post_request(file_id).await?;
        let state = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(BridgeError::Closed),
            state = handle.await_geometry() => state?,
        };
        let geometry = match state {
            GeometryState::Ready(geometry) => geometry,
            GeometryState::Failed | GeometryState::Unset => {
                return Err(BridgeError::GeometryFailed {
                    url: url.to_string(),
                })
            }
        };

        let block_count = geometry.block_count()?;
        handle.configure_slots(block_count)?;
        debug!(
            url = %url,
            file_id,
            file_size = geometry.file_size,
            block_size = geometry.block_size,
            "image opened"
        );

        Ok(ImageReader::new(
            url.to_string(),
            file_id,
            handle,
            self.header.clone(),
            geometry,
            block_count,
            self.shutdown.clone(),
        ))
    }
}
