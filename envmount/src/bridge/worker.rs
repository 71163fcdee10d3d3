//! Bridge-side receive loop.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::BridgeClient;
use super::control::{ControlMessage, CONTROL_CHANNEL_CAPACITY};
use super::{BridgeError, BridgeResult};
use crate::rendezvous::{
    GeometryState, ImageHandle, LayoutResult, PublishedGeometry, RecordAddr, RendezvousHeader,
    SharedRegion, CAP_SHARED_MEMORY,
};
use crate::stream::{BlockStreamCache, FetchMode, RangeSource, StreamConfig};

/// Spawns the bridge worker.
pub struct BlockBridge;

impl BlockBridge {
    /// Create the rendezvous header, spawn the receive loop and return the
    /// primary-side client.
    ///
    /// The loop runs until `shutdown` is cancelled.
    pub fn spawn(
        region: Arc<SharedRegion>,
        config: StreamConfig,
        source: Arc<dyn RangeSource>,
        shutdown: CancellationToken,
    ) -> BridgeResult<BridgeClient> {
        let header = RendezvousHeader::allocate(Arc::clone(&region))?;
        header.set_capabilities(CAP_SHARED_MEMORY)?;

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let worker = BridgeWorker {
            region: Arc::clone(&region),
            header: header.clone(),
            config,
            source,
            images: HashMap::new(),
            control: control_rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(worker.run());

        Ok(BridgeClient::new(
            region,
            header,
            control_tx,
            Arc::new(AtomicU32::new(1)),
            shutdown,
        ))
    }
}

struct BridgeImage {
    url: String,
    handle: ImageHandle,
    cache: BlockStreamCache,
}

enum Event {
    Shutdown,
    Control(ControlMessage),
    Request(LayoutResult<u32>),
}

struct BridgeWorker {
    region: Arc<SharedRegion>,
    header: RendezvousHeader,
    config: StreamConfig,
    source: Arc<dyn RangeSource>,
    images: HashMap<u32, BridgeImage>,
    control: mpsc::Receiver<ControlMessage>,
    shutdown: CancellationToken,
}

impl BridgeWorker {
    async fn run(mut self) {
        debug!("block bridge started");
        loop {
            let header = self.header.clone();
            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                Some(message) = self.control.recv() => Event::Control(message),
                request = header.wait_for_request() => Event::Request(request),
            };

            match event {
                Event::Shutdown => break,
                Event::Control(message) => self.handle_control(message),
                Event::Request(Ok(file_id)) => {
                    if let Err(e) = self.header.acknowledge_request() {
                        warn!(error = %e, "failed to reset request slot");
                        break;
                    }
                    if let Err(e) = self.dispatch(file_id).await {
                        warn!(file_id, error = %e, "bridge request failed");
                    }
                }
                Event::Request(Err(e)) => {
                    warn!(error = %e, "request slot unreadable, stopping bridge");
                    break;
                }
            }
        }
        debug!("block bridge stopped");
    }

    fn handle_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::RegisterImage { handle, url, ack } => {
                let result = self.register(handle, &url);
                if let Err(e) = &result {
                    warn!(url = %url, error = %e, "failed to register image");
                }
                // The client may have given up waiting.
                let _ = ack.send(result);
            }
        }
    }

    fn register(&mut self, addr: RecordAddr, url: &str) -> LayoutResult<()> {
        let handle = ImageHandle::attach(Arc::clone(&self.region), addr)?;
        let file_id = handle.file_id()?;
        let cache = BlockStreamCache::new(url, Arc::clone(&self.source), self.config.clone());
        info!(url = %url, file_id, "registered image");
        self.images.insert(
            file_id,
            BridgeImage {
                url: url.to_string(),
                handle,
                cache,
            },
        );
        Ok(())
    }

    async fn dispatch(&self, file_id: u32) -> BridgeResult<()> {
        let Some(image) = self.images.get(&file_id) else {
            warn!(file_id, "request for unregistered image");
            return Ok(());
        };

        match image.handle.geometry()? {
            GeometryState::Unset => Self::publish_geometry(image).await,
            GeometryState::Failed => {
                debug!(url = %image.url, "ignoring request for image without geometry");
                Ok(())
            }
            GeometryState::Ready(geometry) => Self::serve_blocks(image, geometry).await,
        }
    }

    async fn publish_geometry(image: &BridgeImage) -> BridgeResult<()> {
        match image.cache.geometry().await {
            Ok(geometry) => {
                debug!(
                    url = %image.url,
                    file_size = geometry.file_size,
                    block_size = geometry.block_size,
                    "publishing geometry"
                );
                image.handle.publish_geometry(PublishedGeometry {
                    file_size: geometry.file_size,
                    block_size: geometry.block_size,
                })?;
                Ok(())
            }
            Err(e) => {
                image.handle.publish_geometry_failure()?;
                Err(e.into())
            }
        }
    }

    async fn serve_blocks(image: &BridgeImage, geometry: PublishedGeometry) -> BridgeResult<()> {
        let (start, end) = image.handle.take_pending_range()?;
        let count = geometry.block_count()?;
        if start > end || end >= count {
            return Err(BridgeError::OutOfRange {
                url: image.url.clone(),
                block: end,
                count,
            });
        }
        debug!(url = %image.url, start, end, "serving block range");

        let ranged = matches!(image.cache.geometry().await, Ok(g) if g.mode == FetchMode::Ranged);
        if ranged {
            if let Err(e) = image.cache.read_request_block_range(start, end).await {
                warn!(url = %image.url, start, end, error = %e, "range request failed");
            }
        }

        for block in start..=end {
            let slot = image.handle.slot(block)?;
            let published = match image.cache.get_block(block).await {
                Ok(bytes) => slot.publish(&bytes),
                Err(e) => {
                    warn!(url = %image.url, block, error = %e, "block fetch failed");
                    slot.publish_failure()
                }
            };
            // The reader is waiting on every slot in the range.
            if let Err(e) = published {
                warn!(url = %image.url, block, error = %e, "failed to publish block");
                slot.publish_failure()?;
            }
        }
        Ok(())
    }
}
