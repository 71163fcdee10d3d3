//! Mounting remote images into the host filesystem.

use std::sync::Arc;

use tracing::info;

use super::gate::MountError;
use crate::bridge::BridgeClient;
use crate::vfs::{BlockDevice, VirtualFs};
use crate::BoxFuture;

/// Mounts the image at `url` read-only at `mount_point`.
pub trait ImageMounter: Send + Sync {
    fn mount<'a>(&'a self, url: &'a str, mount_point: &'a str) -> BoxFuture<'a, Result<(), MountError>>;
}

/// Mounts images streamed block-by-block through the bridge.
pub struct RemoteImageMounter {
    client: BridgeClient,
    fs: Arc<dyn VirtualFs>,
}

impl RemoteImageMounter {
    pub fn new(client: BridgeClient, fs: Arc<dyn VirtualFs>) -> Self {
        Self { client, fs }
    }
}

impl ImageMounter for RemoteImageMounter {
    fn mount<'a>(&'a self, url: &'a str, mount_point: &'a str) -> BoxFuture<'a, Result<(), MountError>> {
        Box::pin(async move {
            let failed = |reason: String| MountError::Failed {
                url: url.to_string(),
                reason,
            };

            let reader = self
                .client
                .open_image(url)
                .await
                .map_err(|e| failed(e.to_string()))?;
            let size = reader.size();
            let device: Arc<dyn BlockDevice> = Arc::new(reader);
            self.fs
                .mount(mount_point, device)
                .await
                .map_err(|e| failed(e.to_string()))?;

            info!(url = %url, mount_point = %mount_point, size, "image mounted");
            Ok(())
        })
    }
}

impl std::fmt::Debug for RemoteImageMounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteImageMounter")
            .field("client", &self.client)
            .finish()
    }
}
