//! Integration tests for block streaming through the bridge.
//!
//! These tests verify the full primary → bridge → cache → source path:
//! - coalesced range fetches for a block request
//! - short last block and byte-level reads across blocks
//! - mounting a streamed image into the virtual filesystem
//!
//! Run with: `cargo test --test streaming_integration`

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use envmount::bridge::{BlockBridge, BridgeClient, BridgeError};
use envmount::mount::{ImageMounter, RemoteImageMounter};
use envmount::rendezvous::SharedRegion;
use envmount::stream::{BlockSizing, ByteRange, InMemorySource, StreamConfig};
use envmount::vfs::{BlockDevice, MemoryFs, VirtualFs};

// ============================================================================
// Helper Functions
// ============================================================================

const URL: &str = "https://pkgs.example.org/numpy-2.2.0-h0.sqshfs";

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn spawn_bridge(source: Arc<InMemorySource>, shutdown: CancellationToken) -> BridgeClient {
    let region = Arc::new(SharedRegion::new(1 << 20).unwrap());
    let config = StreamConfig::default().with_block_size(BlockSizing::Fixed(4096));
    BlockBridge::spawn(region, config, source, shutdown).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_three_blocks_arrive_with_one_range_fetch() {
    let data = image(10_000);
    let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
    let shutdown = CancellationToken::new();
    let client = spawn_bridge(Arc::clone(&source), shutdown.clone());

    let reader = client.open_image(URL).await.unwrap();
    assert_eq!(reader.size(), 10_000);
    assert_eq!(reader.block_size(), 4096);
    assert_eq!(reader.block_count(), 3);

    let blocks = reader.read_blocks(0, 2).await.unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[2].len(), 1808);
    assert_eq!(&blocks[0][..], &data[..4096]);
    assert_eq!(&blocks[2][..], &data[8192..]);

    let fetches = source.fetches();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].range, Some(ByteRange::new(0, 12287)));

    // Ready slots are served without another request.
    let again = reader.read_block(1).await.unwrap();
    assert_eq!(&again[..], &data[4096..8192]);
    assert_eq!(source.fetches().len(), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_read_at_spans_blocks() {
    let data = image(10_000);
    let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
    let shutdown = CancellationToken::new();
    let client = spawn_bridge(source, shutdown.clone());
    let reader = client.open_image(URL).await.unwrap();

    let mut buf = vec![0u8; 200];
    let n = reader.read_at(4000, &mut buf).await.unwrap();
    assert_eq!(n, 200);
    assert_eq!(&buf[..], &data[4000..4200]);

    // Short read at the end of the image.
    let n = reader.read_at(9_900, &mut buf).await.unwrap();
    assert_eq!(n, 100);
    assert_eq!(&buf[..100], &data[9_900..]);

    assert_eq!(reader.read_at(10_000, &mut buf).await.unwrap(), 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_out_of_range_block_is_rejected() {
    let source = Arc::new(InMemorySource::new().with_image(URL, image(10_000)));
    let shutdown = CancellationToken::new();
    let client = spawn_bridge(source, shutdown.clone());
    let reader = client.open_image(URL).await.unwrap();

    let result = reader.read_block(3).await;
    assert!(matches!(result, Err(BridgeError::OutOfRange { count: 3, .. })));
    shutdown.cancel();
}

#[tokio::test]
async fn test_missing_image_fails_geometry() {
    let source = Arc::new(InMemorySource::new());
    let shutdown = CancellationToken::new();
    let client = spawn_bridge(source, shutdown.clone());

    let result = client.open_image(URL).await;
    assert!(matches!(result, Err(BridgeError::GeometryFailed { .. })));
    shutdown.cancel();
}

#[tokio::test]
async fn test_mounted_image_reads_through_bridge() {
    let data = image(10_000);
    let source = Arc::new(InMemorySource::new().with_image(URL, data.clone()));
    let shutdown = CancellationToken::new();
    let client = spawn_bridge(Arc::clone(&source), shutdown.clone());

    let fs = Arc::new(MemoryFs::new());
    let mounter = RemoteImageMounter::new(client, Arc::clone(&fs) as Arc<dyn VirtualFs>);
    mounter.mount(URL, "/squashfs/numpy.sqshfs").await.unwrap();

    assert_eq!(fs.mount_points(), vec!["/squashfs/numpy.sqshfs".to_string()]);
    let device = fs.mounted_device("/squashfs/numpy.sqshfs").unwrap();
    assert_eq!(device.size(), 10_000);

    let mut buf = vec![0u8; 16];
    assert_eq!(device.read_at(8190, &mut buf).await.unwrap(), 16);
    assert_eq!(&buf[..], &data[8190..8206]);

    // Mounting twice at the same point fails.
    assert!(mounter.mount(URL, "/squashfs/numpy.sqshfs").await.is_err());
    shutdown.cancel();
}
