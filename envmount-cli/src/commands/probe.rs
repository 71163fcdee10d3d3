//! Remote image probe command.

use std::sync::Arc;
use std::time::Instant;

use envmount::config::ConfigFile;
use envmount::stream::{BlockSizing, BlockStreamCache, FetchMode, HttpRangeSource};
use tracing::debug;

use crate::error::CliError;

/// Resolve the geometry of `url` and optionally fetch its first blocks.
pub async fn run(url: &str, block_size: Option<u32>, blocks: u32) -> Result<(), CliError> {
    let config = ConfigFile::load_default()?;
    let mut stream = config.stream_config();
    if let Some(size) = block_size {
        if size == 0 {
            return Err(CliError::Config("block size must be positive".to_string()));
        }
        stream = stream.with_block_size(BlockSizing::Fixed(size));
    }

    let source = Arc::new(HttpRangeSource::new(stream.timeout)?);
    let cache = BlockStreamCache::new(url, source, stream);

    let geometry = cache.geometry().await?;
    debug!(url = %url, ?geometry, "geometry resolved");
    println!("Image: {}", url);
    println!("  Size:        {} bytes", geometry.file_size);
    println!("  Block size:  {} bytes", geometry.block_size);
    println!("  Blocks:      {}", geometry.block_count());
    println!(
        "  Fetch mode:  {}",
        match geometry.mode {
            FetchMode::Ranged => "ranged",
            FetchMode::FullFile => "full file",
        }
    );

    let count = blocks.min(geometry.block_count());
    if count == 0 {
        return Ok(());
    }

    let started = Instant::now();
    if geometry.mode == FetchMode::Ranged {
        cache.read_request_block_range(0, count - 1).await?;
    }
    let mut bytes = 0usize;
    for index in 0..count {
        bytes += cache.get_block(index).await?.len();
    }
    println!(
        "  Fetched {} blocks ({} bytes) in {:.2?} with {} requests",
        count,
        bytes,
        started.elapsed(),
        cache.fetch_count()
    );
    Ok(())
}
