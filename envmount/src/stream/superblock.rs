//! Minimal squashfs superblock decoding.
//!
//! Only the two fields needed to lay out the block cache are read:
//!
//! ```text
//!   offset  size  field
//!   12      u32   block_size
//!   40      u64   bytes_used
//! ```

use super::error::{StreamError, StreamResult};

/// Bytes needed before the superblock can be decoded.
pub const SUPERBLOCK_MIN_BYTES: usize = 72;

const BLOCK_SIZE_OFFSET: usize = 12;
const BYTES_USED_OFFSET: usize = 40;

/// The fields of a squashfs superblock the cache needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub bytes_used: u64,
}

impl Superblock {
    /// Decode from the first bytes of an image.
    pub fn parse(bytes: &[u8]) -> StreamResult<Self> {
        if bytes.len() < SUPERBLOCK_MIN_BYTES {
            return Err(StreamError::Superblock(format!(
                "need {} bytes, got {}",
                SUPERBLOCK_MIN_BYTES,
                bytes.len()
            )));
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 4]);
        let block_size = u32::from_le_bytes(word);

        let mut dword = [0u8; 8];
        dword.copy_from_slice(&bytes[BYTES_USED_OFFSET..BYTES_USED_OFFSET + 8]);
        let bytes_used = u64::from_le_bytes(dword);

        if block_size == 0 || block_size == u32::MAX {
            return Err(StreamError::Superblock(format!(
                "unusable block size {}",
                block_size
            )));
        }

        Ok(Self {
            block_size,
            bytes_used,
        })
    }

    /// Check the superblock against the length the server advertised.
    pub fn validate_length(&self, advertised: Option<u64>) -> StreamResult<()> {
        match advertised {
            Some(length) if self.bytes_used > length => Err(StreamError::Superblock(format!(
                "bytes_used {} exceeds advertised length {}",
                self.bytes_used, length
            ))),
            _ => Ok(()),
        }
    }
}

/// Build a superblock-shaped header. Test helper.
#[cfg(test)]
pub(crate) fn encode(block_size: u32, bytes_used: u64) -> Vec<u8> {
    let mut out = vec![0u8; SUPERBLOCK_MIN_BYTES];
    out[..4].copy_from_slice(b"hsqs");
    out[BLOCK_SIZE_OFFSET..BLOCK_SIZE_OFFSET + 4].copy_from_slice(&block_size.to_le_bytes());
    out[BYTES_USED_OFFSET..BYTES_USED_OFFSET + 8].copy_from_slice(&bytes_used.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let sb = Superblock::parse(&encode(131072, 5_000_000)).unwrap();
        assert_eq!(sb.block_size, 131072);
        assert_eq!(sb.bytes_used, 5_000_000);
    }

    #[test]
    fn test_short_header_rejected() {
        let err = Superblock::parse(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, StreamError::Superblock(_)));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(Superblock::parse(&encode(0, 10)).is_err());
    }

    #[test]
    fn test_bytes_used_beyond_length() {
        let sb = Superblock::parse(&encode(4096, 9000)).unwrap();
        assert!(sb.validate_length(Some(8192)).is_err());
        assert!(sb.validate_length(Some(9000)).is_ok());
        assert!(sb.validate_length(None).is_ok());
    }
}
