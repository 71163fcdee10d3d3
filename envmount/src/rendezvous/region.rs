//! Shared word region with atomic wait/notify.
//!
//! The region is a fixed array of 32-bit atomic words. Records and data
//! buffers live at byte addresses inside it; every address is 4-byte
//! aligned and address 0 is reserved so that it can mean "unset".
//!
//! Waiting is cooperative: [`SharedRegion::await_change`] suspends the
//! calling task on a striped [`Notify`] until the watched word differs
//! from the expected value. Writers publish with
//! [`SharedRegion::store_and_notify`], which wakes every waiter sharing
//! the stripe; waiters re-check their own word, so spurious wakeups are
//! harmless.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Word size of the region in bytes.
pub const WORD: u32 = 4;

/// Number of notification stripes.
const NOTIFY_STRIPES: usize = 64;

/// Smallest region that can hold a header, one image handle and a slot.
pub const MIN_REGION_BYTES: usize = 64;

/// Layout errors. These are programming errors and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// The region cannot hold the requested allocation.
    #[error("shared region exhausted: need {requested} bytes, {available} available")]
    Exhausted { requested: u32, available: u32 },

    /// Region smaller than the protocol minimum.
    #[error("shared region of {size} bytes is below the minimum of {min} bytes")]
    Undersized { size: usize, min: usize },

    /// Address not aligned to a word boundary.
    #[error("address {addr:#x} is not 4-byte aligned")]
    Misaligned { addr: u32 },

    /// Address (plus length) outside the region.
    #[error("address range {addr:#x}+{len} is outside the {size}-byte region")]
    OutOfBounds { addr: u32, len: u32, size: u32 },

    /// Null address used where a record was expected.
    #[error("null record address")]
    Null,

    /// More blocks than a 32-bit block index addresses.
    #[error("image of {file_size} bytes in {block_size}-byte blocks exceeds the block index range")]
    TooManyBlocks { file_size: u64, block_size: u32 },
}

/// Result type for region operations.
pub type LayoutResult<T> = Result<T, LayoutError>;

/// A region of memory shared between the primary and the bridge context.
pub struct SharedRegion {
    words: Box<[AtomicU32]>,
    notifiers: Box<[Notify]>,
    /// Next free byte address. Only the primary side allocates.
    next_free: Mutex<u32>,
}

impl SharedRegion {
    /// Create a zeroed region of `size` bytes (rounded down to whole words).
    pub fn new(size: usize) -> LayoutResult<Self> {
        if size < MIN_REGION_BYTES || size > u32::MAX as usize {
            return Err(LayoutError::Undersized {
                size,
                min: MIN_REGION_BYTES,
            });
        }
        let word_count = size / WORD as usize;
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        let notifiers = (0..NOTIFY_STRIPES).map(|_| Notify::new()).collect();

        Ok(Self {
            words,
            notifiers,
            // Word 0 stays reserved as the null address.
            next_free: Mutex::new(WORD),
        })
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u32 {
        (self.words.len() as u32) * WORD
    }

    /// Bytes not yet handed out by [`alloc`](Self::alloc).
    pub fn available(&self) -> u32 {
        self.size() - *self.next_free.lock()
    }

    /// Bump-allocate `len` bytes, rounded up to whole words.
    ///
    /// Allocations are never released.
    pub fn alloc(&self, len: u32) -> LayoutResult<u32> {
        let rounded = len
            .checked_add(WORD - 1)
            .map(|l| l & !(WORD - 1))
            .ok_or(LayoutError::Exhausted {
                requested: len,
                available: self.available(),
            })?;
        let mut next = self.next_free.lock();
        let available = self.size() - *next;
        if rounded > available {
            return Err(LayoutError::Exhausted {
                requested: rounded,
                available,
            });
        }
        let addr = *next;
        *next += rounded;
        Ok(addr)
    }

    /// Validate that `[addr, addr + len)` is aligned and inside the region.
    pub fn check(&self, addr: u32, len: u32) -> LayoutResult<()> {
        if addr % WORD != 0 {
            return Err(LayoutError::Misaligned { addr });
        }
        let end = addr as u64 + len as u64;
        if end > self.size() as u64 {
            return Err(LayoutError::OutOfBounds {
                addr,
                len,
                size: self.size(),
            });
        }
        Ok(())
    }

    fn word(&self, addr: u32) -> LayoutResult<&AtomicU32> {
        self.check(addr, WORD)?;
        Ok(&self.words[(addr / WORD) as usize])
    }

    fn notifier(&self, addr: u32) -> &Notify {
        &self.notifiers[(addr / WORD) as usize % NOTIFY_STRIPES]
    }

    /// Atomically load the word at `addr`.
    pub fn load(&self, addr: u32) -> LayoutResult<u32> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    /// Atomically store `value` and wake every waiter on the word.
    pub fn store_and_notify(&self, addr: u32, value: u32) -> LayoutResult<()> {
        self.word(addr)?.store(value, Ordering::Release);
        self.notifier(addr).notify_waiters();
        Ok(())
    }

    /// Compare-exchange the word; on success wake every waiter.
    ///
    /// The inner result carries the observed value on failure.
    pub fn compare_exchange_and_notify(
        &self,
        addr: u32,
        current: u32,
        new: u32,
    ) -> LayoutResult<Result<u32, u32>> {
        let outcome =
            self.word(addr)?
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire);
        if outcome.is_ok() {
            self.notifier(addr).notify_waiters();
        }
        Ok(outcome)
    }

    /// Suspend until the word at `addr` differs from `expected`.
    ///
    /// Returns the new value. Never spins: the task parks on the word's
    /// notification stripe between checks.
    pub async fn await_change(&self, addr: u32, expected: u32) -> LayoutResult<u32> {
        let word = self.word(addr)?;
        let notify = self.notifier(addr);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before the check so a store between the load and the
            // await cannot be missed.
            notified.as_mut().enable();

            let value = word.load(Ordering::Acquire);
            if value != expected {
                return Ok(value);
            }
            notified.await;
        }
    }

    /// Copy `data` into the region starting at `addr`.
    ///
    /// The caller publishes the data afterwards with a store+notify on a
    /// separate signal word; the buffer itself is never waited on.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> LayoutResult<()> {
        self.check(addr, data.len() as u32)?;
        let first = (addr / WORD) as usize;
        for (i, chunk) in data.chunks(WORD as usize).enumerate() {
            let word = &self.words[first + i];
            let value = if chunk.len() == WORD as usize {
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            } else {
                // Preserve the tail of a partially overwritten word.
                let mut bytes = word.load(Ordering::Relaxed).to_le_bytes();
                bytes[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(bytes)
            };
            word.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `len` bytes out of the region starting at `addr`.
    pub fn read_bytes(&self, addr: u32, len: u32) -> LayoutResult<Vec<u8>> {
        self.check(addr, len)?;
        let first = (addr / WORD) as usize;
        let word_count = len.div_ceil(WORD) as usize;
        let mut out = Vec::with_capacity(word_count * WORD as usize);
        for word in &self.words[first..first + word_count] {
            out.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out.truncate(len as usize);
        Ok(out)
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_new_rejects_undersized_region() {
        let err = SharedRegion::new(16).unwrap_err();
        assert!(matches!(err, LayoutError::Undersized { size: 16, .. }));
    }

    #[test]
    fn test_alloc_rounds_to_words_and_skips_null() {
        let region = SharedRegion::new(128).unwrap();
        let a = region.alloc(5).unwrap();
        let b = region.alloc(4).unwrap();
        assert_eq!(a, 4);
        assert_eq!(b, 12);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let region = SharedRegion::new(64).unwrap();
        region.alloc(40).unwrap();
        let err = region.alloc(40).unwrap_err();
        assert!(matches!(err, LayoutError::Exhausted { .. }));
    }

    #[test]
    fn test_misaligned_and_out_of_bounds() {
        let region = SharedRegion::new(64).unwrap();
        assert_eq!(
            region.load(6).unwrap_err(),
            LayoutError::Misaligned { addr: 6 }
        );
        assert!(matches!(
            region.load(64).unwrap_err(),
            LayoutError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_bytes_round_trip_with_partial_tail() {
        let region = SharedRegion::new(64).unwrap();
        region.store_and_notify(12, 0xAABB_CCDD).unwrap();
        region.write_bytes(8, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(region.read_bytes(8, 6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        // Bytes after the written tail are untouched.
        let word = region.load(12).unwrap().to_le_bytes();
        assert_eq!(&word[2..], &[0xBB, 0xAA]);
    }

    #[test]
    fn test_compare_exchange_reports_observed_value() {
        let region = SharedRegion::new(64).unwrap();
        assert_eq!(region.compare_exchange_and_notify(4, 0, 7).unwrap(), Ok(0));
        assert_eq!(region.compare_exchange_and_notify(4, 0, 9).unwrap(), Err(7));
    }

    #[tokio::test]
    async fn test_await_change_returns_immediately_when_different() {
        let region = SharedRegion::new(64).unwrap();
        region.store_and_notify(4, 3).unwrap();
        assert_eq!(region.await_change(4, 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_await_change_wakes_on_store() {
        let region = Arc::new(SharedRegion::new(64).unwrap());
        let waiter = {
            let region = Arc::clone(&region);
            tokio::spawn(async move { region.await_change(8, 0).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        region.store_and_notify(8, 42).unwrap();
        assert_eq!(waiter.await.unwrap(), 42);
    }
}
