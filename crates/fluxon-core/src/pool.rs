//! Buffer pool: the hand-off point between ingress and parser workers.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::alloc::AllocatorRef;
use crate::buffer::JsonBuffer;
use crate::error::{Error, Result};

/// A stable backing region, recorded for device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Host address of the region.
    pub addr: usize,
    /// Region length in bytes.
    pub len: usize,
}

/// Fixed set of [`JsonBuffer`]s cycling between an empty set and the
/// raw-JSON queue.
///
/// The total buffer count is constant: every buffer is, at any instant,
/// in exactly one of the empty channel, ingress's hands, the filled
/// channel, or a parser worker's hands. Both channels are bounded at the
/// pool size, so neither side can over-commit.
pub struct BufferPool {
    empty_tx: Sender<JsonBuffer>,
    empty_rx: Receiver<JsonBuffer>,
    filled_tx: Sender<JsonBuffer>,
    filled_rx: Receiver<JsonBuffer>,
    regions: Vec<MemoryRegion>,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Allocates `count` buffers of `capacity` bytes each through the
    /// parser context's allocator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a zero count or capacity, or the
    /// allocator's error.
    pub fn new(allocator: &AllocatorRef, count: usize, capacity: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::Config("buffer pool requires at least one buffer".into()));
        }
        if capacity == 0 {
            return Err(Error::Config("buffer capacity must be non-zero".into()));
        }

        // Allocators with a fixed region size (huge pages) override the
        // requested capacity.
        let capacity = allocator.fixed_capacity().unwrap_or(capacity);

        let (empty_tx, empty_rx) = bounded(count);
        let (filled_tx, filled_rx) = bounded(count);
        let mut regions = Vec::with_capacity(count);

        for _ in 0..count {
            let allocation = allocator.allocate(capacity)?;
            regions.push(MemoryRegion {
                addr: allocation.addr(),
                len: allocation.len(),
            });
            empty_tx
                .send(JsonBuffer::new(allocation))
                .map_err(|_| Error::Internal("empty buffer channel closed during setup".into()))?;
        }

        Ok(Self {
            empty_tx,
            empty_rx,
            filled_tx,
            filled_rx,
            regions,
            buffer_capacity: capacity,
        })
    }

    /// Number of buffers owned by the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if the pool owns no buffers. Construction forbids
    /// this, so it only exists for completeness.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Per-buffer capacity in bytes.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// The stable backing regions of all buffers, for registering with
    /// an accelerator context.
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Takes an empty buffer, waiting up to `timeout`.
    ///
    /// `None` on timeout, so a blocked ingress can observe shutdown.
    #[must_use]
    pub fn acquire_empty(&self, timeout: Duration) -> Option<JsonBuffer> {
        match self.empty_rx.recv_timeout(timeout) {
            Ok(buf) => Some(buf),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Publishes a filled buffer on the raw-JSON queue, stamping its
    /// receive time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the queue is gone; the channel is
    /// bounded at the pool size so the send itself cannot block.
    pub fn submit_filled(&self, mut buf: JsonBuffer) -> Result<()> {
        buf.mark_received(Instant::now());
        self.filled_tx
            .send(buf)
            .map_err(|_| Error::Internal("raw-JSON queue disconnected".into()))
    }

    /// Claims a filled buffer for parsing, waiting up to `timeout`.
    #[must_use]
    pub fn claim_filled(&self, timeout: Duration) -> Option<JsonBuffer> {
        match self.filled_rx.recv_timeout(timeout) {
            Ok(buf) => Some(buf),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Claims a filled buffer without waiting.
    #[must_use]
    pub fn try_claim_filled(&self) -> Option<JsonBuffer> {
        self.filled_rx.try_recv().ok()
    }

    /// Returns true if no filled buffers are queued.
    #[must_use]
    pub fn raw_queue_is_empty(&self) -> bool {
        self.filled_rx.is_empty()
    }

    /// Returns a consumed buffer to the empty set, cleared.
    pub fn release(&self, mut buf: JsonBuffer) {
        buf.reset();
        // Bounded at pool size and every buffer has exactly one owner,
        // so the send cannot block or fail while the pool is alive.
        let _ = self.empty_tx.send(buf);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffers", &self.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("empty_queued", &self.empty_rx.len())
            .field("filled_queued", &self.filled_rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapAllocator;
    use crate::seq::SeqRange;
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(10);

    fn pool(count: usize, capacity: usize) -> BufferPool {
        let allocator: AllocatorRef = Arc::new(HeapAllocator);
        BufferPool::new(&allocator, count, capacity).unwrap()
    }

    #[test]
    fn buffers_cycle_through_all_states() {
        let pool = pool(2, 128);

        let mut buf = pool.acquire_empty(TICK).unwrap();
        buf.push_record(br#"{"voltage":[1]}"#).unwrap();
        buf.set_seq_range(SeqRange::new(0, 0));
        pool.submit_filled(buf).unwrap();

        let claimed = pool.claim_filled(TICK).unwrap();
        assert_eq!(claimed.seq_range(), Some(SeqRange::new(0, 0)));
        assert!(claimed.recv_time().is_some());

        pool.release(claimed);

        // Both buffers are back in the empty set.
        assert!(pool.acquire_empty(TICK).is_some());
        assert!(pool.acquire_empty(TICK).is_some());
        assert!(pool.acquire_empty(TICK).is_none());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = pool(1, 64);
        let held = pool.acquire_empty(TICK).unwrap();
        assert!(pool.acquire_empty(TICK).is_none());
        pool.release(held);
        assert!(pool.acquire_empty(TICK).is_some());
    }

    #[test]
    fn claim_times_out_on_empty_queue() {
        let pool = pool(1, 64);
        assert!(pool.claim_filled(TICK).is_none());
        assert!(pool.try_claim_filled().is_none());
        assert!(pool.raw_queue_is_empty());
    }

    #[test]
    fn regions_match_buffer_count() {
        let pool = pool(3, 256);
        assert_eq!(pool.regions().len(), 3);
        assert!(pool.regions().iter().all(|r| r.len == 256));
    }

    #[test]
    fn zero_count_is_a_config_error() {
        let allocator: AllocatorRef = Arc::new(HeapAllocator);
        assert!(matches!(
            BufferPool::new(&allocator, 0, 64),
            Err(Error::Config(_))
        ));
    }
}
