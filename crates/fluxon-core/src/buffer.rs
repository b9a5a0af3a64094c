//! Fixed-capacity buffers holding newline-delimited JSON records.

use std::time::Instant;

use crate::alloc::Allocation;
use crate::error::{Error, Result};
use crate::seq::SeqRange;

/// A fixed-capacity byte region holding zero or more newline-terminated
/// JSON records, plus the sequence range those records were assigned at
/// ingress and the instant the buffer was filled.
///
/// Buffers are owned by the pool and move through the pipeline as
/// values: pool → ingress (mutable fill) → raw queue → exactly one
/// parser worker (read-only) → pool. A record never spans two buffers.
#[derive(Debug)]
pub struct JsonBuffer {
    data: Allocation,
    len: usize,
    seq_range: Option<SeqRange>,
    recv_time: Option<Instant>,
}

impl JsonBuffer {
    /// Wraps an allocation as an empty buffer.
    #[must_use]
    pub fn new(data: Allocation) -> Self {
        Self {
            data,
            len: 0,
            seq_range: None,
            recv_time: None,
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of filled bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are filled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled prefix.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The unfilled suffix, for ingress to read into.
    pub fn space(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    /// Marks `n` bytes of [`space`](Self::space) as filled.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining capacity.
    pub fn advance(&mut self, n: usize) {
        assert!(self.len + n <= self.capacity(), "advance past capacity");
        self.len += n;
    }

    /// Appends one record plus its newline terminator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Ingress` if the record does not fit.
    pub fn push_record(&mut self, record: &[u8]) -> Result<()> {
        if self.len + record.len() + 1 > self.capacity() {
            return Err(Error::Ingress(format!(
                "record of {} bytes does not fit in buffer with {} bytes free",
                record.len(),
                self.capacity() - self.len
            )));
        }
        self.data[self.len..self.len + record.len()].copy_from_slice(record);
        self.len += record.len();
        self.data[self.len] = b'\n';
        self.len += 1;
        Ok(())
    }

    /// Shortens the filled prefix to `len` bytes. Ingress uses this to
    /// carry a trailing partial record over to the next buffer.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the filled length.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len, "truncate beyond filled length");
        self.len = len;
    }

    /// The sequence range of the held records, if any were assigned.
    #[must_use]
    pub fn seq_range(&self) -> Option<SeqRange> {
        self.seq_range
    }

    /// Tags the buffer with the sequence range of its records.
    pub fn set_seq_range(&mut self, range: SeqRange) {
        self.seq_range = Some(range);
    }

    /// The instant the buffer was handed to the raw queue, if set.
    #[must_use]
    pub fn recv_time(&self) -> Option<Instant> {
        self.recv_time
    }

    /// Stamps the receive instant.
    pub fn mark_received(&mut self, at: Instant) {
        self.recv_time = Some(at);
    }

    /// The stable host address of the backing region.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.data.addr()
    }

    /// Clears contents, range, and timestamps, returning the buffer to
    /// its empty state. The backing allocation is retained.
    pub fn reset(&mut self) {
        self.len = 0;
        self.seq_range = None;
        self.recv_time = None;
    }
}
