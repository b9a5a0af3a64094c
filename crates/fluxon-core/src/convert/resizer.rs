//! Splitting of parsed batches under the bus's message-size ceiling.

use crate::error::{Error, Result};
use crate::parse::ParsedBatch;

use super::serializer::encoded_stream_size;
use super::ResizedBatches;

/// Headroom reserved for the per-message sequence-range schema metadata
/// the serializer may attach after resizing.
const SEQ_METADATA_SLACK: usize = 96;

/// Resize stage of one convert worker.
pub trait Resize: Send {
    /// Splits `input` into batches whose encodings fit the ceiling.
    ///
    /// Splits slice consecutive row ranges, each inheriting the
    /// corresponding contiguous sub-range of the parent sequence range.
    /// Batches are never coalesced across parser invocations.
    fn resize(&self, input: ParsedBatch) -> Result<ResizedBatches>;
}

/// Splits batches by a row cap and by measured encoded size.
pub struct Resizer {
    max_rows: usize,
    max_message_size: usize,
}

impl Resizer {
    /// Creates a resizer bounded by `max_rows` rows per batch and
    /// `max_message_size` encoded bytes per message.
    #[must_use]
    pub fn new(max_rows: usize, max_message_size: usize) -> Self {
        Self {
            max_rows: max_rows.max(1),
            max_message_size,
        }
    }

    fn size_budget(&self) -> usize {
        self.max_message_size.saturating_sub(SEQ_METADATA_SLACK)
    }

    /// Recursively halves a row-capped slice until its encoding fits.
    fn fit(&self, slice: ParsedBatch, out: &mut ResizedBatches) -> Result<()> {
        let encoded = encoded_stream_size(&slice.batch)?;
        if encoded <= self.size_budget() {
            out.push(slice);
            return Ok(());
        }
        let rows = slice.batch.num_rows();
        if rows <= 1 {
            return Err(Error::Encode(format!(
                "a single row encodes to {encoded} bytes, exceeding the maximum \
                 message size of {} bytes",
                self.max_message_size
            )));
        }

        let left_rows = rows / 2;
        let left = ParsedBatch::new(
            slice.batch.slice(0, left_rows),
            slice.seq_range.slice(0, left_rows as u64),
        )?;
        let right = ParsedBatch::new(
            slice.batch.slice(left_rows, rows - left_rows),
            slice
                .seq_range
                .slice(left_rows as u64, (rows - left_rows) as u64),
        )?;
        self.fit(left, out)?;
        self.fit(right, out)
    }
}

impl Resize for Resizer {
    fn resize(&self, input: ParsedBatch) -> Result<ResizedBatches> {
        let rows = input.batch.num_rows();
        let mut out = ResizedBatches::new();
        if rows == 0 {
            return Err(Error::Internal("cannot resize an empty batch".into()));
        }

        let mut offset = 0usize;
        while offset < rows {
            let len = self.max_rows.min(rows - offset);
            let slice = ParsedBatch::new(
                input.batch.slice(offset, len),
                input.seq_range.slice(offset as u64, len as u64),
            )?;
            self.fit(slice, &mut out)?;
            offset += len;
        }
        Ok(out)
    }
}

/// Resize stand-in that passes batches through untouched, for
/// parse-only benchmarking.
pub struct MockResizer;

impl Resize for MockResizer {
    fn resize(&self, input: ParsedBatch) -> Result<ResizedBatches> {
        Ok(vec![input])
    }
}
