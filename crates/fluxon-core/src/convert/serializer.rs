//! Encoding of resized batches into Arrow IPC stream messages.

use bytes::Bytes;

use arrow_array::RecordBatch;

use crate::error::{Error, Result};
use crate::latency::TimePoints;
use crate::parse::{annotate_seq_metadata, ParsedBatch};
use crate::seq::SeqRange;

use super::ResizedBatches;

/// An encoded bus message plus the sequence range it covers.
///
/// Batches compare by `seq_range.first`, so consumers that need total
/// order can simply sort.
#[derive(Debug, Clone)]
pub struct SerializedBatch {
    /// The Arrow IPC stream bytes (schema-prefixed record batch).
    pub payload: Bytes,
    /// Ingress sequence range of the rows inside.
    pub seq_range: SeqRange,
    /// Latency checkpoints accumulated so far.
    pub time: TimePoints,
}

impl SerializedBatch {
    /// Encoded size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }

    /// Number of records inside.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.seq_range.count()
    }
}

impl PartialEq for SerializedBatch {
    fn eq(&self, other: &Self) -> bool {
        self.seq_range.first == other.seq_range.first
    }
}

impl Eq for SerializedBatch {}

impl PartialOrd for SerializedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SerializedBatch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq_range.first.cmp(&other.seq_range.first)
    }
}

/// Serialization stage of one convert worker.
pub trait Serialize: Send {
    /// Encodes every resized batch into a bus message.
    fn serialize(&self, batches: ResizedBatches) -> Result<Vec<SerializedBatch>>;
}

/// Encodes batches as Arrow IPC stream messages bounded by the bus's
/// maximum message size.
pub struct Serializer {
    max_message_size: usize,
    annotate_seq: bool,
}

impl Serializer {
    /// Creates a serializer with the given message ceiling. When
    /// `annotate_seq` is set (sequence column disabled), each message's
    /// schema metadata carries the batch's own sequence range.
    #[must_use]
    pub fn new(max_message_size: usize, annotate_seq: bool) -> Self {
        Self {
            max_message_size,
            annotate_seq,
        }
    }

    fn serialize_one(&self, batch: &ParsedBatch) -> Result<SerializedBatch> {
        let annotated;
        let to_encode = if self.annotate_seq {
            annotated = annotate_seq_metadata(&batch.batch, batch.seq_range);
            &annotated
        } else {
            &batch.batch
        };

        let payload = encode_stream(to_encode)?;
        if payload.len() > self.max_message_size {
            return Err(Error::Encode(format!(
                "IPC message of {} bytes exceeds the maximum message size of {} bytes; \
                 reduce the maximum rows per batch",
                payload.len(),
                self.max_message_size
            )));
        }

        Ok(SerializedBatch {
            payload: Bytes::from(payload),
            seq_range: batch.seq_range,
            time: TimePoints::default(),
        })
    }
}

impl Serialize for Serializer {
    fn serialize(&self, batches: ResizedBatches) -> Result<Vec<SerializedBatch>> {
        batches.iter().map(|b| self.serialize_one(b)).collect()
    }
}

/// Serialization stand-in that emits empty payloads, for parse-only
/// benchmarking.
pub struct MockSerializer;

impl Serialize for MockSerializer {
    fn serialize(&self, batches: ResizedBatches) -> Result<Vec<SerializedBatch>> {
        Ok(batches
            .into_iter()
            .map(|b| SerializedBatch {
                payload: Bytes::new(),
                seq_range: b.seq_range,
                time: TimePoints::default(),
            })
            .collect())
    }
}

/// Encodes a batch as a complete IPC stream (schema, batch, end marker).
fn encode_stream(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = arrow_ipc::writer::StreamWriter::try_new(&mut buf, batch.schema_ref())
        .map_err(|e| Error::Encode(format!("cannot start IPC stream: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| Error::Encode(format!("cannot encode record batch: {e}")))?;
    writer
        .finish()
        .map_err(|e| Error::Encode(format!("cannot finish IPC stream: {e}")))?;
    Ok(buf)
}

/// Counting sink for size probes.
#[derive(Default)]
struct CountingSink {
    written: usize,
}

impl std::io::Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The exact encoded IPC stream size of `batch`, without materializing
/// the message. The resizer uses this to keep its outputs under the
/// ceiling.
pub fn encoded_stream_size(batch: &RecordBatch) -> Result<usize> {
    let mut sink = CountingSink::default();
    let mut writer = arrow_ipc::writer::StreamWriter::try_new(&mut sink, batch.schema_ref())
        .map_err(|e| Error::Encode(format!("cannot start IPC stream: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| Error::Encode(format!("cannot encode record batch: {e}")))?;
    writer
        .finish()
        .map_err(|e| Error::Encode(format!("cannot finish IPC stream: {e}")))?;
    let sink = writer
        .into_inner()
        .map_err(|e| Error::Encode(format!("cannot finish IPC stream: {e}")))?;
    Ok(sink.written)
}
