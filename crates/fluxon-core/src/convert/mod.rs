//! The conversion pipeline: parse → resize → serialize → enqueue.

mod converter;
mod resizer;
mod serializer;
mod stats;

pub use converter::{Converter, ConverterOptions};
pub use resizer::{MockResizer, Resize, Resizer};
pub use serializer::{
    encoded_stream_size, MockSerializer, Serialize, SerializedBatch, Serializer,
};
pub use stats::{aggregate, log_stats, write_metrics_csv, StageTimes, Stats};

/// Batches after the resize stage; each one's encoding fits the
/// message-size ceiling.
pub type ResizedBatches = Vec<crate::parse::ParsedBatch>;
