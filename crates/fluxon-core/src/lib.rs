//! Core of the fluxon pipeline: newline-delimited JSON in, bounded
//! Arrow IPC messages out.
//!
//! The pipeline is a set of plain OS threads handing owned values
//! through bounded queues:
//!
//! ```text
//! ingress → [raw-JSON queue] → parser workers → resize → serialize
//!         → [serialized-batch queue] → publisher → bus
//! ```
//!
//! Input buffers come from a fixed [`pool`]; parser backends live
//! behind the [`parse::ParserContext`] factory; the
//! [`convert::Converter`] owns the worker fleet; [`publish`] drains the
//! output queue into a [`publish::BusProducer`]. A single atomic
//! shutdown flag is observed by every timed queue pop.

pub mod alloc;
pub mod buffer;
pub mod convert;
pub mod error;
pub mod latency;
pub mod parse;
pub mod pool;
pub mod publish;
pub mod seq;

pub use buffer::JsonBuffer;
pub use error::{Error, Result};
pub use pool::BufferPool;
pub use seq::SeqRange;

use std::time::Duration;

/// Wait used by every timed queue pop, so a blocked thread observes the
/// shutdown flag within one period.
pub const QUEUE_POLL: Duration = Duration::from_millis(1);
