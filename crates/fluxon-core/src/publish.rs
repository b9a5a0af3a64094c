//! The publisher: a single consumer draining serialized batches into
//! the message bus.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::convert::SerializedBatch;
use crate::error::Result;
use crate::latency::{Checkpoint, LatencyMeasurement};
use crate::QUEUE_POLL;

/// Default maximum message size: the Pulsar broker default of 5 MiB,
/// less headroom for the message envelope.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024 - 10 * 1024;

/// The message bus as the pipeline sees it: one opaque byte buffer per
/// message.
pub trait BusProducer: Send {
    /// Sends one message, blocking until the bus accepts it.
    fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// Statistics of the publisher thread.
#[derive(Debug, Clone)]
pub struct PublishStats {
    /// IPC messages published.
    pub num_ipc_published: u64,
    /// JSON records published.
    pub num_jsons_published: u64,
    /// Time spent inside bus sends.
    pub publish_time: Duration,
    /// Total time in the publisher thread.
    pub thread_time: Duration,
    /// Time from pipeline start to the publication of the batch holding
    /// the latency reference sequence number.
    pub end_to_end: Option<Duration>,
    /// Terminal status of the publisher.
    pub status: Result<()>,
}

impl Default for PublishStats {
    fn default() -> Self {
        Self {
            num_ipc_published: 0,
            num_jsons_published: 0,
            publish_time: Duration::ZERO,
            thread_time: Duration::ZERO,
            end_to_end: None,
            status: Ok(()),
        }
    }
}

/// Logs publishing throughput at info level.
pub fn log_publish_stats(stats: &PublishStats) {
    let mjs = stats.num_jsons_published as f64 / 1e6;
    let publish_s = stats.publish_time.as_secs_f64().max(f64::EPSILON);
    tracing::info!("Publish:");
    tracing::info!("  JSONs published : {}", stats.num_jsons_published);
    tracing::info!("  IPC messages    : {}", stats.num_ipc_published);
    tracing::info!("  Publish time    : {:.6} s", stats.publish_time.as_secs_f64());
    tracing::info!("  Thread time     : {:.6} s", stats.thread_time.as_secs_f64());
    tracing::info!("  Throughput      : {:.3} MJ/s", mjs / publish_s);
    if let Some(e2e) = stats.end_to_end {
        tracing::info!("  First-batch end-to-end latency : {:.6} s", e2e.as_secs_f64());
    }
}

/// Drains the serialized-batch queue into the bus until shutdown.
///
/// Increments `published` by each batch's record count after a
/// successful send; the driver's termination predicate compares it to
/// the ingress record count. On a send failure the current batch is the
/// last: status records the error, the shutdown flag is raised, and the
/// thread exits.
pub fn publish_loop(
    mut producer: Box<dyn BusProducer>,
    queue: &Receiver<SerializedBatch>,
    shutdown: &AtomicBool,
    published: &AtomicU64,
    pipeline_start: Instant,
    latency_ref_seq: u64,
) -> (PublishStats, Vec<LatencyMeasurement>) {
    let thread_start = Instant::now();
    let mut stats = PublishStats::default();
    let mut latencies = Vec::new();

    loop {
        match queue.recv_timeout(QUEUE_POLL) {
            Ok(mut batch) => {
                let send_start = Instant::now();
                if let Err(e) = producer.send(&batch.payload) {
                    tracing::error!(error = %e, range = %batch.seq_range, "publish failed; shutting down");
                    stats.status = Err(e);
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                stats.publish_time += send_start.elapsed();
                batch.time.mark(Checkpoint::Published);

                published.fetch_add(batch.record_count(), Ordering::Relaxed);
                stats.num_ipc_published += 1;
                stats.num_jsons_published += batch.record_count();

                if stats.end_to_end.is_none() && batch.seq_range.contains(latency_ref_seq) {
                    stats.end_to_end = Some(pipeline_start.elapsed());
                }
                latencies.push(LatencyMeasurement {
                    seq: batch.seq_range,
                    time: batch.time,
                });
            }
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stats.thread_time = thread_start.elapsed();
    (stats, latencies)
}

/// In-memory producer that records every payload.
///
/// Stands in for the bus in tests and benches, the way the mock resize
/// and serialize stages stand in for their stages.
pub struct CollectingProducer {
    messages: Arc<Mutex<Vec<Bytes>>>,
}

impl CollectingProducer {
    /// Creates a producer and the shared handle its messages land in.
    #[must_use]
    pub fn new() -> (Self, Arc<Mutex<Vec<Bytes>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                messages: messages.clone(),
            },
            messages,
        )
    }
}

impl BusProducer for CollectingProducer {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.messages.lock().push(Bytes::copy_from_slice(payload));
        Ok(())
    }
}

/// Producer that fails every send, for error-path tests.
pub struct FailingProducer;

impl BusProducer for FailingProducer {
    fn send(&mut self, _payload: &[u8]) -> Result<()> {
        Err(crate::error::Error::Bus("producer is closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::TimePoints;
    use crate::seq::SeqRange;
    use crossbeam_channel::bounded;

    fn batch(first: u64, last: u64) -> SerializedBatch {
        let mut time = TimePoints::default();
        time.mark(Checkpoint::Received);
        SerializedBatch {
            payload: Bytes::from_static(b"payload"),
            seq_range: SeqRange::new(first, last),
            time,
        }
    }

    #[test]
    fn publishes_until_shutdown_and_counts_records() {
        let (tx, rx) = bounded(8);
        tx.send(batch(0, 4)).unwrap();
        tx.send(batch(5, 9)).unwrap();

        let (producer, messages) = CollectingProducer::new();
        let shutdown = AtomicBool::new(false);
        let published = AtomicU64::new(0);

        let handle = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                publish_loop(
                    Box::new(producer),
                    &rx,
                    &shutdown,
                    &published,
                    Instant::now(),
                    0,
                )
            });
            // Let the publisher drain, then stop it.
            while published.load(Ordering::Relaxed) < 10 {
                std::thread::yield_now();
            }
            shutdown.store(true, Ordering::Relaxed);
            worker.join().unwrap()
        });

        let (stats, latencies) = handle;
        assert!(stats.status.is_ok());
        assert_eq!(stats.num_ipc_published, 2);
        assert_eq!(stats.num_jsons_published, 10);
        assert_eq!(published.load(Ordering::Relaxed), 10);
        assert_eq!(messages.lock().len(), 2);
        assert_eq!(latencies.len(), 2);
        // The first batch contains the reference sequence number.
        assert!(stats.end_to_end.is_some());
    }

    #[test]
    fn send_failure_raises_shutdown() {
        let (tx, rx) = bounded(8);
        tx.send(batch(0, 0)).unwrap();

        let shutdown = AtomicBool::new(false);
        let published = AtomicU64::new(0);
        let (stats, latencies) = publish_loop(
            Box::new(FailingProducer),
            &rx,
            &shutdown,
            &published,
            Instant::now(),
            0,
        );

        assert!(matches!(stats.status, Err(crate::error::Error::Bus(_))));
        assert!(shutdown.load(Ordering::Relaxed));
        assert_eq!(published.load(Ordering::Relaxed), 0);
        assert!(latencies.is_empty());
    }

    #[test]
    fn exits_when_queue_disconnects() {
        let (tx, rx) = bounded::<SerializedBatch>(1);
        drop(tx);
        let shutdown = AtomicBool::new(false);
        let published = AtomicU64::new(0);
        let (stats, _) = publish_loop(
            Box::new(CollectingProducer::new().0),
            &rx,
            &shutdown,
            &published,
            Instant::now(),
            0,
        );
        assert!(stats.status.is_ok());
    }
}
