//! The convert orchestrator: a fleet of worker threads turning filled
//! JSON buffers into serialized bus messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arrow_schema::SchemaRef;
use crossbeam_channel::Sender;

use crate::buffer::JsonBuffer;
use crate::error::{Error, Result};
use crate::latency::{Checkpoint, TimePoints};
use crate::parse::{make_context, Parser, ParserContext, ParserOptions};
use crate::pool::BufferPool;
use crate::publish::DEFAULT_MAX_MESSAGE_SIZE;
use crate::QUEUE_POLL;

use super::resizer::{MockResizer, Resize, Resizer};
use super::serializer::{MockSerializer, Serialize, SerializedBatch, Serializer};
use super::stats::Stats;

/// Conversion pipeline configuration.
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    /// Requested worker count; backends may override.
    pub num_threads: usize,
    /// Requested buffer count; zero derives it from the worker count,
    /// and backends may override.
    pub num_buffers: usize,
    /// Total capacity of all input buffers, split evenly.
    pub input_capacity: usize,
    /// Maximum rows per output batch.
    pub max_batch_rows: usize,
    /// Maximum encoded message size in bytes.
    pub max_message_size: usize,
    /// Upper bound on filled buffers claimed per parser invocation.
    pub max_buffers_per_claim: usize,
    /// Replace the resize stage with a pass-through (benchmarks).
    pub mock_resize: bool,
    /// Replace the serialize stage with an empty-payload stand-in
    /// (benchmarks).
    pub mock_serialize: bool,
    /// Parser backend selection.
    pub parser: ParserOptions,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            num_threads: 1,
            num_buffers: 0,
            input_capacity: 16 * 1024 * 1024,
            max_batch_rows: 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_buffers_per_claim: 1,
            mock_resize: false,
            mock_serialize: false,
            parser: ParserOptions::Software(crate::parse::SoftwareOptions::default()),
        }
    }
}

/// Everything one worker thread owns.
struct WorkerSetup {
    parser: Box<dyn Parser>,
    resizer: Box<dyn Resize>,
    serializer: Box<dyn Serialize>,
}

/// The convert orchestrator.
///
/// `make` builds the parser context, sizes the fleet and the buffer
/// pool to the backend's constraints, and registers the pool with the
/// backend. `start` spawns the workers; `finish` joins them and hands
/// back their stats.
pub struct Converter {
    pool: Arc<BufferPool>,
    output_schema: SchemaRef,
    input_schema: SchemaRef,
    workers: Vec<WorkerSetup>,
    handles: Vec<std::thread::JoinHandle<Stats>>,
    out: Sender<SerializedBatch>,
    max_buffers_per_claim: usize,
}

impl Converter {
    /// Builds the conversion pipeline around `out`.
    ///
    /// # Errors
    ///
    /// `Error::Config` for invalid options, backend errors otherwise.
    pub fn make(opts: &ConverterOptions, out: Sender<SerializedBatch>) -> Result<Self> {
        if opts.num_threads == 0 {
            return Err(Error::Config("conversion requires at least one thread".into()));
        }
        if opts.max_buffers_per_claim == 0 {
            return Err(Error::Config("buffers per claim must be non-zero".into()));
        }

        let mut context = make_context(&opts.parser, opts.num_threads)?;

        let num_threads = context.check_thread_count(opts.num_threads);
        if num_threads != opts.num_threads {
            tracing::warn!(
                requested = opts.num_threads,
                using = num_threads,
                "parser backend overrides the thread count"
            );
        }

        let requested_buffers = if opts.num_buffers == 0 {
            num_threads
        } else {
            opts.num_buffers
        };
        let num_buffers = context.check_buffer_count(requested_buffers);
        if num_buffers != requested_buffers {
            tracing::warn!(
                requested = requested_buffers,
                using = num_buffers,
                "parser backend overrides the buffer count"
            );
        }

        let buffer_capacity = opts.input_capacity / num_buffers;
        if buffer_capacity == 0 {
            return Err(Error::Config(format!(
                "input capacity of {} bytes is too small for {num_buffers} buffers",
                opts.input_capacity
            )));
        }

        let pool = Arc::new(BufferPool::new(
            &context.allocator(),
            num_buffers,
            buffer_capacity,
        )?);
        context.init(pool.regions())?;

        let parsers = context.parsers()?;
        if parsers.len() != num_threads {
            return Err(Error::Internal(format!(
                "backend produced {} parsers for {num_threads} workers",
                parsers.len()
            )));
        }

        let annotate_seq = !opts.parser.seq_column();
        let workers = parsers
            .into_iter()
            .map(|parser| {
                let resizer: Box<dyn Resize> = if opts.mock_resize {
                    Box::new(MockResizer)
                } else {
                    Box::new(Resizer::new(opts.max_batch_rows, opts.max_message_size))
                };
                let serializer: Box<dyn Serialize> = if opts.mock_serialize {
                    Box::new(MockSerializer)
                } else {
                    Box::new(Serializer::new(opts.max_message_size, annotate_seq))
                };
                WorkerSetup {
                    parser,
                    resizer,
                    serializer,
                }
            })
            .collect();

        Ok(Self {
            pool,
            output_schema: context.output_schema(),
            input_schema: context.input_schema(),
            workers,
            handles: Vec::new(),
            out,
            max_buffers_per_claim: opts.max_buffers_per_claim,
        })
    }

    /// The buffer pool shared with ingress.
    #[must_use]
    pub fn pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Schema of the published batches.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    /// Schema of the raw input as the backend sees it.
    #[must_use]
    pub fn input_schema(&self) -> SchemaRef {
        self.input_schema.clone()
    }

    /// Number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.workers.len() + self.handles.len()
    }

    /// Spawns the worker fleet.
    ///
    /// # Errors
    ///
    /// `Error::Internal` if a worker thread cannot be spawned.
    pub fn start(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        for (id, worker) in self.workers.drain(..).enumerate() {
            let pool = self.pool.clone();
            let out = self.out.clone();
            let shutdown = shutdown.clone();
            let max_claim = self.max_buffers_per_claim;
            let handle = std::thread::Builder::new()
                .name(format!("convert-{id}"))
                .spawn(move || convert_worker(id, worker, &pool, &out, &shutdown, max_claim))
                .map_err(|e| Error::Internal(format!("cannot spawn convert worker: {e}")))?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Joins all workers and returns their stats, one per worker.
    #[must_use]
    pub fn finish(&mut self) -> Vec<Stats> {
        self.handles
            .drain(..)
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    let mut stats = Stats::default();
                    stats.status = Err(Error::Internal("convert worker panicked".into()));
                    stats
                })
            })
            .collect()
    }
}

/// One worker: claim buffers, parse, resize, serialize, enqueue.
fn convert_worker(
    id: usize,
    mut worker: WorkerSetup,
    pool: &BufferPool,
    out: &Sender<SerializedBatch>,
    shutdown: &AtomicBool,
    max_claim: usize,
) -> Stats {
    let thread_start = Instant::now();
    let mut stats = Stats::default();
    tracing::debug!(worker = id, "convert worker spawned");

    while !shutdown.load(Ordering::Relaxed) {
        let Some(first) = pool.claim_filled(QUEUE_POLL) else {
            continue;
        };
        let mut buffers = vec![first];
        while buffers.len() < max_claim {
            match pool.try_claim_filled() {
                Some(buf) => buffers.push(buf),
                None => break,
            }
        }

        if let Err(e) = convert_once(&mut worker, buffers, pool, out, &mut stats) {
            tracing::error!(worker = id, error = %e, "convert worker failed; shutting down");
            stats.status = Err(e);
            shutdown.store(true, Ordering::Relaxed);
            break;
        }
    }

    stats.t.thread = thread_start.elapsed();
    tracing::debug!(worker = id, "convert worker terminating");
    stats
}

/// Runs one claim's worth of buffers through all stages.
fn convert_once(
    worker: &mut WorkerSetup,
    buffers: Vec<JsonBuffer>,
    pool: &BufferPool,
    out: &Sender<SerializedBatch>,
    stats: &mut Stats,
) -> Result<()> {
    let mut time = TimePoints::default();
    if let Some(earliest) = buffers.iter().filter_map(JsonBuffer::recv_time).min() {
        time.set(Checkpoint::Received, earliest);
    }

    let stage_start = Instant::now();
    let parsed = worker.parser.parse(&buffers)?;
    stats.t.parse += stage_start.elapsed();
    time.mark(Checkpoint::Parsed);

    for buf in &buffers {
        stats.json_bytes += buf.len() as u64;
    }
    stats.num_buffers += buffers.len() as u64;
    for buf in buffers {
        pool.release(buf);
    }
    for batch in &parsed {
        stats.num_jsons += batch.seq_range.count();
    }

    let stage_start = Instant::now();
    let mut resized = Vec::new();
    for batch in parsed {
        resized.extend(worker.resizer.resize(batch)?);
    }
    stats.t.resize += stage_start.elapsed();
    time.mark(Checkpoint::Resized);

    let stage_start = Instant::now();
    let serialized = worker.serializer.serialize(resized)?;
    stats.t.serialize += stage_start.elapsed();
    time.mark(Checkpoint::Serialized);

    stats.num_ipc += serialized.len() as u64;
    let stage_start = Instant::now();
    for mut batch in serialized {
        stats.ipc_bytes += batch.byte_size() as u64;
        batch.time = time;
        tracing::trace!(range = %batch.seq_range, bytes = batch.byte_size(), "enqueueing IPC message");
        out.send(batch)
            .map_err(|_| Error::Internal("serialized-batch queue disconnected".into()))?;
    }
    stats.t.enqueue += stage_start.elapsed();
    Ok(())
}
