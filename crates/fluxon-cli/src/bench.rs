//! Micro-benchmarks for isolated pipeline stages.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fluxon_core::convert::{self, Converter, SerializedBatch};
use fluxon_core::error::{Error, Result};
use fluxon_core::{BufferPool, SeqRange};
use fluxon_connectors::PulsarProducer;
use fluxon_core::publish::BusProducer;

use crate::cli::{BenchClientArgs, BenchCommand, BenchConvertArgs, BenchPulsarArgs, BenchQueueArgs};

/// Dispatches a `bench` subcommand.
///
/// # Errors
///
/// The benched stage's error.
pub fn run(command: BenchCommand) -> Result<()> {
    match command {
        BenchCommand::Client(args) => bench_client(&args),
        BenchCommand::Convert(args) => bench_convert(&args),
        BenchCommand::Queue(args) => bench_queue(&args),
        BenchCommand::Pulsar(args) => bench_pulsar(&args),
    }
}

// ── Generation ─────────────────────────────────────────────────────

/// Generates battery-status records totalling roughly `approx_bytes`
/// (newlines included), deterministically from `seed`.
#[must_use]
pub fn generate_battery_records(seed: u64, approx_bytes: usize) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::new();
    let mut total = 0usize;
    while total < approx_bytes {
        let count = rng.gen_range(1..=16);
        let values: Vec<String> = (0..count)
            .map(|_| rng.gen_range(0u64..2048).to_string())
            .collect();
        let record = format!("{{\"voltage\":[{}]}}", values.join(","));
        total += record.len() + 1;
        records.push(record);
    }
    records
}

/// Packs records into pool buffers, assigning sequence numbers from
/// `seq_base`, and submits each buffer as it fills. Returns the number
/// of records submitted.
///
/// # Errors
///
/// `Error::Config` when a record does not fit an empty buffer, or when
/// no buffer frees up (a dead worker fleet).
pub fn fill_and_submit(pool: &BufferPool, records: &[String], seq_base: u64) -> Result<u64> {
    let mut next_seq = seq_base;
    let mut iter = records.iter().peekable();

    while iter.peek().is_some() {
        let mut buf = pool
            .acquire_empty(Duration::from_secs(5))
            .ok_or_else(|| Error::Config("no input buffer freed up within 5 s".into()))?;
        let mut count = 0u64;
        while let Some(record) = iter.peek() {
            if record.len() + 1 + buf.len() > buf.capacity() {
                break;
            }
            buf.push_record(record.as_bytes())?;
            iter.next();
            count += 1;
        }
        if count == 0 {
            pool.release(buf);
            return Err(Error::Config(format!(
                "a generated record does not fit the {} byte input buffers; \
                 increase the input capacity",
                pool.buffer_capacity()
            )));
        }
        buf.set_seq_range(SeqRange::new(next_seq, next_seq + count - 1));
        next_seq += count;
        pool.submit_filled(buf)?;
    }
    Ok(next_seq - seq_base)
}

// ── bench convert ──────────────────────────────────────────────────

fn bench_convert(args: &BenchConvertArgs) -> Result<()> {
    let mut opts = args.converter.to_options(fluxon_core::publish::DEFAULT_MAX_MESSAGE_SIZE)?;
    if args.parse_only {
        opts.mock_resize = true;
        opts.mock_serialize = true;
    }

    let (ipc_tx, ipc_rx) = bounded::<SerializedBatch>(64 * 1024);
    let mut converter = Converter::make(&opts, ipc_tx)?;
    let pool = converter.pool();
    let num_threads = converter.num_threads();

    let target_bytes = if args.total_json_bytes == 0 {
        pool.len() * pool.buffer_capacity()
    } else {
        args.total_json_bytes
    };

    tracing::info!(seed = args.seed, target_bytes, "generating JSONs");
    let gen_start = Instant::now();
    let records = generate_battery_records(args.seed, target_bytes);
    let gen_time = gen_start.elapsed();
    let gen_bytes: usize = records.iter().map(|r| r.len() + 1).sum();
    tracing::info!(
        records = records.len(),
        bytes = gen_bytes,
        seconds = gen_time.as_secs_f64(),
        "generation done"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    converter.start(shutdown.clone())?;

    let convert_start = Instant::now();
    let mut ipc_messages = 0u64;
    let mut ipc_bytes = 0u64;
    for repeat in 0..args.repeats.max(1) {
        let seq_base = repeat as u64 * records.len() as u64;
        let submitted = fill_and_submit(&pool, &records, seq_base)?;

        let mut rows = 0u64;
        while rows < submitted {
            match ipc_rx.recv_timeout(Duration::from_secs(5)) {
                Ok(batch) => {
                    rows += batch.record_count();
                    ipc_messages += 1;
                    ipc_bytes += batch.byte_size() as u64;
                }
                Err(_) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    return Err(Error::Internal("conversion stalled for 5 s".into()));
                }
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    let convert_time = convert_start.elapsed();

    shutdown.store(true, Ordering::Relaxed);
    let stats = converter.finish();
    let total = convert::aggregate(&stats);

    let json_mb = total.json_bytes as f64 / 1e6;
    let json_mj = total.num_jsons as f64 / 1e6;
    let ipc_mb = ipc_bytes as f64 / 1e6;
    let convert_s = convert_time.as_secs_f64().max(f64::EPSILON);
    tracing::info!("End-to-end conversion:");
    tracing::info!("  IPC messages     : {ipc_messages}");
    tracing::info!("  Time             : {:.6} s", convert_time.as_secs_f64());
    tracing::info!("  Throughput (in)  : {:.3} MB/s", json_mb / convert_s);
    tracing::info!("  Throughput (out) : {:.3} MB/s", ipc_mb / convert_s);
    tracing::info!("  Throughput       : {:.3} MJ/s", json_mj / convert_s);
    convert::log_stats(&total, num_threads);

    if let Some(path) = &args.metrics {
        convert::write_metrics_csv(path, &stats)?;
    }
    total.status
}

// ── bench queue ────────────────────────────────────────────────────

fn bench_queue(args: &BenchQueueArgs) -> Result<()> {
    let (tx, rx) = bounded::<(usize, Instant)>(args.num_items.max(1));

    let consumer = std::thread::spawn(move || {
        let mut latencies = Vec::new();
        while let Ok((item, sent)) = rx.recv() {
            latencies.push((item, sent.elapsed()));
        }
        latencies
    });

    // Give the consumer a moment to block on the queue.
    std::thread::sleep(Duration::from_millis(10));

    let mut enqueue_times = Vec::with_capacity(args.num_items);
    for item in 0..args.num_items {
        let start = Instant::now();
        tx.send((item, start))
            .map_err(|_| Error::Internal("queue consumer vanished".into()))?;
        enqueue_times.push(start.elapsed());
    }
    drop(tx);

    let dequeue_times = consumer
        .join()
        .map_err(|_| Error::Internal("queue consumer panicked".into()))?;

    println!("Item,Enqueue,Dequeue");
    for (enqueue, (item, dequeue)) in enqueue_times.iter().zip(&dequeue_times) {
        println!(
            "{item},{:.9},{:.9}",
            enqueue.as_secs_f64(),
            dequeue.as_secs_f64()
        );
    }
    Ok(())
}

// ── bench client ───────────────────────────────────────────────────

fn bench_client(args: &BenchClientArgs) -> Result<()> {
    let addr = format!("{}:{}", args.client.host, args.client.port);
    let mut stream = std::net::TcpStream::connect(&addr)
        .map_err(|e| Error::Ingress(format!("cannot connect to {addr}: {e}")))?;

    let mut chunk = vec![0u8; 64 * 1024];
    let mut bytes = 0u64;
    let mut records = 0u64;
    let start = Instant::now();
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                bytes += n as u64;
                records += chunk[..n].iter().filter(|&&b| b == b'\n').count() as u64;
            }
            Err(e) => return Err(Error::Ingress(format!("socket read failed: {e}"))),
        }
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);

    tracing::info!("TCP client:");
    tracing::info!("  JSONs received : {records}");
    tracing::info!("  Bytes received : {bytes}");
    tracing::info!("  Time           : {elapsed:.6} s");
    tracing::info!("  Throughput     : {:.3} MJ/s", records as f64 / 1e6 / elapsed);
    tracing::info!("  Throughput     : {:.3} MB/s", bytes as f64 / 1e6 / elapsed);
    Ok(())
}

// ── bench pulsar ───────────────────────────────────────────────────

fn bench_pulsar(args: &BenchPulsarArgs) -> Result<()> {
    let opts = args.pulsar.to_options();
    opts.log();
    let mut producer = PulsarProducer::connect(&opts)?;

    let payload = vec![0u8; args.message_size];
    let start = Instant::now();
    for _ in 0..args.num_messages {
        producer.send(&payload)?;
    }
    let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);

    let total_mb = (args.num_messages * args.message_size) as f64 / 1e6;
    tracing::info!("Pulsar publish:");
    tracing::info!("  Messages   : {}", args.num_messages);
    tracing::info!("  Size       : {} B", args.message_size);
    tracing::info!("  Time       : {elapsed:.6} s");
    tracing::info!("  Throughput : {:.3} msg/s", args.num_messages as f64 / elapsed);
    tracing::info!("  Throughput : {:.3} MB/s", total_mb / elapsed);
    Ok(())
}
