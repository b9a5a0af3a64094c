//! Converter-level pipeline scenarios: resize behavior, shutdown
//! semantics, and the accelerator fleet over the simulated device.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow_array::cast::AsArray;
use arrow_array::types::UInt64Type;
use arrow_array::RecordBatch;
use crossbeam_channel::{bounded, Receiver};

use fluxon_core::alloc::{AllocatorRef, HeapAllocator};
use fluxon_core::convert::{
    aggregate, Converter, ConverterOptions, Resize, Resizer, Serialize, SerializedBatch,
    Serializer,
};
use fluxon_core::error::Error;
use fluxon_core::parse::device::SimPlatform;
use fluxon_core::parse::{
    BatteryOptions, BatteryParserContext, Parser, ParserContext, ParserOptions, SoftwareOptions,
};
use fluxon_core::pool::MemoryRegion;
use fluxon_core::{BufferPool, JsonBuffer, SeqRange};

fn software_converter(
    threads: usize,
    max_rows: usize,
    max_message_size: usize,
) -> (Converter, Receiver<SerializedBatch>) {
    let (tx, rx) = bounded(1024);
    let opts = ConverterOptions {
        num_threads: threads,
        input_capacity: 256 * 1024,
        max_batch_rows: max_rows,
        max_message_size,
        parser: ParserOptions::Software(SoftwareOptions::default()),
        ..ConverterOptions::default()
    };
    (Converter::make(&opts, tx).unwrap(), rx)
}

fn submit_records(pool: &BufferPool, records: &[String], first_seq: u64) {
    let mut buf = pool.acquire_empty(Duration::from_secs(1)).unwrap();
    for record in records {
        buf.push_record(record.as_bytes()).unwrap();
    }
    buf.set_seq_range(SeqRange::new(
        first_seq,
        first_seq + records.len() as u64 - 1,
    ));
    pool.submit_filled(buf).unwrap();
}

fn decode(payload: &[u8]) -> RecordBatch {
    let mut reader = arrow_ipc::reader::StreamReader::try_new(Cursor::new(payload), None).unwrap();
    let batch = reader.next().unwrap().unwrap();
    assert!(reader.next().is_none(), "expected one batch per message");
    batch
}

/// Collects `n` batches, sorted by first sequence number.
fn collect_sorted(rx: &Receiver<SerializedBatch>, expected_rows: u64) -> Vec<SerializedBatch> {
    let mut batches = Vec::new();
    let mut rows = 0;
    while rows < expected_rows {
        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rows += batch.record_count();
        batches.push(batch);
    }
    batches.sort();
    batches
}

/// Asserts the ranges partition `[first, last]` with no gaps or
/// overlap.
fn assert_partition(batches: &[SerializedBatch], first: u64, last: u64) {
    let mut next = first;
    for batch in batches {
        assert_eq!(batch.seq_range.first, next, "gap or overlap at {next}");
        next = batch.seq_range.last + 1;
    }
    assert_eq!(next, last + 1);
}

#[test]
fn resize_trigger_splits_batches_under_the_ceiling() {
    // One parser invocation producing a batch well over the ceiling.
    let records: Vec<String> = (0..64)
        .map(|i| format!("{{\"voltage\":[{},{},{},{},{},{},{},{}]}}", i, i, i, i, i, i, i, i))
        .collect();

    // Find the full encoding size first, then pick a ceiling around
    // two-thirds of it so the resizer has to split.
    let (probe, probe_rx) = software_converter(1, 4096, usize::MAX >> 1);
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut probe_converter = probe;
    probe_converter.start(shutdown.clone()).unwrap();
    submit_records(&probe_converter.pool(), &records, 0);
    let full = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let full_size = full.byte_size();
    shutdown.store(true, Ordering::Relaxed);
    probe_converter.finish();

    let ceiling = full_size * 2 / 3;
    let (mut converter, rx) = software_converter(1, 4096, ceiling);
    let shutdown = Arc::new(AtomicBool::new(false));
    converter.start(shutdown.clone()).unwrap();
    submit_records(&converter.pool(), &records, 0);

    let batches = collect_sorted(&rx, 64);
    assert!(batches.len() >= 2, "expected a split, got one batch");
    assert_partition(&batches, 0, 63);

    // Each message respects the ceiling, and the concatenated rows
    // equal the pre-resize batch in order.
    let mut row = 0u64;
    for batch in &batches {
        assert!(batch.byte_size() <= ceiling);
        let decoded = decode(&batch.payload);
        let seq = decoded.column(0).as_primitive::<UInt64Type>();
        for k in 0..decoded.num_rows() {
            assert_eq!(seq.value(k), row);
            row += 1;
        }
    }
    assert_eq!(row, 64);

    shutdown.store(true, Ordering::Relaxed);
    let stats = aggregate(&converter.finish());
    assert!(stats.status.is_ok());
    assert_eq!(stats.num_jsons, 64);
}

#[test]
fn shutdown_before_input_exits_all_workers_promptly() {
    let (mut converter, _rx) = software_converter(4, 1024, 1 << 20);
    let shutdown = Arc::new(AtomicBool::new(true));
    converter.start(shutdown.clone()).unwrap();

    let start = Instant::now();
    let stats = converter.finish();
    assert!(start.elapsed() < Duration::from_secs(1));

    assert_eq!(stats.len(), 4);
    let total = aggregate(&stats);
    assert!(total.status.is_ok());
    assert_eq!(total.num_jsons, 0);
    assert_eq!(total.num_buffers, 0);
    assert_eq!(total.num_ipc, 0);
}

#[test]
fn oversized_single_record_fails_with_encode_error() {
    let ceiling = 512;
    let (mut converter, _rx) = software_converter(1, 1024, ceiling);
    let shutdown = Arc::new(AtomicBool::new(false));
    converter.start(shutdown.clone()).unwrap();

    let values: Vec<String> = (0..2048u64).map(|v| v.to_string()).collect();
    let record = format!("{{\"voltage\":[{}]}}", values.join(","));
    submit_records(&converter.pool(), &[record], 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !shutdown.load(Ordering::Relaxed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(shutdown.load(Ordering::Relaxed));

    let stats = aggregate(&converter.finish());
    assert!(matches!(stats.status, Err(Error::Encode(_))));
}

#[test]
fn accelerator_fleet_partitions_the_sequence_space() {
    // 4 workers, one buffer and kernel instance each, 4 records per
    // buffer: 16 rows in total over the simulated device, which panics
    // if two workers ever interleave a configure sequence.
    const WORKERS: usize = 4;
    const RECORDS_PER_BUFFER: u64 = 4;

    let allocator: AllocatorRef = Arc::new(HeapAllocator);
    let pool = BufferPool::new(&allocator, WORKERS, 4096).unwrap();

    let mut buffers: Vec<JsonBuffer> = Vec::new();
    for b in 0..WORKERS as u64 {
        let mut buf = pool.acquire_empty(Duration::from_secs(1)).unwrap();
        let first = b * RECORDS_PER_BUFFER;
        for seq in first..first + RECORDS_PER_BUFFER {
            buf.push_record(format!("{{\"voltage\":[{seq},{seq}]}}").as_bytes())
                .unwrap();
        }
        buf.set_seq_range(SeqRange::new(first, first + RECORDS_PER_BUFFER - 1));
        buffers.push(buf);
    }

    let opts = BatteryOptions {
        num_parsers: WORKERS,
        output_capacity: 4096,
        ..BatteryOptions::default()
    };
    let mut context =
        BatteryParserContext::with_platform(opts, SimPlatform::shared(3), allocator.clone())
            .unwrap();
    let regions: Vec<MemoryRegion> = buffers
        .iter()
        .map(|b| MemoryRegion {
            addr: b.addr(),
            len: b.capacity(),
        })
        .collect();
    context.init(&regions).unwrap();
    let parsers = context.parsers().unwrap();

    // One thread per parser, each running the full parse → resize →
    // serialize chain on its own buffer.
    let serialized: Vec<SerializedBatch> = std::thread::scope(|scope| {
        let handles: Vec<_> = parsers
            .into_iter()
            .zip(buffers)
            .map(|(mut parser, buf)| {
                scope.spawn(move || {
                    let parsed = parser.parse(std::slice::from_ref(&buf)).unwrap();
                    let resizer = Resizer::new(1024, 1 << 20);
                    let serializer = Serializer::new(1 << 20, false);
                    let mut out = Vec::new();
                    for batch in parsed {
                        out.extend(serializer.serialize(resizer.resize(batch).unwrap()).unwrap());
                    }
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let mut serialized = serialized;
    serialized.sort();
    let total_rows: u64 = serialized.iter().map(SerializedBatch::record_count).sum();
    assert_eq!(total_rows, 16);
    assert_partition(&serialized, 0, 15);

    // Round trip: the sequence column carries ingress order.
    for batch in &serialized {
        let decoded = decode(&batch.payload);
        let seq = decoded.column(0).as_primitive::<UInt64Type>();
        let list = decoded.column(1).as_list::<i32>();
        for k in 0..decoded.num_rows() {
            let expected = batch.seq_range.first + k as u64;
            assert_eq!(seq.value(k), expected);
            assert_eq!(
                &list.value(k).as_primitive::<UInt64Type>().values()[..],
                &[expected, expected]
            );
        }
    }
}

#[test]
fn buffers_return_to_the_pool_after_conversion() {
    let (mut converter, rx) = software_converter(2, 1024, 1 << 20);
    let pool = converter.pool();
    let shutdown = Arc::new(AtomicBool::new(false));
    converter.start(shutdown.clone()).unwrap();

    for round in 0..8u64 {
        submit_records(&pool, &[format!("{{\"voltage\":[{round}]}}")], round);
    }
    let batches = collect_sorted(&rx, 8);
    assert_partition(&batches, 0, 7);

    shutdown.store(true, Ordering::Relaxed);
    converter.finish();

    // Steady state: every buffer is back in the empty pool.
    let count = pool.len();
    for _ in 0..count {
        assert!(pool.acquire_empty(Duration::from_millis(100)).is_some());
    }
}
