//! End-to-end stream scenarios over a local TCP source and an
//! in-memory bus producer.

use std::io::{Cursor, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};

use arrow_array::cast::AsArray;
use arrow_array::types::UInt64Type;
use arrow_array::RecordBatch;

use fluxon_cli::stream::{run_pipeline, StreamOptions};
use fluxon_connectors::{ClientOptions, PulsarOptions};
use fluxon_core::convert::ConverterOptions;
use fluxon_core::error::Error;
use fluxon_core::parse::{ParserOptions, SoftwareOptions};
use fluxon_core::publish::CollectingProducer;

/// Serves `payload` once on an ephemeral port, then closes the
/// connection.
fn serve(payload: Vec<u8>) -> ClientOptions {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        socket.write_all(&payload).unwrap();
    });
    ClientOptions {
        host: "127.0.0.1".into(),
        port,
        seq_base: 0,
    }
}

fn options(client: ClientOptions, converter: ConverterOptions) -> StreamOptions {
    StreamOptions {
        client,
        pulsar: PulsarOptions::default(),
        converter,
        latency_file: None,
        metrics_file: None,
    }
}

fn software_converter(threads: usize, buffers: usize, input_capacity: usize) -> ConverterOptions {
    ConverterOptions {
        num_threads: threads,
        num_buffers: buffers,
        input_capacity,
        parser: ParserOptions::Software(SoftwareOptions::default()),
        ..ConverterOptions::default()
    }
}

fn decode(payload: &[u8]) -> RecordBatch {
    let mut reader = arrow_ipc::reader::StreamReader::try_new(Cursor::new(payload), None).unwrap();
    let batch = reader.next().unwrap().unwrap();
    assert!(reader.next().is_none());
    batch
}

#[test]
fn empty_stream_publishes_nothing_and_exits_cleanly() {
    let client = serve(Vec::new());
    let opts = options(client, software_converter(2, 0, 64 * 1024));
    let (producer, messages) = CollectingProducer::new();

    let report = run_pipeline(&opts, Box::new(producer)).unwrap();
    assert_eq!(report.received, 0);
    assert_eq!(report.publish.num_jsons_published, 0);
    assert_eq!(report.publish.num_ipc_published, 0);
    assert!(messages.lock().is_empty());
    assert!(report.publish.status.is_ok());
}

#[test]
fn single_record_round_trips_with_sequence_zero() {
    let client = serve(b"{\"voltage\":[1,2,3]}\n".to_vec());
    let opts = options(client, software_converter(1, 0, 64 * 1024));
    let (producer, messages) = CollectingProducer::new();

    let report = run_pipeline(&opts, Box::new(producer)).unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.publish.num_jsons_published, 1);
    assert_eq!(report.publish.num_ipc_published, 1);
    // The first published batch contains sequence number 0, so the
    // end-to-end latency timer stopped.
    assert!(report.publish.end_to_end.is_some());

    let messages = messages.lock();
    assert_eq!(messages.len(), 1);
    let batch = decode(&messages[0]);
    assert_eq!(batch.num_rows(), 1);

    let seq = batch.column(0).as_primitive::<UInt64Type>();
    assert_eq!(&seq.values()[..], &[0]);
    let voltage = batch.column(1).as_list::<i32>();
    assert_eq!(
        &voltage.value(0).as_primitive::<UInt64Type>().values()[..],
        &[1, 2, 3]
    );
}

#[test]
fn records_spanning_buffers_partition_the_sequence_space() {
    // Three records, buffers sized to hold two records at most, so
    // ingress must split across at least two buffers.
    let record = b"{\"voltage\":[7]}\n";
    let mut payload = Vec::new();
    for _ in 0..3 {
        payload.extend_from_slice(record);
    }
    let client = ClientOptions {
        seq_base: 10,
        ..serve(payload)
    };
    // Two buffers of 40 bytes: two 16-byte records fit, three do not.
    let opts = options(client, software_converter(1, 2, 80));
    let (producer, messages) = CollectingProducer::new();

    let report = run_pipeline(&opts, Box::new(producer)).unwrap();
    assert_eq!(report.received, 3);
    assert_eq!(report.publish.num_jsons_published, 3);

    let messages = messages.lock();
    assert!(messages.len() >= 2, "expected at least two messages");

    // Decode all messages and order rows by the sequence column.
    let mut rows: Vec<(u64, Vec<u64>)> = Vec::new();
    for payload in messages.iter() {
        let batch = decode(payload);
        let seq = batch.column(0).as_primitive::<UInt64Type>();
        let voltage = batch.column(1).as_list::<i32>();
        for k in 0..batch.num_rows() {
            rows.push((
                seq.value(k),
                voltage.value(k).as_primitive::<UInt64Type>().values().to_vec(),
            ));
        }
    }
    rows.sort();

    let seqs: Vec<u64> = rows.iter().map(|(s, _)| *s).collect();
    assert_eq!(seqs, vec![10, 11, 12], "sequence space must partition [10,12]");
    for (_, voltage) in rows {
        assert_eq!(voltage, vec![7]);
    }
}

#[test]
fn parse_error_mid_stream_shuts_the_pipeline_down() {
    // 100 valid records spread over several buffers, then a malformed
    // one. Earlier buffers publish; the failing buffer kills the run.
    let mut payload = Vec::new();
    for i in 0..100u64 {
        payload.extend_from_slice(format!("{{\"voltage\":[{i}]}}\n").as_bytes());
    }
    payload.extend_from_slice(b"{not json}\n");

    let client = serve(payload);
    // Four buffers around 512 bytes each force multiple parser
    // invocations; a single worker keeps them ordered.
    let opts = options(client, software_converter(1, 4, 2048));
    let (producer, messages) = CollectingProducer::new();

    let start = Instant::now();
    let result = run_pipeline(&opts, Box::new(producer));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::Parse(_))), "got {result:?}");
    // The driver joined every thread before returning.
    assert!(elapsed < Duration::from_secs(10));

    // Some prefix of the stream was published before the failure.
    let messages = messages.lock();
    let published_rows: usize = messages.iter().map(|m| decode(m).num_rows()).sum();
    assert!(published_rows > 0, "expected a published prefix");
    assert!(published_rows <= 100);
}

#[test]
fn latency_and_metrics_files_are_written_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let latency_path = dir.path().join("latency.csv");
    let metrics_path = dir.path().join("metrics.csv");

    let client = serve(b"{\"voltage\":[1]}\n{\"voltage\":[2]}\n".to_vec());
    let mut opts = options(client, software_converter(1, 0, 64 * 1024));
    opts.latency_file = Some(latency_path.clone());
    opts.metrics_file = Some(metrics_path.clone());
    let (producer, _messages) = CollectingProducer::new();

    run_pipeline(&opts, Box::new(producer)).unwrap();

    let latency = std::fs::read_to_string(&latency_path).unwrap();
    assert!(latency.starts_with("First,Last,Received,"));
    assert!(latency.lines().count() >= 2);

    let metrics = std::fs::read_to_string(&metrics_path).unwrap();
    assert!(metrics.starts_with("Worker,"));
    assert!(metrics.lines().any(|l| l.starts_with("total,2,")));
}

#[test]
fn seq_metadata_mode_carries_ranges_out_of_band() {
    let client = serve(b"{\"voltage\":[5]}\n{\"voltage\":[6]}\n".to_vec());
    let converter = ConverterOptions {
        parser: ParserOptions::Software(SoftwareOptions {
            seq_column: false,
            ..SoftwareOptions::default()
        }),
        input_capacity: 64 * 1024,
        ..ConverterOptions::default()
    };
    let opts = options(client, converter);
    let (producer, messages) = CollectingProducer::new();

    let report = run_pipeline(&opts, Box::new(producer)).unwrap();
    assert_eq!(report.received, 2);

    let messages = messages.lock();
    let mut covered = 0u64;
    for payload in messages.iter() {
        let batch = decode(payload);
        // No sequence column: voltage only.
        assert_eq!(batch.num_columns(), 1);
        let range = fluxon_core::parse::seq_metadata_of(&batch.schema())
            .expect("schema metadata must carry the range");
        assert_eq!(range.count(), batch.num_rows() as u64);
        covered += range.count();
    }
    assert_eq!(covered, 2);
}
