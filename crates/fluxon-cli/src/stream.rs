//! The end-to-end stream driver.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use fluxon_connectors::{ClientOptions, PulsarOptions, PulsarProducer, StreamClient};
use fluxon_core::convert::{self, Converter, ConverterOptions, Stats};
use fluxon_core::error::{Error, Result};
use fluxon_core::latency::{write_latency_csv, LatencyMeasurement};
use fluxon_core::publish::{log_publish_stats, publish_loop, BusProducer, PublishStats};
use fluxon_core::QUEUE_POLL;

use crate::cli::StreamArgs;

/// Depth of the serialized-batch queue between workers and publisher.
const IPC_QUEUE_DEPTH: usize = 1024;

/// Resolved `stream` options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Ingress connection.
    pub client: ClientOptions,
    /// Bus connection.
    pub pulsar: PulsarOptions,
    /// Conversion pipeline.
    pub converter: ConverterOptions,
    /// Latency CSV output path.
    pub latency_file: Option<PathBuf>,
    /// Metrics CSV output path.
    pub metrics_file: Option<PathBuf>,
}

/// What a finished run reports.
#[derive(Debug)]
pub struct StreamReport {
    /// Records received from ingress.
    pub received: u64,
    /// Per-worker conversion stats.
    pub conv_stats: Vec<Stats>,
    /// Publisher stats.
    pub publish: PublishStats,
    /// Per-batch latency measurements.
    pub latencies: Vec<LatencyMeasurement>,
}

/// Runs the `stream` subcommand against a real Pulsar broker.
///
/// # Errors
///
/// The first error any pipeline component reported.
pub fn run(args: StreamArgs) -> Result<()> {
    let opts = args.into_options()?;
    let producer = PulsarProducer::connect(&opts.pulsar)?;
    opts.pulsar.log();
    run_pipeline(&opts, Box::new(producer)).map(|_| ())
}

/// Wires the pipeline around an arbitrary bus producer and drives it to
/// completion: converter workers, publisher thread, then ingress on the
/// calling thread, then the drain-until-published termination wait.
///
/// # Errors
///
/// The first error any pipeline component reported.
pub fn run_pipeline(opts: &StreamOptions, producer: Box<dyn BusProducer>) -> Result<StreamReport> {
    let pipeline_start = Instant::now();
    let init_start = Instant::now();

    let (ipc_tx, ipc_rx) = bounded(IPC_QUEUE_DEPTH);
    let shutdown = Arc::new(AtomicBool::new(false));
    let published = Arc::new(AtomicU64::new(0));

    let mut converter = Converter::make(&opts.converter, ipc_tx)?;
    let pool = converter.pool();
    let num_threads = converter.num_threads();
    converter.start(shutdown.clone())?;

    let publisher = {
        let shutdown = shutdown.clone();
        let published = published.clone();
        let latency_ref_seq = opts.client.seq_base;
        std::thread::Builder::new()
            .name("publish".into())
            .spawn(move || {
                publish_loop(
                    producer,
                    &ipc_rx,
                    &shutdown,
                    &published,
                    pipeline_start,
                    latency_ref_seq,
                )
            })
            .map_err(|e| Error::Internal(format!("cannot spawn publisher: {e}")))?
    };

    // Everything downstream is running; failures from here on must
    // bring the whole fleet down before returning.
    let fail = |e: Error,
                converter: &mut Converter,
                publisher: std::thread::JoinHandle<(PublishStats, Vec<LatencyMeasurement>)>|
     -> Error {
        shutdown.store(true, Ordering::Relaxed);
        let _ = converter.finish();
        let _ = publisher.join();
        e
    };

    let mut client = match StreamClient::connect(&opts.client) {
        Ok(client) => client,
        Err(e) => return Err(fail(e, &mut converter, publisher)),
    };
    let init_time = init_start.elapsed();

    let tcp_start = Instant::now();
    if let Err(e) = client.receive_into(&pool, &shutdown) {
        return Err(fail(e, &mut converter, publisher));
    }
    let tcp_time = tcp_start.elapsed();

    // Drain: all received records must be published, unless a
    // component already raised shutdown on error.
    while client.received() != published.load(Ordering::Relaxed)
        && !shutdown.load(Ordering::Relaxed)
    {
        std::thread::sleep(QUEUE_POLL);
    }

    shutdown.store(true, Ordering::Relaxed);
    let conv_stats = converter.finish();
    let (publish_stats, latencies) = publisher
        .join()
        .map_err(|_| Error::Internal("publisher thread panicked".into()))?;

    let report = StreamReport {
        received: client.received(),
        conv_stats,
        publish: publish_stats,
        latencies,
    };

    log_stream_stats(&report, &client, init_time, tcp_time, num_threads);

    if let Some(path) = &opts.metrics_file {
        convert::write_metrics_csv(path, &report.conv_stats)?;
    }
    if let Some(path) = &opts.latency_file {
        write_latency_csv(path, &report.latencies)?;
    }

    // Report the first non-OK component status.
    if let Err(e) = &report.publish.status {
        return Err(e.clone());
    }
    let aggregated = convert::aggregate(&report.conv_stats);
    if let Err(e) = &aggregated.status {
        return Err(e.clone());
    }
    Ok(report)
}

fn log_stream_stats(
    report: &StreamReport,
    client: &StreamClient,
    init_time: Duration,
    tcp_time: Duration,
    num_threads: usize,
) {
    let tcp_s = tcp_time.as_secs_f64().max(f64::EPSILON);
    let tcp_mb = client.bytes_received() as f64 / 1e6;
    let tcp_mjs = report.received as f64 / 1e6;

    tracing::info!("Initialization:");
    tracing::info!("  Time : {:.6} s", init_time.as_secs_f64());
    tracing::info!("TCP client:");
    tracing::info!("  JSONs received : {}", report.received);
    tracing::info!("  Bytes received : {}", client.bytes_received());
    tracing::info!("  Time           : {:.6} s", tcp_time.as_secs_f64());
    tracing::info!("  Throughput     : {:.3} MJ/s", tcp_mjs / tcp_s);
    tracing::info!("  Throughput     : {:.3} MB/s", tcp_mb / tcp_s);

    convert::log_stats(&convert::aggregate(&report.conv_stats), num_threads);
    log_publish_stats(&report.publish);
}
