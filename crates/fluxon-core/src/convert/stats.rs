//! Per-worker conversion statistics.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Wall time spent in each worker stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimes {
    /// Parsing JSON into record batches.
    pub parse: Duration,
    /// Resizing batches under the message ceiling.
    pub resize: Duration,
    /// Encoding batches into IPC messages.
    pub serialize: Duration,
    /// Enqueueing serialized batches for the publisher.
    pub enqueue: Duration,
    /// Total time in the worker thread.
    pub thread: Duration,
}

impl std::ops::AddAssign for StageTimes {
    fn add_assign(&mut self, rhs: Self) {
        self.parse += rhs.parse;
        self.resize += rhs.resize;
        self.serialize += rhs.serialize;
        self.enqueue += rhs.enqueue;
        self.thread += rhs.thread;
    }
}

/// Counters and timings of one convert worker, aggregated by summing.
#[derive(Debug, Clone)]
pub struct Stats {
    /// JSON records parsed.
    pub num_jsons: u64,
    /// Raw JSON bytes parsed.
    pub json_bytes: u64,
    /// Input buffers consumed.
    pub num_buffers: u64,
    /// IPC messages produced.
    pub num_ipc: u64,
    /// IPC bytes produced.
    pub ipc_bytes: u64,
    /// Stage timings.
    pub t: StageTimes,
    /// Terminal status of the worker.
    pub status: Result<()>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            num_jsons: 0,
            json_bytes: 0,
            num_buffers: 0,
            num_ipc: 0,
            ipc_bytes: 0,
            t: StageTimes::default(),
            status: Ok(()),
        }
    }
}

impl std::ops::AddAssign<&Stats> for Stats {
    fn add_assign(&mut self, rhs: &Stats) {
        self.num_jsons += rhs.num_jsons;
        self.json_bytes += rhs.json_bytes;
        self.num_buffers += rhs.num_buffers;
        self.num_ipc += rhs.num_ipc;
        self.ipc_bytes += rhs.ipc_bytes;
        self.t += rhs.t;
        // The first error wins.
        if self.status.is_ok() {
            if let Err(e) = &rhs.status {
                self.status = Err(e.clone());
            }
        }
    }
}

/// Sums a set of per-worker stats.
#[must_use]
pub fn aggregate(stats: &[Stats]) -> Stats {
    let mut total = Stats::default();
    for s in stats {
        total += s;
    }
    total
}

/// Logs conversion throughput at info level.
pub fn log_stats(stats: &Stats, num_threads: usize) {
    let mjs = stats.num_jsons as f64 / 1e6;
    let in_mb = stats.json_bytes as f64 / 1e6;
    let out_mb = stats.ipc_bytes as f64 / 1e6;
    let parse_s = stats.t.parse.as_secs_f64().max(f64::EPSILON);
    tracing::info!("JSON to IPC conversion:");
    tracing::info!("  Threads          : {num_threads}");
    tracing::info!("  JSONs parsed     : {}", stats.num_jsons);
    tracing::info!("  Buffers parsed   : {}", stats.num_buffers);
    tracing::info!("  IPC messages     : {}", stats.num_ipc);
    tracing::info!("  IPC bytes        : {}", stats.ipc_bytes);
    tracing::info!("  Parse time       : {:.6} s", stats.t.parse.as_secs_f64());
    tracing::info!("  Resize time      : {:.6} s", stats.t.resize.as_secs_f64());
    tracing::info!("  Serialize time   : {:.6} s", stats.t.serialize.as_secs_f64());
    tracing::info!("  Enqueue time     : {:.6} s", stats.t.enqueue.as_secs_f64());
    tracing::info!("  Thread time      : {:.6} s", stats.t.thread.as_secs_f64());
    tracing::info!("  Throughput       : {:.3} MJ/s", mjs / parse_s);
    tracing::info!("  Throughput (in)  : {:.3} MB/s", in_mb / parse_s);
    tracing::info!("  Throughput (out) : {:.3} MB/s", out_mb / parse_s);
}

/// Writes one CSV row per worker plus a `total` row.
///
/// # Errors
///
/// Returns `Error::Config` if the file cannot be created or written.
pub fn write_metrics_csv(path: &Path, stats: &[Stats]) -> Result<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| Error::Config(format!("cannot create metrics file {}: {e}", path.display())))?;
    let mut w = std::io::BufWriter::new(file);
    let write_err =
        |e: std::io::Error| Error::Config(format!("cannot write metrics file {}: {e}", path.display()));

    writeln!(
        w,
        "Worker,JSONs,JSONBytes,Buffers,IPCMessages,IPCBytes,ParseSeconds,ResizeSeconds,SerializeSeconds,EnqueueSeconds,ThreadSeconds"
    )
    .map_err(write_err)?;

    let mut row = |label: &str, s: &Stats| -> Result<()> {
        writeln!(
            w,
            "{label},{},{},{},{},{},{:.9},{:.9},{:.9},{:.9},{:.9}",
            s.num_jsons,
            s.json_bytes,
            s.num_buffers,
            s.num_ipc,
            s.ipc_bytes,
            s.t.parse.as_secs_f64(),
            s.t.resize.as_secs_f64(),
            s.t.serialize.as_secs_f64(),
            s.t.enqueue.as_secs_f64(),
            s.t.thread.as_secs_f64(),
        )
        .map_err(write_err)
    };

    for (i, s) in stats.iter().enumerate() {
        row(&i.to_string(), s)?;
    }
    row("total", &aggregate(stats))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_counters_and_times() {
        let mut a = Stats::default();
        a.num_jsons = 10;
        a.ipc_bytes = 100;
        a.t.parse = Duration::from_millis(5);

        let mut b = Stats::default();
        b.num_jsons = 4;
        b.ipc_bytes = 50;
        b.t.parse = Duration::from_millis(3);

        let total = aggregate(&[a, b]);
        assert_eq!(total.num_jsons, 14);
        assert_eq!(total.ipc_bytes, 150);
        assert_eq!(total.t.parse, Duration::from_millis(8));
        assert!(total.status.is_ok());
    }

    #[test]
    fn aggregate_keeps_first_error() {
        let ok = Stats::default();
        let mut failed = Stats::default();
        failed.status = Err(Error::Parse("bad record".into()));
        let mut also_failed = Stats::default();
        also_failed.status = Err(Error::Bus("down".into()));

        let total = aggregate(&[ok, failed, also_failed]);
        assert!(matches!(total.status, Err(Error::Parse(_))));
    }

    #[test]
    fn metrics_csv_has_per_worker_and_total_rows() {
        let mut s = Stats::default();
        s.num_jsons = 3;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        write_metrics_csv(&path, &[s.clone(), s]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Worker,"));
        assert!(lines[3].starts_with("total,6,"));
    }
}
