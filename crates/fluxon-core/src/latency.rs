//! Per-batch latency checkpoints from ingress to publication.
//!
//! Deliberately cheap: a handful of `Instant`s per serialized batch,
//! keyed by the batch's sequence range. At very high rates the publisher
//! may sample instead of recording every batch.

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::seq::SeqRange;

/// Labelled points in a record's life, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Checkpoint {
    /// Ingress submitted the filled buffer.
    Received = 0,
    /// The parser produced a record batch.
    Parsed = 1,
    /// The batch was resized under the message ceiling.
    Resized = 2,
    /// The batch was encoded into an IPC message.
    Serialized = 3,
    /// The bus accepted the message.
    Published = 4,
}

impl Checkpoint {
    /// All checkpoints in pipeline order.
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::Received,
        Checkpoint::Parsed,
        Checkpoint::Resized,
        Checkpoint::Serialized,
        Checkpoint::Published,
    ];

    /// Column label used in the latency CSV.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Checkpoint::Received => "Received",
            Checkpoint::Parsed => "Parsed",
            Checkpoint::Resized => "Resized",
            Checkpoint::Serialized => "Serialized",
            Checkpoint::Published => "Published",
        }
    }
}

/// Timestamps of one batch at each checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimePoints {
    points: [Option<Instant>; Checkpoint::ALL.len()],
}

impl TimePoints {
    /// Stamps `point` with the current instant.
    pub fn mark(&mut self, point: Checkpoint) {
        self.points[point as usize] = Some(Instant::now());
    }

    /// Stamps `point` with a caller-provided instant.
    pub fn set(&mut self, point: Checkpoint, at: Instant) {
        self.points[point as usize] = Some(at);
    }

    /// The instant recorded for `point`, if any.
    #[must_use]
    pub fn get(&self, point: Checkpoint) -> Option<Instant> {
        self.points[point as usize]
    }

    /// Nanoseconds between the receive checkpoint and `point`.
    #[must_use]
    pub fn nanos_since_received(&self, point: Checkpoint) -> Option<u128> {
        let received = self.get(Checkpoint::Received)?;
        let at = self.get(point)?;
        Some(at.duration_since(received).as_nanos())
    }
}

/// One latency record: a sequence range and its checkpoint times.
#[derive(Debug, Clone, Copy)]
pub struct LatencyMeasurement {
    /// Sequence range of the published batch.
    pub seq: SeqRange,
    /// Checkpoint timestamps.
    pub time: TimePoints,
}

/// Writes latency measurements as CSV: `First,Last` then nanoseconds
/// from the receive checkpoint for every checkpoint column.
///
/// # Errors
///
/// Returns `Error::Config` if the file cannot be created or written.
pub fn write_latency_csv(path: &Path, measurements: &[LatencyMeasurement]) -> Result<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| Error::Config(format!("cannot create latency file {}: {e}", path.display())))?;
    let mut w = std::io::BufWriter::new(file);

    let write_err =
        |e: std::io::Error| Error::Config(format!("cannot write latency file {}: {e}", path.display()));

    let header: Vec<&str> = Checkpoint::ALL.iter().map(|c| c.name()).collect();
    writeln!(w, "First,Last,{}", header.join(",")).map_err(write_err)?;

    for m in measurements {
        write!(w, "{},{}", m.seq.first, m.seq.last).map_err(write_err)?;
        for point in Checkpoint::ALL {
            let nanos = m.time.nanos_since_received(point).unwrap_or(0);
            write!(w, ",{nanos}").map_err(write_err)?;
        }
        writeln!(w).map_err(write_err)?;
    }

    w.flush().map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_monotonic() {
        let mut t = TimePoints::default();
        t.mark(Checkpoint::Received);
        t.mark(Checkpoint::Parsed);
        t.mark(Checkpoint::Published);

        let parsed = t.nanos_since_received(Checkpoint::Parsed).unwrap();
        let published = t.nanos_since_received(Checkpoint::Published).unwrap();
        assert!(published >= parsed);
    }

    #[test]
    fn missing_points_yield_none() {
        let mut t = TimePoints::default();
        assert_eq!(t.nanos_since_received(Checkpoint::Parsed), None);
        t.mark(Checkpoint::Parsed);
        // Still no receive checkpoint to diff against.
        assert_eq!(t.nanos_since_received(Checkpoint::Parsed), None);
    }

    #[test]
    fn csv_has_header_and_one_row_per_measurement() {
        let mut time = TimePoints::default();
        time.mark(Checkpoint::Received);
        time.mark(Checkpoint::Published);
        let measurements = vec![
            LatencyMeasurement {
                seq: SeqRange::new(0, 9),
                time,
            },
            LatencyMeasurement {
                seq: SeqRange::new(10, 12),
                time,
            },
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latency.csv");
        write_latency_csv(&path, &measurements).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "First,Last,Received,Parsed,Resized,Serialized,Published");
        assert!(lines[1].starts_with("0,9,0,"));
        assert!(lines[2].starts_with("10,12,0,"));
    }
}
