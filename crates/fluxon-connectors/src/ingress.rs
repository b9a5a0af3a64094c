//! TCP ingress client.
//!
//! Connects to a newline-delimited JSON source, assigns one
//! monotonically increasing sequence number per record from a
//! configured base, and packs whole records into pool buffers. A record
//! is never split across buffers; a partial record at a buffer boundary
//! is carried over to the next buffer.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fluxon_core::error::{Error, Result};
use fluxon_core::{BufferPool, JsonBuffer, SeqRange, QUEUE_POLL};

/// Socket read timeout; short enough that a blocked read observes the
/// shutdown flag.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Ingress connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// JSON source hostname.
    pub host: String,
    /// JSON source port.
    pub port: u16,
    /// First sequence number to assign.
    pub seq_base: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 10197,
            seq_base: 0,
        }
    }
}

/// Client filling pool buffers from a TCP stream of JSON records.
pub struct StreamClient {
    stream: TcpStream,
    received: Arc<AtomicU64>,
    bytes_received: u64,
    next_seq: u64,
    spill: Vec<u8>,
}

impl StreamClient {
    /// Connects to the JSON source.
    ///
    /// # Errors
    ///
    /// Returns `Error::Ingress` if the connection cannot be
    /// established.
    pub fn connect(opts: &ClientOptions) -> Result<Self> {
        let addr = format!("{}:{}", opts.host, opts.port);
        let stream = TcpStream::connect(&addr)
            .map_err(|e| Error::Ingress(format!("cannot connect to {addr}: {e}")))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| Error::Ingress(format!("cannot configure socket: {e}")))?;
        tracing::info!(%addr, seq_base = opts.seq_base, "connected to JSON source");
        Ok(Self {
            stream,
            received: Arc::new(AtomicU64::new(0)),
            bytes_received: 0,
            next_seq: opts.seq_base,
            spill: Vec::new(),
        })
    }

    /// Shared counter of records handed to the raw-JSON queue; the
    /// driver's termination predicate reads it.
    #[must_use]
    pub fn received_counter(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }

    /// Records received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Raw bytes received so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Receives records until the source closes the connection,
    /// filling and submitting pool buffers as they complete.
    ///
    /// Returns early (successfully) when the shutdown flag is raised.
    ///
    /// # Errors
    ///
    /// `Error::Ingress` on socket failures or when a single record
    /// exceeds the buffer capacity.
    pub fn receive_into(&mut self, pool: &BufferPool, shutdown: &AtomicBool) -> Result<()> {
        let mut eof = false;
        while !eof {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let Some(mut buf) = pool.acquire_empty(QUEUE_POLL) else {
                continue;
            };

            if let Err(e) = self.seed_spill(&mut buf) {
                pool.release(buf);
                return Err(e);
            }
            eof = self.fill(&mut buf, shutdown)?;
            self.frame_and_submit(buf, pool, eof)?;
        }

        // A final record without a trailing newline ends up in the
        // spill; ship it as its own buffer.
        if !self.spill.is_empty() {
            let mut buf = loop {
                if let Some(buf) = pool.acquire_empty(QUEUE_POLL) {
                    break buf;
                }
                if shutdown.load(Ordering::Relaxed) {
                    return Ok(());
                }
            };
            let record = std::mem::take(&mut self.spill);
            buf.push_record(&record)?;
            self.submit(buf, 1, pool)?;
        }
        Ok(())
    }

    /// Copies the carried-over partial record into a fresh buffer.
    fn seed_spill(&mut self, buf: &mut JsonBuffer) -> Result<()> {
        if self.spill.is_empty() {
            return Ok(());
        }
        if self.spill.len() >= buf.capacity() {
            return Err(Error::Ingress(format!(
                "a record of more than {} bytes exceeds the input buffer capacity of {} bytes",
                self.spill.len(),
                buf.capacity()
            )));
        }
        buf.space()[..self.spill.len()].copy_from_slice(&self.spill);
        buf.advance(self.spill.len());
        self.spill.clear();
        Ok(())
    }

    /// Reads from the socket until the buffer is full, the source
    /// closes, or a timeout hits with at least one complete record
    /// buffered. Returns true at end of stream.
    fn fill(&mut self, buf: &mut JsonBuffer, shutdown: &AtomicBool) -> Result<bool> {
        loop {
            if buf.space().is_empty() {
                return Ok(false);
            }
            match self.stream.read(buf.space()) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.bytes_received += n as u64;
                    buf.advance(n);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if shutdown.load(Ordering::Relaxed) {
                        return Ok(false);
                    }
                    // Ship complete records instead of waiting for a
                    // full buffer on a slow source.
                    if buf.bytes().contains(&b'\n') {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(Error::Ingress(format!("socket read failed: {e}"))),
            }
        }
    }

    /// Splits the buffer at its last newline, carries the tail over,
    /// and submits the complete records.
    fn frame_and_submit(&mut self, mut buf: JsonBuffer, pool: &BufferPool, eof: bool) -> Result<()> {
        match buf.bytes().iter().rposition(|&b| b == b'\n') {
            Some(pos) => {
                let records = buf.bytes()[..=pos].iter().filter(|&&b| b == b'\n').count() as u64;
                self.spill.extend_from_slice(&buf.bytes()[pos + 1..]);
                buf.truncate(pos + 1);
                self.submit(buf, records, pool)
            }
            None if buf.len() == buf.capacity() => Err(Error::Ingress(format!(
                "a record exceeds the input buffer capacity of {} bytes",
                buf.capacity()
            ))),
            None if eof && !buf.is_empty() => {
                // Sole partial record at end of stream: terminate it.
                buf.space()[0] = b'\n';
                buf.advance(1);
                self.submit(buf, 1, pool)
            }
            None => {
                // Nothing complete yet; put the bytes back in the spill
                // and recycle the buffer.
                self.spill.extend_from_slice(buf.bytes());
                pool.release(buf);
                Ok(())
            }
        }
    }

    fn submit(&mut self, mut buf: JsonBuffer, records: u64, pool: &BufferPool) -> Result<()> {
        if records == 0 {
            pool.release(buf);
            return Ok(());
        }
        let range = SeqRange::new(self.next_seq, self.next_seq + records - 1);
        buf.set_seq_range(range);
        self.next_seq += records;
        tracing::trace!(range = %range, bytes = buf.len(), "submitting filled buffer");
        pool.submit_filled(buf)?;
        self.received.fetch_add(records, Ordering::Relaxed);
        Ok(())
    }
}
