//! Parsing of raw JSON buffers into Arrow record batches.
//!
//! A [`ParserContext`] owns backend resources (schemas, device handles,
//! output regions) and hands out a fleet of independent [`Parser`]
//! workers. Backends are a tagged choice at startup, not per-record
//! dispatch: a software parser over the Arrow JSON reader, and an
//! accelerator parser programming memory-mapped registers.

pub mod battery;
pub mod device;
pub mod software;

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::{RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use crate::alloc::AllocatorRef;
use crate::buffer::JsonBuffer;
use crate::error::{Error, Result};
use crate::pool::MemoryRegion;
use crate::seq::SeqRange;

pub use battery::{BatteryOptions, BatteryParserContext};
pub use software::{SoftwareOptions, SoftwareParserContext};

/// Name of the optional prepended sequence-number column.
pub const SEQ_COLUMN: &str = "seq";

/// Schema metadata keys carrying the sequence range when the sequence
/// column is disabled.
pub const SEQ_META_FIRST: &str = "fluxon_seq_first";
pub const SEQ_META_LAST: &str = "fluxon_seq_last";

/// A typed record batch plus the sequence range of the records that
/// produced it.
///
/// Row count and range size always agree; the constructor enforces it.
#[derive(Debug, Clone)]
pub struct ParsedBatch {
    /// The parsed columnar data.
    pub batch: RecordBatch,
    /// Ingress sequence range of the rows, in order.
    pub seq_range: SeqRange,
}

impl ParsedBatch {
    /// Pairs a batch with its sequence range.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the row count does not match the
    /// range size.
    pub fn new(batch: RecordBatch, seq_range: SeqRange) -> Result<Self> {
        if batch.num_rows() as u64 != seq_range.count() {
            return Err(Error::Internal(format!(
                "batch has {} rows but sequence range {} covers {} records",
                batch.num_rows(),
                seq_range,
                seq_range.count()
            )));
        }
        Ok(Self { batch, seq_range })
    }
}

/// One parser worker. Each worker is owned by exactly one convert
/// thread.
pub trait Parser: Send {
    /// Parses a set of filled buffers into one batch per buffer, in
    /// input order. Each batch's range equals its source buffer's range.
    fn parse(&mut self, inputs: &[JsonBuffer]) -> Result<Vec<ParsedBatch>>;
}

/// Backend resources behind a fleet of parsers.
pub trait ParserContext: Send {
    /// Registers the input buffer regions with the backend. Called once,
    /// after the pool is allocated and before [`parsers`](Self::parsers).
    fn init(&mut self, regions: &[MemoryRegion]) -> Result<()>;

    /// Hands out the parser fleet. Called once; the workers own their
    /// parsers afterwards.
    fn parsers(&mut self) -> Result<Vec<Box<dyn Parser>>>;

    /// Schema of the raw input as the backend sees it.
    fn input_schema(&self) -> SchemaRef;

    /// Schema of the parsed output, including the sequence column when
    /// enabled.
    fn output_schema(&self) -> SchemaRef;

    /// The worker count the backend mandates for a requested count.
    fn check_thread_count(&self, requested: usize) -> usize;

    /// The buffer count the backend mandates for a requested count.
    fn check_buffer_count(&self, requested: usize) -> usize;

    /// The allocator the buffer pool must use.
    fn allocator(&self) -> AllocatorRef;
}

/// Parser backend selection plus per-backend knobs.
#[derive(Debug, Clone)]
pub enum ParserOptions {
    /// Generic software parser over the Arrow JSON reader.
    Software(SoftwareOptions),
    /// Accelerator-backed battery-status parser.
    Battery(BatteryOptions),
}

impl ParserOptions {
    /// Whether the backend materializes ingress order as a column.
    #[must_use]
    pub fn seq_column(&self) -> bool {
        match self {
            ParserOptions::Software(o) => o.seq_column,
            ParserOptions::Battery(o) => o.seq_column,
        }
    }
}

/// Builds the parser context for the selected backend.
///
/// # Errors
///
/// Returns `Error::Config` for invalid backend options and
/// `Error::Accelerator` when device setup fails.
pub fn make_context(options: &ParserOptions, num_threads: usize) -> Result<Box<dyn ParserContext>> {
    match options {
        ParserOptions::Software(opts) => Ok(Box::new(SoftwareParserContext::new(
            opts.clone(),
            num_threads,
        )?)),
        ParserOptions::Battery(opts) => Ok(Box::new(BatteryParserContext::make(opts.clone())?)),
    }
}

// ── Schemas ────────────────────────────────────────────────────────

/// The battery-status schema: `voltage: List<UInt64 not null> not null`.
#[must_use]
pub fn battery_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(
        "voltage",
        battery_list_type(),
        false,
    )]))
}

/// Element layout of the battery voltage column.
#[must_use]
pub fn battery_list_type() -> DataType {
    DataType::List(Arc::new(Field::new("item", DataType::UInt64, false)))
}

/// Raw byte input schema the accelerator reads: `input: UInt8 not null`.
#[must_use]
pub fn raw_input_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("input", DataType::UInt8, false)]))
}

/// `schema` with the sequence column prepended.
#[must_use]
pub fn schema_with_seq_column(schema: &SchemaRef) -> SchemaRef {
    let mut fields = vec![Arc::new(Field::new(SEQ_COLUMN, DataType::UInt64, false))];
    fields.extend(schema.fields().iter().cloned());
    Arc::new(Schema::new(fields))
}

// ── Sequence identity helpers ──────────────────────────────────────

/// Materializes a range as an ascending `UInt64` column.
#[must_use]
pub fn build_seq_column(range: SeqRange) -> UInt64Array {
    UInt64Array::from_iter_values(range.first..=range.last)
}

/// Prepends the sequence column for `range` to `batch`.
///
/// # Errors
///
/// Returns `Error::Internal` on a row-count mismatch.
pub fn prepend_seq_column(batch: &RecordBatch, range: SeqRange) -> Result<RecordBatch> {
    if batch.num_rows() as u64 != range.count() {
        return Err(Error::Internal(format!(
            "cannot prepend sequence column: {} rows, range {}",
            batch.num_rows(),
            range
        )));
    }
    let schema = schema_with_seq_column(&batch.schema());
    let mut columns: Vec<arrow_array::ArrayRef> = vec![Arc::new(build_seq_column(range))];
    columns.extend(batch.columns().iter().cloned());
    RecordBatch::try_new(schema, columns)
        .map_err(|e| Error::Internal(format!("sequence column construction: {e}")))
}

/// Re-attaches `range` as schema metadata, replacing any range the batch
/// already carried. Split batches call this so sub-ranges never inherit
/// the parent's metadata.
#[must_use]
pub fn annotate_seq_metadata(batch: &RecordBatch, range: SeqRange) -> RecordBatch {
    let schema = batch.schema();
    let mut metadata: HashMap<String, String> = schema.metadata().clone();
    metadata.insert(SEQ_META_FIRST.to_string(), range.first.to_string());
    metadata.insert(SEQ_META_LAST.to_string(), range.last.to_string());
    let annotated = Arc::new(Schema::new_with_metadata(
        schema.fields().clone(),
        metadata,
    ));
    // The fields are untouched, so the schemas stay logically equivalent.
    batch
        .clone()
        .with_schema(annotated)
        .unwrap_or_else(|_| batch.clone())
}

/// Reads the sequence range back out of schema metadata.
#[must_use]
pub fn seq_metadata_of(schema: &SchemaRef) -> Option<SeqRange> {
    let first = schema.metadata().get(SEQ_META_FIRST)?.parse().ok()?;
    let last = schema.metadata().get(SEQ_META_LAST)?.parse().ok()?;
    (first <= last).then(|| SeqRange::new(first, last))
}
