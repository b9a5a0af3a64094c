//! Software parser backend over the Arrow JSON reader.

use std::io::Cursor;

use arrow_schema::SchemaRef;
use arrow_select::concat::concat_batches;

use crate::alloc::{AllocatorRef, HeapAllocator};
use crate::buffer::JsonBuffer;
use crate::error::{Error, Result};
use crate::pool::MemoryRegion;

use super::{
    battery_schema, prepend_seq_column, schema_with_seq_column, ParsedBatch, Parser, ParserContext,
};

/// Options for the software parser backend.
#[derive(Debug, Clone)]
pub struct SoftwareOptions {
    /// Arrow schema of the incoming records. `None` selects the
    /// battery-status schema.
    pub schema: Option<SchemaRef>,
    /// Whether to prepend the ingress sequence number as a column.
    pub seq_column: bool,
    /// Row chunk size handed to the Arrow JSON reader. Chunks are
    /// concatenated back into one batch per buffer.
    pub read_batch_size: usize,
}

impl Default for SoftwareOptions {
    fn default() -> Self {
        Self {
            schema: None,
            seq_column: true,
            read_batch_size: 8192,
        }
    }
}

/// Context for a fleet of [`SoftwareParser`]s.
///
/// The software backend has no device state: any thread count works,
/// buffers live in ordinary heap memory, and `init` is a no-op.
pub struct SoftwareParserContext {
    input_schema: SchemaRef,
    output_schema: SchemaRef,
    opts: SoftwareOptions,
    num_parsers: usize,
}

impl SoftwareParserContext {
    /// Creates a context sized for `num_parsers` workers.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a zero worker count or read batch
    /// size.
    pub fn new(opts: SoftwareOptions, num_parsers: usize) -> Result<Self> {
        if num_parsers == 0 {
            return Err(Error::Config("software backend requires at least one thread".into()));
        }
        if opts.read_batch_size == 0 {
            return Err(Error::Config("read batch size must be non-zero".into()));
        }
        let input_schema = opts.schema.clone().unwrap_or_else(battery_schema);
        let output_schema = if opts.seq_column {
            schema_with_seq_column(&input_schema)
        } else {
            input_schema.clone()
        };
        Ok(Self {
            input_schema,
            output_schema,
            opts,
            num_parsers,
        })
    }
}

impl ParserContext for SoftwareParserContext {
    fn init(&mut self, _regions: &[MemoryRegion]) -> Result<()> {
        Ok(())
    }

    fn parsers(&mut self) -> Result<Vec<Box<dyn Parser>>> {
        Ok((0..self.num_parsers)
            .map(|_| {
                Box::new(SoftwareParser {
                    schema: self.input_schema.clone(),
                    seq_column: self.opts.seq_column,
                    read_batch_size: self.opts.read_batch_size,
                }) as Box<dyn Parser>
            })
            .collect())
    }

    fn input_schema(&self) -> SchemaRef {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    fn check_thread_count(&self, requested: usize) -> usize {
        requested.max(1)
    }

    fn check_buffer_count(&self, requested: usize) -> usize {
        // At least one buffer per worker, or parsers starve.
        requested.max(self.num_parsers)
    }

    fn allocator(&self) -> AllocatorRef {
        std::sync::Arc::new(HeapAllocator)
    }
}

/// Parses newline-delimited JSON with the Arrow JSON reader.
struct SoftwareParser {
    schema: SchemaRef,
    seq_column: bool,
    read_batch_size: usize,
}

impl SoftwareParser {
    fn parse_one(&self, input: &JsonBuffer) -> Result<ParsedBatch> {
        let seq_range = input
            .seq_range()
            .ok_or_else(|| Error::Internal("filled buffer without a sequence range".into()))?;

        let reader = arrow_json::ReaderBuilder::new(self.schema.clone())
            .with_batch_size(self.read_batch_size)
            .build(Cursor::new(input.bytes()))
            .map_err(|e| Error::Parse(format!("cannot construct JSON reader: {e}")))?;

        let chunks = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Parse(e.to_string()))?;

        let batch = concat_batches(&self.schema, &chunks)
            .map_err(|e| Error::Parse(format!("cannot combine record batches: {e}")))?;

        let batch = if self.seq_column {
            prepend_seq_column(&batch, seq_range)?
        } else {
            batch
        };

        ParsedBatch::new(batch, seq_range)
    }
}

impl Parser for SoftwareParser {
    fn parse(&mut self, inputs: &[JsonBuffer]) -> Result<Vec<ParsedBatch>> {
        inputs.iter().map(|input| self.parse_one(input)).collect()
    }
}
