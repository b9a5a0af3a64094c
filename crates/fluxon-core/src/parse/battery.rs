//! Accelerator-backed battery-status parser.
//!
//! One kernel instance per parser, programmed through the register
//! window in [`device`](crate::parse::device). Input buffers and output
//! regions are registered with the device once at init; parsing then
//! only touches registers and host memory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{ListArray, RecordBatch, UInt64Array};
use arrow_buffer::{OffsetBuffer, ScalarBuffer};
use arrow_schema::{DataType, Field, SchemaRef};

use crate::alloc::{Allocation, AllocatorRef, HugePageAllocator};
use crate::buffer::JsonBuffer;
use crate::error::{Error, Result};
use crate::pool::MemoryRegion;

use super::device::{
    ctrl, instance_base, join_words, reg, split_device_addr, stat, AddrMap, MappedPlatform,
    MmioPlatform, PlatformRef, MAX_INSTANCES,
};
use super::{
    battery_schema, raw_input_schema, schema_with_seq_column, ParsedBatch, Parser, ParserContext,
};

/// Default parser instance count of the shipped kernel configuration.
pub const DEFAULT_BATTERY_PARSERS: usize = 8;

/// AFU ID stem of the battery-status kernel; the instance count is
/// appended as two hex digits when no explicit ID is configured.
pub const BATTERY_AFU_ID_STEM: &str = "9ca43fb0-c340-4908-b79b-5c89b4ef5e";

/// Sleep between status polls, with the platform mutex released.
const DEVICE_POLL: Duration = Duration::from_micros(10);

/// Options for the accelerator backend.
#[derive(Debug, Clone)]
pub struct BatteryOptions {
    /// Accelerator function ID; derived from the parser count when
    /// absent.
    pub afu_id: Option<String>,
    /// Number of kernel instances (equals worker and buffer count).
    pub num_parsers: usize,
    /// Whether to prepend the ingress sequence number as a column.
    pub seq_column: bool,
    /// Register window device file.
    pub device_path: Option<PathBuf>,
    /// Capacity of each output region. Ignored by allocators with a
    /// fixed region size (huge pages).
    pub output_capacity: usize,
}

impl Default for BatteryOptions {
    fn default() -> Self {
        Self {
            afu_id: None,
            num_parsers: DEFAULT_BATTERY_PARSERS,
            seq_column: true,
            device_path: None,
            output_capacity: crate::alloc::HUGE_PAGE_REGION_SIZE,
        }
    }
}

/// Resolves the configured or derived AFU ID.
///
/// # Errors
///
/// Returns `Error::Config` when derivation is requested for more than
/// 255 parsers (the count no longer fits the two-digit suffix).
pub fn resolve_afu_id(opts: &BatteryOptions) -> Result<String> {
    match &opts.afu_id {
        Some(id) => Ok(id.clone()),
        None if opts.num_parsers > 255 => Err(Error::Config(
            "cannot derive an AFU ID for more than 255 parsers; pass one explicitly".into(),
        )),
        None => Ok(format!("{BATTERY_AFU_ID_STEM}{:02x}", opts.num_parsers)),
    }
}

/// Pre-allocated device-visible output regions of one kernel instance.
struct OutputRegions {
    offsets: Allocation,
    values: Allocation,
}

/// Context owning the platform handle, the address map, and the output
/// regions of the parser fleet.
pub struct BatteryParserContext {
    opts: BatteryOptions,
    afu_id: String,
    platform: PlatformRef,
    allocator: AllocatorRef,
    addr_map: Option<Arc<AddrMap>>,
    outputs: Vec<OutputRegions>,
    output_schema: SchemaRef,
}

impl BatteryParserContext {
    /// Opens the device and builds an uninitialized context.
    ///
    /// Counts are validated before any register access.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid parser count or missing device
    /// path; `Error::Accelerator` when the device cannot be mapped.
    pub fn make(opts: BatteryOptions) -> Result<Self> {
        let path = opts.device_path.clone().ok_or_else(|| {
            Error::Config("battery backend requires a device file (--device)".into())
        })?;
        let platform: PlatformRef =
            Arc::new(parking_lot::Mutex::new(MappedPlatform::open(&path)?));
        Self::with_platform(opts, platform, Arc::new(HugePageAllocator))
    }

    /// Builds a context over an existing platform handle and allocator.
    ///
    /// This is the construction path for the simulated platform used by
    /// tests and benches.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid parser count.
    pub fn with_platform(
        opts: BatteryOptions,
        platform: PlatformRef,
        allocator: AllocatorRef,
    ) -> Result<Self> {
        if opts.num_parsers == 0 {
            return Err(Error::Config("battery backend requires at least one parser".into()));
        }
        if opts.num_parsers > MAX_INSTANCES {
            return Err(Error::Config(format!(
                "battery backend supports at most {MAX_INSTANCES} parsers, {} requested",
                opts.num_parsers
            )));
        }
        let afu_id = resolve_afu_id(&opts)?;
        tracing::debug!(%afu_id, parsers = opts.num_parsers, "battery context configured");
        let output_schema = if opts.seq_column {
            schema_with_seq_column(&battery_schema())
        } else {
            battery_schema()
        };
        Ok(Self {
            opts,
            afu_id,
            platform,
            allocator,
            addr_map: None,
            outputs: Vec::new(),
            output_schema,
        })
    }

    /// The resolved accelerator function ID.
    #[must_use]
    pub fn afu_id(&self) -> &str {
        &self.afu_id
    }
}

impl ParserContext for BatteryParserContext {
    fn init(&mut self, regions: &[MemoryRegion]) -> Result<()> {
        if regions.len() != self.opts.num_parsers {
            return Err(Error::Accelerator(format!(
                "battery backend requires one input buffer per parser: \
                 {} buffers for {} parsers",
                regions.len(),
                self.opts.num_parsers
            )));
        }

        let output_capacity = self
            .allocator
            .fixed_capacity()
            .unwrap_or(self.opts.output_capacity);

        let mut platform = self.platform.lock();
        let mut addr_map = AddrMap::new();

        for region in regions {
            let device_addr = platform.map_buffer(*region)?;
            addr_map.insert(region.addr, device_addr);
        }

        for idx in 0..self.opts.num_parsers {
            let offsets = self.allocator.allocate(output_capacity)?;
            let values = self.allocator.allocate(output_capacity)?;

            let offsets_da = platform.map_buffer(MemoryRegion {
                addr: offsets.addr(),
                len: offsets.len(),
            })?;
            let values_da = platform.map_buffer(MemoryRegion {
                addr: values.addr(),
                len: values.len(),
            })?;

            // Output addresses are fixed per instance and programmed once.
            let base = instance_base(idx);
            let (off_lo, off_hi) = split_device_addr(offsets_da);
            let (val_lo, val_hi) = split_device_addr(values_da);
            platform.write_mmio(base + reg::OUTPUT_OFFSETS_LO, off_lo)?;
            platform.write_mmio(base + reg::OUTPUT_OFFSETS_HI, off_hi)?;
            platform.write_mmio(base + reg::OUTPUT_VALUES_LO, val_lo)?;
            platform.write_mmio(base + reg::OUTPUT_VALUES_HI, val_hi)?;

            self.outputs.push(OutputRegions { offsets, values });
        }

        self.addr_map = Some(Arc::new(addr_map));
        Ok(())
    }

    fn parsers(&mut self) -> Result<Vec<Box<dyn Parser>>> {
        let addr_map = self
            .addr_map
            .clone()
            .ok_or_else(|| Error::Internal("battery context used before init".into()))?;

        let outputs = std::mem::take(&mut self.outputs);
        if outputs.len() != self.opts.num_parsers {
            return Err(Error::Internal("battery parser fleet already taken".into()));
        }

        Ok(outputs
            .into_iter()
            .enumerate()
            .map(|(idx, regions)| {
                Box::new(BatteryParser {
                    idx,
                    platform: self.platform.clone(),
                    addr_map: addr_map.clone(),
                    offsets: regions.offsets,
                    values: regions.values,
                    seq_column: self.opts.seq_column,
                }) as Box<dyn Parser>
            })
            .collect())
    }

    fn input_schema(&self) -> SchemaRef {
        raw_input_schema()
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    fn check_thread_count(&self, _requested: usize) -> usize {
        self.opts.num_parsers
    }

    fn check_buffer_count(&self, _requested: usize) -> usize {
        self.opts.num_parsers
    }

    fn allocator(&self) -> AllocatorRef {
        self.allocator.clone()
    }
}

/// One kernel instance: programs its register file, polls for
/// completion, and wraps the output regions as a record batch.
struct BatteryParser {
    idx: usize,
    platform: PlatformRef,
    addr_map: Arc<AddrMap>,
    offsets: Allocation,
    values: Allocation,
    seq_column: bool,
}

impl BatteryParser {
    fn parse_one(&mut self, input: &JsonBuffer) -> Result<ParsedBatch> {
        let seq_range = input
            .seq_range()
            .ok_or_else(|| Error::Internal("filled buffer without a sequence range".into()))?;
        let base = instance_base(self.idx);

        {
            let mut platform = self.platform.lock();
            platform.write_mmio(base + reg::CTRL, ctrl::RESET)?;
            platform.write_mmio(base + reg::CTRL, 0)?;

            let input_len = u32::try_from(input.len()).map_err(|_| {
                Error::Accelerator("input buffer exceeds the device's 32-bit index range".into())
            })?;
            platform.write_mmio(base + reg::INPUT_LASTIDX, input_len)?;

            let device_addr = *self.addr_map.get(&input.addr()).ok_or_else(|| {
                Error::Accelerator("input buffer is not registered with the device".into())
            })?;
            let (lo, hi) = split_device_addr(device_addr);
            platform.write_mmio(base + reg::INPUT_VALUES_LO, lo)?;
            platform.write_mmio(base + reg::INPUT_VALUES_HI, hi)?;

            platform.write_mmio(base + reg::CTRL, ctrl::START)?;
            platform.write_mmio(base + reg::CTRL, 0)?;
        }

        // The kernel owns the output regions now; build the sequence
        // column on the host while it works.
        let seq = self.seq_column.then(|| super::build_seq_column(seq_range));

        let num_rows = loop {
            {
                let mut platform = self.platform.lock();
                let status = platform.read_mmio(base + reg::STATUS)?;
                if status & stat::DONE == stat::DONE {
                    let lo = platform.read_mmio(base + reg::RESULT_ROWS_LO)?;
                    let hi = platform.read_mmio(base + reg::RESULT_ROWS_HI)?;
                    break join_words(lo, hi);
                }
            }
            std::thread::sleep(DEVICE_POLL);
        };

        let batch = self.wrap_output(num_rows)?;
        let batch = match seq {
            Some(seq) => prepend_seq_batch(&batch, seq)?,
            None => batch,
        };
        ParsedBatch::new(batch, seq_range)
    }

    /// Copies the kernel's offsets and values regions out into a
    /// `List<UInt64>` battery batch.
    fn wrap_output(&self, num_rows: u64) -> Result<RecordBatch> {
        let num_rows = usize::try_from(num_rows)
            .map_err(|_| Error::Accelerator("device row count overflows usize".into()))?;
        let num_offsets = num_rows + 1;
        if num_offsets * 4 > self.offsets.len() {
            return Err(Error::Accelerator(format!(
                "device reported {num_rows} rows but the offsets region holds {} bytes",
                self.offsets.len()
            )));
        }

        let offsets: Vec<i32> = self.offsets[..num_offsets * 4]
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        // The final offset is the next free index in the values region.
        let num_values = usize::try_from(offsets[num_rows])
            .map_err(|_| Error::Accelerator("device produced a negative value count".into()))?;
        if num_values * 8 > self.values.len() {
            return Err(Error::Accelerator(format!(
                "device reported {num_values} values but the values region holds {} bytes",
                self.values.len()
            )));
        }

        let values: Vec<u64> = self.values[..num_values * 8]
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        let list = ListArray::try_new(
            Arc::new(Field::new("item", DataType::UInt64, false)),
            OffsetBuffer::new(ScalarBuffer::from(offsets)),
            Arc::new(UInt64Array::from(values)),
            None,
        )
        .map_err(|e| Error::Accelerator(format!("device output is not a valid list: {e}")))?;

        RecordBatch::try_new(battery_schema(), vec![Arc::new(list)])
            .map_err(|e| Error::Accelerator(format!("device output batch construction: {e}")))
    }
}

/// Prepends the sequence column that was built while the device worked.
fn prepend_seq_batch(batch: &RecordBatch, seq: UInt64Array) -> Result<RecordBatch> {
    if seq.len() != batch.num_rows() {
        return Err(Error::Internal(format!(
            "sequence column of {} entries for a {}-row batch",
            seq.len(),
            batch.num_rows()
        )));
    }
    let schema = schema_with_seq_column(&batch.schema());
    let mut columns: Vec<arrow_array::ArrayRef> = vec![Arc::new(seq)];
    columns.extend(batch.columns().iter().cloned());
    RecordBatch::try_new(schema, columns)
        .map_err(|e| Error::Internal(format!("sequence column construction: {e}")))
}

impl Parser for BatteryParser {
    fn parse(&mut self, inputs: &[JsonBuffer]) -> Result<Vec<ParsedBatch>> {
        inputs.iter().map(|input| self.parse_one(input)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapAllocator;
    use crate::parse::device::SimPlatform;
    use crate::seq::SeqRange;
    use arrow_array::cast::AsArray;
    use arrow_array::types::UInt64Type;

    fn test_options(parsers: usize) -> BatteryOptions {
        BatteryOptions {
            num_parsers: parsers,
            output_capacity: 4096,
            ..BatteryOptions::default()
        }
    }

    fn init_context(parsers: usize, buffers: &[JsonBuffer]) -> BatteryParserContext {
        let mut ctx = BatteryParserContext::with_platform(
            test_options(parsers),
            SimPlatform::shared(2),
            Arc::new(HeapAllocator),
        )
        .unwrap();
        let regions: Vec<MemoryRegion> = buffers
            .iter()
            .map(|b| MemoryRegion {
                addr: b.addr(),
                len: b.capacity(),
            })
            .collect();
        ctx.init(&regions).unwrap();
        ctx
    }

    fn filled_buffer(records: &[&str], range: SeqRange) -> JsonBuffer {
        use crate::alloc::Allocator;
        let mut buf = JsonBuffer::new(HeapAllocator.allocate(1024).unwrap());
        for record in records {
            buf.push_record(record.as_bytes()).unwrap();
        }
        buf.set_seq_range(range);
        buf
    }

    #[test]
    fn afu_id_is_derived_from_parser_count() {
        let opts = test_options(8);
        assert_eq!(
            resolve_afu_id(&opts).unwrap(),
            format!("{BATTERY_AFU_ID_STEM}08")
        );

        let explicit = BatteryOptions {
            afu_id: Some("cafe".into()),
            ..test_options(8)
        };
        assert_eq!(resolve_afu_id(&explicit).unwrap(), "cafe");
    }

    #[test]
    fn afu_id_derivation_caps_at_255() {
        let opts = test_options(256);
        assert!(matches!(resolve_afu_id(&opts), Err(Error::Config(_))));
    }

    #[test]
    fn parser_count_above_window_is_config_error() {
        let result = BatteryParserContext::with_platform(
            test_options(257),
            SimPlatform::shared(0),
            Arc::new(HeapAllocator),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn counts_are_forced_to_parser_count() {
        let buf = filled_buffer(&[r#"{"voltage":[1]}"#], SeqRange::new(0, 0));
        let ctx = init_context(1, std::slice::from_ref(&buf));
        assert_eq!(ctx.check_thread_count(16), 1);
        assert_eq!(ctx.check_buffer_count(16), 1);
    }

    #[test]
    fn init_requires_one_buffer_per_parser() {
        let buf = filled_buffer(&[r#"{"voltage":[1]}"#], SeqRange::new(0, 0));
        let mut ctx = BatteryParserContext::with_platform(
            test_options(2),
            SimPlatform::shared(0),
            Arc::new(HeapAllocator),
        )
        .unwrap();
        let regions = [MemoryRegion {
            addr: buf.addr(),
            len: buf.capacity(),
        }];
        assert!(matches!(ctx.init(&regions), Err(Error::Accelerator(_))));
    }

    #[test]
    fn parses_battery_records_through_the_sim_device() {
        let buf = filled_buffer(
            &[r#"{"voltage":[3,1,4]}"#, r#"{"voltage":[15]}"#],
            SeqRange::new(6, 7),
        );
        let mut ctx = init_context(1, std::slice::from_ref(&buf));
        let mut parsers = ctx.parsers().unwrap();

        let batches = parsers[0].parse(std::slice::from_ref(&buf)).unwrap();
        assert_eq!(batches.len(), 1);
        let parsed = &batches[0];
        assert_eq!(parsed.seq_range, SeqRange::new(6, 7));
        assert_eq!(parsed.batch.num_rows(), 2);

        // Column 0 is the sequence column, column 1 the voltage lists.
        let seq = parsed.batch.column(0).as_primitive::<UInt64Type>();
        assert_eq!(&seq.values()[..], &[6, 7]);
        let list = parsed.batch.column(1).as_list::<i32>();
        assert_eq!(
            &list.value(0).as_primitive::<UInt64Type>().values()[..],
            &[3, 1, 4]
        );
        assert_eq!(&list.value(1).as_primitive::<UInt64Type>().values()[..], &[15]);
    }

    #[test]
    fn unregistered_buffer_is_an_accelerator_error() {
        let registered = filled_buffer(&[r#"{"voltage":[1]}"#], SeqRange::new(0, 0));
        let mut ctx = init_context(1, std::slice::from_ref(&registered));
        let mut parsers = ctx.parsers().unwrap();

        let stranger = filled_buffer(&[r#"{"voltage":[1]}"#], SeqRange::new(1, 1));
        assert!(matches!(
            parsers[0].parse(std::slice::from_ref(&stranger)),
            Err(Error::Accelerator(_))
        ));
    }
}
