//! Accelerator register interface.
//!
//! The parser kernel is programmed through a 1 MiB memory-mapped
//! register window holding up to 256 instances, one per parser. All
//! offsets are in 32-bit word units. Device-address translation is a
//! pure lookup built once at context construction; the hot path never
//! calls into a driver.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::MemoryRegion;

/// Byte stride between instance register files.
pub const INSTANCE_STRIDE_BYTES: usize = 0x1000;
/// Word stride between instance register files.
pub const INSTANCE_STRIDE_WORDS: usize = INSTANCE_STRIDE_BYTES / 4;
/// Size of the register window.
pub const MMIO_WINDOW_BYTES: usize = 1024 * 1024;
/// Maximum parser instances addressable in the window.
pub const MAX_INSTANCES: usize = MMIO_WINDOW_BYTES / INSTANCE_STRIDE_BYTES;

/// Word offsets within one instance's register file.
///
/// Four platform-default registers lead, then the Arrow range registers,
/// the input address registers, the output address registers, and the
/// kernel's custom registers.
pub mod reg {
    /// First valid input byte index (implicitly zero; never written).
    pub const INPUT_FIRSTIDX: usize = 4;
    /// Last valid input byte index.
    pub const INPUT_LASTIDX: usize = 5;
    /// First output row index.
    pub const OUTPUT_FIRSTIDX: usize = 6;
    /// Last output row index.
    pub const OUTPUT_LASTIDX: usize = 7;
    /// Input values device address, low half.
    pub const INPUT_VALUES_LO: usize = 8;
    /// Input values device address, high half.
    pub const INPUT_VALUES_HI: usize = 9;
    /// Output offsets device address, low half.
    pub const OUTPUT_OFFSETS_LO: usize = 10;
    /// Output offsets device address, high half.
    pub const OUTPUT_OFFSETS_HI: usize = 11;
    /// Output values device address, low half.
    pub const OUTPUT_VALUES_LO: usize = 12;
    /// Output values device address, high half.
    pub const OUTPUT_VALUES_HI: usize = 13;
    /// Kernel control register.
    pub const CTRL: usize = 14;
    /// Kernel status register.
    pub const STATUS: usize = 15;
    /// Result row count, low half.
    pub const RESULT_ROWS_LO: usize = 16;
    /// Result row count, high half.
    pub const RESULT_ROWS_HI: usize = 17;
}

/// Control register bits.
pub mod ctrl {
    /// Start the kernel.
    pub const START: u32 = 1 << 0;
    /// Stop the kernel.
    pub const STOP: u32 = 1 << 1;
    /// Reset the kernel.
    pub const RESET: u32 = 1 << 2;
}

/// Status register bits.
pub mod stat {
    /// Kernel is idle.
    pub const IDLE: u32 = 1 << 0;
    /// Kernel is busy.
    pub const BUSY: u32 = 1 << 1;
    /// Kernel has completed.
    pub const DONE: u32 = 1 << 2;
}

/// Word offset of instance `idx`'s register file.
#[must_use]
pub fn instance_base(idx: usize) -> usize {
    idx * INSTANCE_STRIDE_WORDS
}

/// Splits a device address into its register halves.
#[must_use]
pub fn split_device_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

/// Rebuilds a 64-bit value from its register halves.
#[must_use]
pub fn join_words(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Host address → device address map, frozen after context init.
pub type AddrMap = HashMap<usize, u64>;

/// Serialized access to the accelerator register window.
///
/// The register interface is shared across all parser instances, so
/// every implementation sits behind the platform mutex; holders perform
/// the whole reset-configure-start sequence of one parse under a single
/// lock and release it only for the poll sleep.
pub trait MmioPlatform: Send {
    /// Reads the 32-bit register at `offset` words.
    fn read_mmio(&mut self, offset: usize) -> Result<u32>;

    /// Writes the 32-bit register at `offset` words.
    fn write_mmio(&mut self, offset: usize, value: u32) -> Result<()>;

    /// Registers a host memory region with the device and returns its
    /// device address. Called only during context init.
    fn map_buffer(&mut self, region: MemoryRegion) -> Result<u64>;
}

/// Shared, serialized platform handle.
pub type PlatformRef = Arc<Mutex<dyn MmioPlatform>>;

// ── Hardware platform ──────────────────────────────────────────────

/// Register window mapped from a UIO or PCI resource file.
pub struct MappedPlatform {
    window: memmap2::MmapMut,
}

impl MappedPlatform {
    /// Maps the register window from `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Accelerator` when the file cannot be opened or
    /// mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                Error::Accelerator(format!("cannot open device {}: {e}", path.display()))
            })?;
        // SAFETY: the mapping is private to this process and accessed
        // only through volatile 32-bit loads and stores below.
        let window = unsafe {
            memmap2::MmapOptions::new()
                .len(MMIO_WINDOW_BYTES)
                .map_mut(&file)
        }
        .map_err(|e| Error::Accelerator(format!("cannot map device {}: {e}", path.display())))?;
        Ok(Self { window })
    }

    fn word_ptr(&mut self, offset: usize) -> Result<*mut u32> {
        let byte = offset
            .checked_mul(4)
            .filter(|b| b + 4 <= MMIO_WINDOW_BYTES)
            .ok_or_else(|| {
                Error::Accelerator(format!("register offset {offset} outside MMIO window"))
            })?;
        Ok(self.window.as_mut_ptr().wrapping_add(byte).cast::<u32>())
    }
}

impl MmioPlatform for MappedPlatform {
    fn read_mmio(&mut self, offset: usize) -> Result<u32> {
        let ptr = self.word_ptr(offset)?;
        // SAFETY: in-bounds, 4-aligned pointer into the mapped window.
        let value = unsafe { std::ptr::read_volatile(ptr) };
        tracing::trace!(offset, value = format_args!("{value:#010x}"), "mmio read");
        Ok(value)
    }

    fn write_mmio(&mut self, offset: usize, value: u32) -> Result<()> {
        tracing::trace!(offset, value = format_args!("{value:#010x}"), "mmio write");
        let ptr = self.word_ptr(offset)?;
        // SAFETY: in-bounds, 4-aligned pointer into the mapped window.
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }

    fn map_buffer(&mut self, region: MemoryRegion) -> Result<u64> {
        // Huge-page regions are device-visible at their host address.
        Ok(region.addr as u64)
    }
}

// ── Simulated platform ─────────────────────────────────────────────

/// Software model of the battery-status parser kernel.
///
/// Backs tests and benches without hardware: a `start` write parses the
/// registered input region on the host and fills the registered output
/// regions exactly as the kernel would. The model also asserts the
/// register-window locking discipline: while one instance is between
/// `reset` and `start`, touching any other instance's registers panics.
pub struct SimPlatform {
    regs: Vec<u32>,
    regions: Vec<MemoryRegion>,
    busy_polls: u32,
    pending: HashMap<usize, u32>,
    configuring: Option<usize>,
}

impl SimPlatform {
    /// Creates a model whose status register reports busy for
    /// `busy_polls` reads after each start before turning done.
    #[must_use]
    pub fn new(busy_polls: u32) -> Self {
        Self {
            regs: vec![0; MMIO_WINDOW_BYTES / 4],
            regions: Vec::new(),
            busy_polls,
            pending: HashMap::new(),
            configuring: None,
        }
    }

    /// Creates a shared handle around a model.
    #[must_use]
    pub fn shared(busy_polls: u32) -> PlatformRef {
        Arc::new(Mutex::new(Self::new(busy_polls)))
    }

    fn assert_exclusive(&self, instance: usize) {
        if let Some(owner) = self.configuring {
            assert!(
                owner == instance,
                "instance {instance} touched the register window while instance {owner} \
                 holds the configure sequence; platform mutex discipline violated"
            );
        }
    }

    fn region_slice(&self, addr: u64, len: usize) -> Result<&'static [u8]> {
        let addr = addr as usize;
        self.regions
            .iter()
            .find(|r| addr >= r.addr && addr + len <= r.addr + r.len)
            .ok_or_else(|| {
                Error::Accelerator(format!("device access to unmapped address {addr:#x}"))
            })?;
        // SAFETY: the range was validated against a registered region
        // whose allocation outlives the platform.
        Ok(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    fn region_slice_mut(&self, addr: u64, len: usize) -> Result<&'static mut [u8]> {
        let addr = addr as usize;
        self.regions
            .iter()
            .find(|r| addr >= r.addr && addr + len <= r.addr + r.len)
            .ok_or_else(|| {
                Error::Accelerator(format!("device write to unmapped address {addr:#x}"))
            })?;
        // SAFETY: as above; the kernel is the only writer while the
        // owning parser polls.
        Ok(unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, len) })
    }

    fn reg(&self, instance: usize, reg: usize) -> u32 {
        self.regs[instance_base(instance) + reg]
    }

    /// Runs the kernel for `instance`: parse the input region as
    /// newline-delimited battery records, emit list offsets and values.
    fn run_kernel(&mut self, instance: usize) -> Result<()> {
        let input_addr = join_words(
            self.reg(instance, reg::INPUT_VALUES_LO),
            self.reg(instance, reg::INPUT_VALUES_HI),
        );
        let input_len = self.reg(instance, reg::INPUT_LASTIDX) as usize;
        let input = self.region_slice(input_addr, input_len)?;

        let mut offsets: Vec<i32> = vec![0];
        let mut values: Vec<u64> = Vec::new();
        for line in input.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let record: serde_json::Value = serde_json::from_slice(line).map_err(|e| {
                Error::Accelerator(format!("kernel rejected record: {e}"))
            })?;
            let voltage = record
                .get("voltage")
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    Error::Accelerator("kernel rejected record: no voltage array".into())
                })?;
            for v in voltage {
                values.push(v.as_u64().ok_or_else(|| {
                    Error::Accelerator("kernel rejected record: non-u64 voltage".into())
                })?);
            }
            offsets.push(i32::try_from(values.len()).map_err(|_| {
                Error::Accelerator("kernel offset overflow".into())
            })?);
        }
        let num_rows = offsets.len() as u64 - 1;

        let offsets_addr = join_words(
            self.reg(instance, reg::OUTPUT_OFFSETS_LO),
            self.reg(instance, reg::OUTPUT_OFFSETS_HI),
        );
        let out_offsets = self.region_slice_mut(offsets_addr, offsets.len() * 4)?;
        for (chunk, v) in out_offsets.chunks_exact_mut(4).zip(&offsets) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }

        let values_addr = join_words(
            self.reg(instance, reg::OUTPUT_VALUES_LO),
            self.reg(instance, reg::OUTPUT_VALUES_HI),
        );
        let out_values = self.region_slice_mut(values_addr, values.len() * 8)?;
        for (chunk, v) in out_values.chunks_exact_mut(8).zip(&values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }

        let (lo, hi) = split_device_addr(num_rows);
        let base = instance_base(instance);
        self.regs[base + reg::RESULT_ROWS_LO] = lo;
        self.regs[base + reg::RESULT_ROWS_HI] = hi;
        self.regs[base + reg::STATUS] = stat::BUSY;
        self.pending.insert(instance, self.busy_polls);
        Ok(())
    }
}

impl MmioPlatform for SimPlatform {
    fn read_mmio(&mut self, offset: usize) -> Result<u32> {
        let instance = offset / INSTANCE_STRIDE_WORDS;
        self.assert_exclusive(instance);
        if offset % INSTANCE_STRIDE_WORDS == reg::STATUS {
            if let Some(remaining) = self.pending.get(&instance).copied() {
                if remaining == 0 {
                    self.pending.remove(&instance);
                    self.regs[offset] = stat::DONE;
                } else {
                    self.pending.insert(instance, remaining - 1);
                }
            }
        }
        self.regs
            .get(offset)
            .copied()
            .ok_or_else(|| Error::Accelerator(format!("register offset {offset} out of window")))
    }

    fn write_mmio(&mut self, offset: usize, value: u32) -> Result<()> {
        let instance = offset / INSTANCE_STRIDE_WORDS;
        self.assert_exclusive(instance);
        if offset >= self.regs.len() {
            return Err(Error::Accelerator(format!(
                "register offset {offset} out of window"
            )));
        }
        self.regs[offset] = value;

        if offset % INSTANCE_STRIDE_WORDS == reg::CTRL {
            if value & ctrl::RESET != 0 {
                let base = instance_base(instance);
                self.regs[base + reg::STATUS] = stat::IDLE;
                self.regs[base + reg::RESULT_ROWS_LO] = 0;
                self.regs[base + reg::RESULT_ROWS_HI] = 0;
                self.pending.remove(&instance);
                self.configuring = Some(instance);
            } else if value & ctrl::START != 0 {
                self.configuring = None;
                self.run_kernel(instance)?;
            }
        }
        Ok(())
    }

    fn map_buffer(&mut self, region: MemoryRegion) -> Result<u64> {
        self.regions.push(region);
        Ok(region.addr as u64)
    }
}
