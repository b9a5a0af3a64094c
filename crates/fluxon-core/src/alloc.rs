//! Pluggable backing memory for input buffers and parser output regions.
//!
//! The software backend is happy with ordinary heap memory. The
//! accelerator backend requires device-visible regions backed by 1 GiB
//! huge pages, allocated once at startup and addressed by their stable
//! host pointer for the lifetime of the process.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Size of a single huge-page-backed allocation: exactly 1 GiB.
///
/// The accelerator addresses its input and output regions through a
/// translation map built at startup, and the platform constrains those
/// regions to single fixed-size huge-page mappings. Re-mapping per batch
/// would dominate runtime, so the region size is not negotiable.
pub const HUGE_PAGE_REGION_SIZE: usize = 1024 * 1024 * 1024;

const MAP_HUGE_1GB: i32 = 30 << 26; // MAP_HUGE_SHIFT = 26

/// A zero-initialized region of bytes with a stable address.
///
/// Dereferences to `[u8]`. Heap-backed regions are freed on drop;
/// huge-page regions are left mapped until process exit (see
/// [`HugePageAllocator`]).
pub struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

enum Backing {
    Heap,
    HugePage,
}

// The region is exclusively owned by the Allocation and only reachable
// through it, so moving it across threads is sound.
unsafe impl Send for Allocation {}

impl Allocation {
    /// The region's stable host address, used as the key into the
    /// host-to-device address map.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The region length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for Allocation {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for Allocation {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap => {
                let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
                drop(unsafe { Box::from_raw(slice) });
            }
            // Unmapping huge-page regions currently fails with an
            // unexplained error on the target platform; the mapping is
            // reclaimed at process exit instead. Allocations only happen
            // at startup, so steady state never leaks.
            Backing::HugePage => {}
        }
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// Allocator for input buffers and parser output regions.
///
/// The parser context decides which allocator the buffer pool must use,
/// so device-visible backends can force their memory constraints onto
/// ingress without the pool knowing about devices.
pub trait Allocator: Send + Sync {
    /// Allocates a zero-initialized region of at least `size` bytes.
    fn allocate(&self, size: usize) -> Result<Allocation>;

    /// The fixed region size this allocator hands out, if it ignores the
    /// requested size.
    fn fixed_capacity(&self) -> Option<usize> {
        None
    }
}

/// Ordinary heap allocator.
#[derive(Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::Internal("zero-sized allocation requested".into()));
        }
        let boxed: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed).cast::<u8>();
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::Internal("heap allocation returned null".into()))?;
        Ok(Allocation {
            ptr,
            len,
            backing: Backing::Heap,
        })
    }
}

/// Huge-page allocator for accelerator-visible memory.
///
/// Always maps exactly [`HUGE_PAGE_REGION_SIZE`] bytes per request,
/// private and anonymous, backed by 1 GiB huge pages and zeroed. Freeing
/// is deferred to process exit (see [`Allocation`]'s drop).
#[derive(Debug, Default)]
pub struct HugePageAllocator;

impl Allocator for HugePageAllocator {
    fn allocate(&self, size: usize) -> Result<Allocation> {
        if size != HUGE_PAGE_REGION_SIZE {
            tracing::warn!(
                requested = size,
                fixed = HUGE_PAGE_REGION_SIZE,
                "huge-page allocator ignores requested size and maps a full region"
            );
        }
        let len = HUGE_PAGE_REGION_SIZE;

        // SAFETY: anonymous private mapping with no file descriptor; the
        // result is checked against MAP_FAILED before use.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | MAP_HUGE_1GB,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error();
            return Err(Error::Accelerator(format!(
                "unable to map 1 GiB huge-page region: {errno}"
            )));
        }

        // SAFETY: the mapping above succeeded and covers `len` bytes.
        unsafe { std::ptr::write_bytes(raw.cast::<u8>(), 0, len) };

        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| Error::Accelerator("huge-page mapping returned null".into()))?;
        Ok(Allocation {
            ptr,
            len,
            backing: Backing::HugePage,
        })
    }

    fn fixed_capacity(&self) -> Option<usize> {
        Some(HUGE_PAGE_REGION_SIZE)
    }
}

/// Shared allocator handle.
pub type AllocatorRef = Arc<dyn Allocator>;
