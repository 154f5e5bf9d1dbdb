//! Anonymous page mappings for the collector's heap structures.
//!
//! The collector needs two things from the OS that `std` does not offer:
//! mappings whose base address satisfies a large power-of-two alignment
//! (so that an address inside a region can be rounded down to the region
//! base with a bitmask), and page-granular protection changes (to place a
//! trap page behind the shadow stack).

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows this is typically 64KB; on Unix it equals the page size.
/// Mapping lengths and alignment requests below this value are rounded up.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access protection for a page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access; any read or write faults.
    None,
    /// Normal read/write access.
    ReadWrite,
}

/// Changes the protection of a page-aligned range inside an existing mapping.
///
/// `addr` must be page-aligned and `[addr, addr + len)` must lie inside a
/// mapping returned by [`MmapOptions::map_anon`].
///
/// # Errors
///
/// Returns the OS error if the protection change is rejected.
///
/// # Safety
///
/// Revoking access to pages that are still dereferenced elsewhere turns
/// those accesses into faults.
pub unsafe fn protect(addr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    unsafe { os::protect(addr, len, prot) }
}

/// A handle to an anonymous memory mapping.
///
/// The region is unmapped when the handle is dropped. The memory is
/// zero-initialized by the OS.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating an anonymous mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
}

impl MmapOptions {
    /// Creates options with length 0 and no alignment requirement.
    /// A length must be set before mapping.
    pub fn new() -> Self {
        Self { len: 0, align: 0 }
    }

    /// Sets the length of the mapping in bytes. Rounded up to the
    /// allocation granularity.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests that the base address be aligned to `align` bytes.
    ///
    /// `align` must be a power of two. Alignments at or below the
    /// allocation granularity are satisfied by any mapping; larger
    /// alignments are produced by over-mapping and trimming (Unix) or by
    /// a reserve/re-map cycle (Windows).
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Creates the anonymous mapping.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping cannot be established, or
    /// `InvalidInput` for a zero length or a non-power-of-two alignment.
    ///
    /// # Safety
    ///
    /// The mapping itself is owned by the returned `Mmap`; using raw
    /// pointers derived from it past the handle's lifetime is undefined
    /// behavior, which is why creation is marked unsafe.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let gran = allocation_granularity();
        let len = round_up(self.len, gran);
        let align = self.align.max(gran);

        let inner = unsafe { os::MmapInner::map_aligned(len, align)? };
        debug_assert_eq!(inner.ptr() as usize % align, 0);
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}
