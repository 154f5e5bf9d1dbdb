use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Protection;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates an anonymous mapping of `len` bytes whose base address is a
    /// multiple of `align`.
    ///
    /// For alignments above the page size the region is over-mapped by
    /// `align` bytes and the misaligned head and tail are unmapped again,
    /// leaving exactly the aligned window.
    ///
    /// # Safety
    ///
    /// Calls `mmap`/`munmap`.
    pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<MmapInner> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        if align <= page_size() {
            let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            return Ok(MmapInner { ptr, len });
        }

        let over = len + align;
        let raw = unsafe { libc::mmap(ptr::null_mut(), over, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let base = raw as usize;
        let aligned = (base + align - 1) & !(align - 1);
        let head = aligned - base;
        let tail = over - head - len;

        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(MmapInner {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}

pub unsafe fn protect(addr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    let prot = match prot {
        Protection::None => libc::PROT_NONE,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
