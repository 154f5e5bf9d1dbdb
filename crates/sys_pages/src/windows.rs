use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::Protection;

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` base addresses are aligned to this value (typically 64KB),
/// which is larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates an anonymous mapping of `len` bytes aligned to `align`.
    ///
    /// Windows cannot trim a reservation, so large alignments are obtained
    /// by reserving an oversized region to discover an aligned address,
    /// releasing it, and committing at that exact address. Another thread
    /// can steal the address between the release and the re-map, so the
    /// cycle retries a few times before giving up.
    pub unsafe fn map_aligned(len: usize, align: usize) -> io::Result<MmapInner> {
        if align <= allocation_granularity() {
            let ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            return Ok(MmapInner { ptr, len });
        }

        for _ in 0..16 {
            let probe = unsafe { VirtualAlloc(ptr::null(), len + align, MEM_RESERVE, PAGE_READWRITE) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = ((probe as usize) + align - 1) & !(align - 1);
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let ptr = unsafe {
                VirtualAlloc(
                    aligned as *const std::ffi::c_void,
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if !ptr.is_null() {
                return Ok(MmapInner { ptr, len });
            }
        }

        Err(Error::new(
            io::ErrorKind::AddrNotAvailable,
            "could not obtain an aligned mapping",
        ))
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}

pub unsafe fn protect(addr: *mut u8, len: usize, prot: Protection) -> io::Result<()> {
    let new = match prot {
        Protection::None => PAGE_NOACCESS,
        Protection::ReadWrite => PAGE_READWRITE,
    };
    let mut old = 0u32;
    let rc = unsafe { VirtualProtect(addr.cast(), len, new, &mut old) };
    if rc == 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
