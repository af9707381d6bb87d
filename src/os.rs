//! Cross-platform bindings to the OS virtual-memory primitives every
//! arena is built on: reserve, commit, decommit, release, protect.
//!
//! Unlike the C bindings this module replaces, there is no helper library
//! to link against; we talk to `libc` or `windows-sys` directly.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Page protection levels recognized by [`protect`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadOnly,
    ReadWrite,
}

#[cfg(unix)]
fn page_size_raw() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
    ret as usize
}

#[cfg(windows)]
fn page_size_raw() -> usize {
    use windows_sys::Win32::System::SystemInformation::GetSystemInfo;
    use windows_sys::Win32::System::SystemInformation::SYSTEM_INFO;

    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_raw();
}

/// Returns the system's page granularity.  Memoized: every caller in this
/// crate assumes it never changes for the life of the process.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `n` up to the next page boundary.
#[inline]
pub fn page_align_up(n: usize) -> usize {
    crate::policy::align_up(n, page_size())
}

fn last_os_error() -> Error {
    Error::OsMemory(std::io::Error::last_os_error())
}

/// Reserves `size` bytes of address space with no backing.
///
/// `size` must be a nonzero multiple of the page size.
#[requires(size > 0 && size % page_size() == 0, "reserve size must be a nonzero page multiple")]
pub fn reserve(size: usize) -> Result<NonNull<u8>> {
    #[cfg(unix)]
    {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(last_os_error());
        }

        Ok(NonNull::new(addr as *mut u8).expect("mmap must not return null on success"))
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_NOACCESS};

        let addr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };

        NonNull::new(addr as *mut u8).ok_or_else(last_os_error)
    }
}

/// Reserves and immediately commits `size` bytes: the common case for
/// fixed-size arenas and large blocks, where lazy commit buys nothing.
#[requires(size > 0 && size % page_size() == 0)]
pub fn reserve_commit(size: usize) -> Result<NonNull<u8>> {
    #[cfg(unix)]
    {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(last_os_error());
        }

        Ok(NonNull::new(addr as *mut u8).expect("mmap must not return null on success"))
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
        };

        let addr = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };

        NonNull::new(addr as *mut u8).ok_or_else(last_os_error)
    }
}

/// Backs `[base, base+size)` with (demand-faulted) read-write memory.
///
/// `base` and `size` must already describe a page-aligned subrange of a
/// live reservation.
#[requires(size % page_size() == 0)]
pub fn commit(base: NonNull<u8>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let ret = unsafe {
            libc::mprotect(
                base.as_ptr() as *mut _,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };

        if ret != 0 {
            return Err(last_os_error());
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};

        let addr = unsafe {
            VirtualAlloc(base.as_ptr() as *const _, size, MEM_COMMIT, PAGE_READWRITE)
        };

        if addr.is_null() {
            return Err(last_os_error());
        }

        Ok(())
    }
}

/// Releases the physical backing of `[base, base+size)` while keeping the
/// reservation alive.  The range may be re-touched after a future `commit`.
#[requires(size % page_size() == 0)]
pub fn decommit(base: NonNull<u8>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        // `MADV_DONTNEED` drops the backing pages but keeps the mapping
        // readable (they'll simply fault in zeroed); pair it with
        // `PROT_NONE` so a stray touch is caught rather than silently
        // reviving the range.
        let advise = unsafe { libc::madvise(base.as_ptr() as *mut _, size, libc::MADV_DONTNEED) };
        if advise != 0 {
            return Err(last_os_error());
        }

        let ret = unsafe { libc::mprotect(base.as_ptr() as *mut _, size, libc::PROT_NONE) };
        if ret != 0 {
            return Err(last_os_error());
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};

        let ret = unsafe { VirtualFree(base.as_ptr() as *mut _, size, MEM_DECOMMIT) };
        if ret == 0 {
            return Err(last_os_error());
        }

        Ok(())
    }
}

/// Frees an entire reservation made with [`reserve`] or [`reserve_commit`].
pub fn release(base: NonNull<u8>, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let ret = unsafe { libc::munmap(base.as_ptr() as *mut _, size) };
        if ret != 0 {
            return Err(last_os_error());
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

        // MEM_RELEASE requires the size argument to be zero; it always
        // frees the whole reservation `base` belongs to.
        let _ = size;
        let ret = unsafe { VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE) };
        if ret == 0 {
            return Err(last_os_error());
        }

        Ok(())
    }
}

/// Changes the protection of `[base, base+size)`.  Used to bracket
/// mutation of large-block headers, which otherwise stay read-only.
pub fn protect(base: NonNull<u8>, size: usize, prot: Protection) -> Result<()> {
    if size == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let flags = match prot {
            Protection::None => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        };

        let ret = unsafe { libc::mprotect(base.as_ptr() as *mut _, size, flags) };
        if ret != 0 {
            return Err(last_os_error());
        }

        Ok(())
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{
            VirtualProtect, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
        };

        let flags = match prot {
            Protection::None => PAGE_NOACCESS,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
        };

        let mut old = 0u32;
        let ret =
            unsafe { VirtualProtect(base.as_ptr() as *const _, size, flags, &mut old) };
        if ret == 0 {
            return Err(last_os_error());
        }

        Ok(())
    }
}
