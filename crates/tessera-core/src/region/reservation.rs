//! Raw address-space reservation
//!
//! Thin wrapper over `mmap`/`mprotect`/`msync`/`madvise` for one fixed,
//! contiguous range. All offsets are relative to the reservation base and
//! must be page aligned; callers in this module only ever pass whole
//! region pages.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

/// A reserved virtual address range, unmapped on drop
pub(crate) struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

// The reservation is plain address space; access is serialized by the owner.
unsafe impl Send for Reservation {}

impl Reservation {
    /// Reserve `len` bytes. With `committed`, the whole range is readable
    /// and writable immediately; otherwise every access faults until a
    /// page is committed or mapped.
    pub fn reserve(len: usize, committed: bool) -> io::Result<Self> {
        let prot = if committed {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        let base = unsafe {
            libc::mmap(
                /* addr   */ ptr::null_mut(),
                /* length */ len,
                /* prot   */ prot,
                /* flags  */ libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                /* fd     */ -1,
                /* offset */ 0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null reservation"))?;
        Ok(Self { base, len })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn addr(&self, offset: usize, len: usize) -> *mut libc::c_void {
        debug_assert!(offset + len <= self.len);
        unsafe { self.base.as_ptr().add(offset).cast() }
    }

    /// Make an anonymous range readable and writable, then zero it
    pub fn commit_anonymous(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = self.addr(offset, len);
        let ok = unsafe {
            libc::mprotect(
                /* addr */ addr,
                /* len  */ len,
                /* prot */ libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ok != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { ptr::write_bytes(addr.cast::<u8>(), 0, len) };
        Ok(())
    }

    /// Map `len` bytes of `fd` at `file_offset` over the range, shared
    pub fn map_file(&self, offset: usize, len: usize, fd: RawFd, file_offset: u64) -> io::Result<()> {
        let addr = self.addr(offset, len);
        let mapped = unsafe {
            libc::mmap(
                /* addr   */ addr,
                /* length */ len,
                /* prot   */ libc::PROT_READ | libc::PROT_WRITE,
                /* flags  */ libc::MAP_FIXED | libc::MAP_SHARED,
                /* fd     */ fd,
                /* offset */ file_offset as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Replace the range with an inaccessible anonymous mapping, keeping
    /// the addresses reserved
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = self.addr(offset, len);
        let mapped = unsafe {
            libc::mmap(
                /* addr   */ addr,
                /* length */ len,
                /* prot   */ libc::PROT_NONE,
                /* flags  */
                libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                /* fd     */ -1,
                /* offset */ 0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Synchronously write back a shared range
    pub fn sync(&self, offset: usize, len: usize) -> io::Result<()> {
        let ok = unsafe { libc::msync(self.addr(offset, len), len, libc::MS_SYNC) };
        if ok != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Let the kernel drop resident copies of a range
    pub fn advise_dontneed(&self, offset: usize, len: usize) -> io::Result<()> {
        let ok = unsafe { libc::madvise(self.addr(offset, len), len, libc::MADV_DONTNEED) };
        if ok != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr(offset, len).cast::<u8>(), len) }
    }

    pub fn as_mut_slice(&mut self, offset: usize, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr(offset, len).cast::<u8>(), len) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let ok = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        if ok != 0 {
            tracing::error!(
                "Could not release region reservation: {}",
                io::Error::last_os_error()
            );
        }
    }
}
