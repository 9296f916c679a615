//! Shared memory segment using Linux memfd.
//!
//! Shared pools place model weights and scratch buffers in anonymous shared
//! memory so that a sidecar process (a tokenizer, a preprocessing worker)
//! can map the same pages by receiving the fd over a Unix socket.

use super::{IpcHandle, MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

/// Page granularity used to round shared regions.
const PAGE_SIZE: usize = 4096;

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// The requested size is rounded up to whole pages; [`len`](MemorySegment::len)
/// reports the rounded size.
pub struct SharedMemorySegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new shared memory region.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name (visible in `/proc/self/fd/`).
    /// * `size` - Minimum size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        let len = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, len as u64)?;

        // SAFETY: fresh mapping of a memfd we own, no existing references.
        let ptr = unsafe { map_shared(&fd, len)? };

        Ok(Self {
            fd,
            ptr,
            len,
            name: Some(name.to_string()),
        })
    }

    /// Map a region received from another process.
    ///
    /// # Safety
    ///
    /// `fd` must be a memfd of at least `size` bytes.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        // SAFETY: caller guarantees fd covers size bytes.
        let ptr = unsafe { map_shared(&fd, size)? };
        Ok(Self {
            fd,
            ptr,
            len: size,
            name: None,
        })
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// mmap `len` bytes of `fd` read-write and shared.
///
/// # Safety
///
/// `fd` must refer to a file of at least `len` bytes.
unsafe fn map_shared(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: forwarded from caller.
    let raw = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(raw.cast::<u8>()).ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Shared
    }

    fn ipc_handle(&self) -> Option<IpcHandle> {
        Some(IpcHandle {
            fd: self.fd.as_raw_fd(),
            size: self.len,
        })
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: the mapping was created with this length and is not used after drop.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is process-wide and the fd is kernel reference-counted.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
