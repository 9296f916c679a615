//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// A memory segment backed by an aligned heap allocation.
///
/// This is the backing for CPU pools. It does not support cross-process
/// sharing; use [`SharedMemorySegment`](super::SharedMemorySegment) for that.
///
/// # Example
///
/// ```rust
/// use cistern::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024, 64).unwrap();
/// assert_eq!(segment.len(), 1024);
/// assert_eq!(segment.as_ptr() as usize % 64, 0);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment.
    ///
    /// # Arguments
    ///
    /// * `size` - Size in bytes. Must be greater than 0.
    /// * `align` - Alignment of the segment start (must be a power of 2).
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0, the alignment is invalid, or the
    /// allocator refuses the request.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }

        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::AllocationFailed(format!("invalid layout: {}", e)))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::AllocationFailed(format!("failed to allocate {} bytes", size))
        })?;

        Ok(Self { ptr, layout })
    }

    /// Alignment of the segment start.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Cpu
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: HeapSegment exclusively owns its allocation; synchronizing access
// to the bytes is the job of the pool that carves it up.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_segment_creation() {
        let segment = HeapSegment::new(1024, 16).unwrap();
        assert_eq!(segment.len(), 1024);
        assert_eq!(segment.memory_type(), MemoryType::Cpu);
        assert!(segment.ipc_handle().is_none());
    }

    #[test]
    fn test_heap_segment_zero_size_fails() {
        assert!(HeapSegment::new(0, 16).is_err());
    }

    #[test]
    fn test_heap_segment_bad_alignment() {
        let result = HeapSegment::new(1024, 24);
        assert!(matches!(result, Err(Error::InvalidAlignment(24))));
    }

    #[test]
    fn test_heap_segment_alignment_honored() {
        for align in [8, 64, 4096] {
            let segment = HeapSegment::new(8192, align).unwrap();
            assert_eq!(segment.base_address() % align, 0);
            assert_eq!(segment.alignment(), align);
        }
    }

    #[test]
    fn test_heap_segment_is_zeroed() {
        let segment = HeapSegment::new(1024, 16).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(segment.as_ptr(), segment.len()) };
        assert!(slice.iter().all(|&b| b == 0));
    }
}
