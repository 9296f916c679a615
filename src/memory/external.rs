//! Caller-supplied memory regions.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};

/// A region of memory the pool does not own.
///
/// Two flavours exist:
///
/// - **Host** regions (`MemoryType::External`): ordinary addressable memory
///   owned by the caller, for example a buffer pinned by a driver.
/// - **Device** regions (`MemoryType::Gpu`): an address range in an
///   accelerator's memory. The pool sub-allocates device addresses but
///   never dereferences them; handles report `None` for host pointers.
///
/// Dropping the segment does not free the memory.
pub struct ExternalSegment {
    base: usize,
    len: usize,
    memory_type: MemoryType,
}

impl ExternalSegment {
    /// Wrap caller-owned host memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for the whole
    /// lifetime of every pool built on this segment, and nothing else may
    /// access the region while the pool is alive.
    pub unsafe fn host(ptr: *mut u8, len: usize) -> Result<Self> {
        if ptr.is_null() {
            return Err(Error::InvalidConfig("external memory pointer is null".into()));
        }
        if len == 0 {
            return Err(Error::InvalidConfig("external memory length is 0".into()));
        }
        Ok(Self {
            base: ptr as usize,
            len,
            memory_type: MemoryType::External,
        })
    }

    /// Describe a device address range obtained from an accelerator runtime.
    pub fn device(base_address: usize, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidConfig("device memory length is 0".into()));
        }
        base_address
            .checked_add(len)
            .ok_or_else(|| Error::InvalidConfig("device range overflows address space".into()))?;
        Ok(Self {
            base: base_address,
            len,
            memory_type: MemoryType::Gpu,
        })
    }
}

impl MemorySegment for ExternalSegment {
    fn as_ptr(&self) -> *const u8 {
        self.base as *const u8
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        match self.memory_type {
            MemoryType::Gpu => None,
            _ => Some(self.base as *mut u8),
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn base_address(&self) -> usize {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_region() {
        let mut backing = vec![0u8; 256];
        let segment = unsafe { ExternalSegment::host(backing.as_mut_ptr(), backing.len()).unwrap() };
        assert_eq!(segment.len(), 256);
        assert_eq!(segment.memory_type(), MemoryType::External);
        assert_eq!(segment.as_mut_ptr(), Some(backing.as_mut_ptr()));
    }

    #[test]
    fn test_host_region_rejects_null() {
        let result = unsafe { ExternalSegment::host(std::ptr::null_mut(), 64) };
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_device_region_is_opaque() {
        let segment = ExternalSegment::device(0x7f00_0000_0000, 1 << 20).unwrap();
        assert_eq!(segment.memory_type(), MemoryType::Gpu);
        assert_eq!(segment.base_address(), 0x7f00_0000_0000);
        assert!(segment.as_mut_ptr().is_none());
    }

    #[test]
    fn test_device_region_overflow_rejected() {
        assert!(ExternalSegment::device(usize::MAX - 10, 64).is_err());
    }
}
