//! Memory segment trait and types.

/// Type of memory backing a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MemoryType {
    /// Host heap memory owned by the pool.
    #[default]
    Cpu,
    /// Accelerator device memory.
    ///
    /// Device regions are opaque: the pool hands out device addresses but
    /// never reads or writes through them. Device memory is always supplied
    /// by the caller through an external segment.
    Gpu,
    /// Anonymous shared memory (memfd + mmap), shareable with other processes.
    Shared,
    /// Caller-owned host memory the pool only sub-allocates.
    External,
}

impl MemoryType {
    /// Can this memory type be shared across processes on the same machine?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Cpu => false,
            MemoryType::Gpu => false, // Must be exported by the device driver
            MemoryType::Shared => true,
            MemoryType::External => false,
        }
    }

    /// Can the pool read and write this memory directly?
    #[inline]
    pub fn is_cpu_accessible(&self) -> bool {
        !matches!(self, MemoryType::Gpu)
    }

    /// Can a pool of this type add regions on its own?
    ///
    /// Caller-supplied memory has a fixed extent.
    #[inline]
    pub fn supports_growth(&self) -> bool {
        matches!(self, MemoryType::Cpu | MemoryType::Shared)
    }

    /// Short lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Cpu => "cpu",
            MemoryType::Gpu => "gpu",
            MemoryType::Shared => "shared",
            MemoryType::External => "external",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for sharing memory across processes.
///
/// The fd should be sent via SCM_RIGHTS over a Unix socket; the receiver
/// maps it with [`SharedMemorySegment::from_fd`](super::SharedMemorySegment::from_fd).
#[derive(Debug, Clone)]
pub struct IpcHandle {
    /// The raw file descriptor.
    pub fd: std::os::unix::io::RawFd,
    /// Size of the memory region.
    pub size: usize,
}

/// Trait for memory segment backends.
///
/// A memory segment is one contiguous region a [`MemoryPool`](super::MemoryPool)
/// carves into blocks. A pool owns one segment per region; growable pools
/// add segments as they grow.
///
/// # Safety
///
/// Implementations must ensure that:
/// - The address range `[as_ptr(), as_ptr() + len())` stays valid and fixed
///   for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Start address of this segment.
    ///
    /// For device memory this is a device address and must not be dereferenced.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the segment is not host-accessible or is read-only.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Get an IPC handle for sharing this segment with other processes.
    ///
    /// Returns `None` if this segment type doesn't support cross-process sharing.
    fn ipc_handle(&self) -> Option<IpcHandle> {
        None
    }

    /// Start address as an integer, for offset arithmetic.
    fn base_address(&self) -> usize {
        self.as_ptr() as usize
    }
}

impl dyn MemorySegment {
    /// Check if this segment can be shared with other processes.
    pub fn is_shareable(&self) -> bool {
        self.ipc_handle().is_some()
    }

    /// Check if the host can read and write through this segment.
    pub fn is_host_accessible(&self) -> bool {
        self.as_mut_ptr().is_some()
    }
}
