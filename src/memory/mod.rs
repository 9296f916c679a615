//! Memory management for Cistern.
//!
//! A [`MemoryPool`] carves variable-size blocks out of one or more backing
//! regions. Model weights, per-instance scratch buffers and shared
//! workspaces all come from pools.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for backing regions (heap, memfd, caller-owned, device)
//! - [`MemoryPool`]: Block allocator with pluggable [`AllocationStrategy`]
//! - [`MemoryHandle`]: Reference-counted lease on one block; the block is
//!   reclaimed when the last handle drops
//! - [`WeakHandle`]: Non-owning reference that upgrades while the block lives
//!
//! # Example
//!
//! ```rust
//! use cistern::memory::{MemoryPool, MemoryPoolConfig};
//!
//! let pool = MemoryPool::new(MemoryPoolConfig::default().with_initial_size(1 << 16)).unwrap();
//!
//! let mut scratch = pool.allocate(4096, None, Some("scratch")).unwrap();
//! scratch.write(0, b"hello").unwrap();
//!
//! // Returned to the pool when dropped
//! drop(scratch);
//! assert_eq!(pool.stats().used_size, 0);
//! ```

mod block;
pub mod defaults;
mod external;
mod handle;
mod heap;
mod pool;
mod segment;
mod shared;
mod strategy;

pub use block::BlockId;
pub use external::ExternalSegment;
pub use handle::{MemoryHandle, WeakHandle};
pub use heap::HeapSegment;
pub use pool::{BlockInfo, CompactReport, MemoryPool, MemoryPoolConfig, MemoryStats};
pub use segment::{IpcHandle, MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
pub use strategy::AllocationStrategy;
