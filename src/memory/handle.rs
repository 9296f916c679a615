//! Leases on pool blocks.

use super::block::{BlockId, ReleaseCallback};
use super::pool::{Allocation, PoolShared};
use crate::error::{Error, Result};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// A reference-counted lease on one block of a [`MemoryPool`](super::MemoryPool).
///
/// Handles can only be obtained from a pool. Cloning a handle adds a
/// reference to the same block; dropping one removes it. The block returns
/// to the free list when the last reference goes away, at which point any
/// callback registered with [`on_release`](Self::on_release) runs.
///
/// The pool's bookkeeping outlives the pool object itself while handles
/// exist, so a handle may safely outlive the `MemoryPool` it came from.
pub struct MemoryHandle {
    pool: Arc<PoolShared>,
    block: BlockId,
    address: usize,
    size: usize,
    host_ptr: Option<NonNull<u8>>,
    released: bool,
}

// SAFETY: host_ptr points into a region owned by the pool state, which the
// Arc keeps alive. Writes go through `write`, which requires exclusive
// ownership of the block and holds the pool lock.
unsafe impl Send for MemoryHandle {}
unsafe impl Sync for MemoryHandle {}

impl MemoryHandle {
    pub(crate) fn new(pool: Arc<PoolShared>, allocation: Allocation) -> Self {
        Self {
            pool,
            block: allocation.block,
            address: allocation.address,
            size: allocation.size,
            host_ptr: allocation.host_ptr,
            released: false,
        }
    }

    /// Address of the first usable byte.
    ///
    /// For device pools this is a device address.
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Usable size in bytes (the request rounded to its alignment).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer to the block, if the pool's memory is host accessible.
    #[inline]
    pub fn as_ptr(&self) -> Option<*const u8> {
        self.host_ptr.map(|p| p.as_ptr() as *const u8)
    }

    /// Id of the pool that issued this handle.
    #[inline]
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    pub(crate) fn block(&self) -> BlockId {
        self.block
    }

    /// Current number of references to the block.
    pub fn ref_count(&self) -> u32 {
        self.pool
            .lock()
            .block(self.block)
            .map_or(0, |block| block.ref_count)
    }

    /// Register a callback to run once the block's last reference is released.
    ///
    /// Callbacks registered on any handle of the block run in registration
    /// order, after the pool lock has been dropped.
    pub fn on_release<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.pool.lock();
        let Some(block) = state.block_mut(self.block) else {
            return;
        };
        let chained: ReleaseCallback = match block.on_release.take() {
            Some(previous) => Box::new(move || {
                previous();
                callback();
            }),
            None => Box::new(callback),
        };
        block.on_release = Some(chained);
    }

    /// A non-owning reference to the same block.
    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            pool: Arc::downgrade(&self.pool),
            block: self.block,
            address: self.address,
            size: self.size,
            host_ptr: self.host_ptr,
        }
    }

    /// View the block's bytes.
    ///
    /// Returns `None` for device memory.
    pub fn as_slice(&self) -> Option<&[u8]> {
        // SAFETY: the block is allocated for as long as this handle lives,
        // and `write` refuses to run while another reference exists.
        self.host_ptr
            .map(|p| unsafe { std::slice::from_raw_parts(p.as_ptr() as *const u8, self.size) })
    }

    /// Copy `data` into the block at `offset`.
    ///
    /// Fails if another reference to the block exists, the range is out of
    /// bounds, or the memory is not host accessible.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let ptr = self
            .host_ptr
            .ok_or_else(|| Error::InvalidHandle("memory is not host accessible".into()))?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                Error::InvalidHandle(format!(
                    "write of {} bytes at offset {} exceeds block of {} bytes",
                    data.len(),
                    offset,
                    self.size
                ))
            })?;

        let state = self.pool.lock();
        let refs = state.block(self.block).map_or(0, |block| block.ref_count);
        if refs != 1 {
            return Err(Error::InvalidHandle(format!(
                "block is shared by {} references",
                refs
            )));
        }
        // SAFETY: bounds checked above; this is the only reference and the
        // pool lock prevents a concurrent upgrade.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset), end - offset);
        }
        drop(state);
        Ok(())
    }

    /// Release this reference and report whether the block was reclaimed.
    pub(crate) fn release(mut self) -> Result<bool> {
        self.released = true;
        self.pool.release(self.block)
    }
}

impl Clone for MemoryHandle {
    fn clone(&self) -> Self {
        {
            let mut state = self.pool.lock();
            match state.block_mut(self.block) {
                Some(block) => block.ref_count += 1,
                None => tracing::error!(pool = %self.pool.name, "cloning a handle whose block is gone"),
            }
        }
        Self {
            pool: Arc::clone(&self.pool),
            block: self.block,
            address: self.address,
            size: self.size,
            host_ptr: self.host_ptr,
            released: false,
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.release(self.block) {
            tracing::error!(pool = %self.pool.name, error = %e, "failed to release memory handle");
        }
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("pool", &self.pool.id)
            .field("block", &self.block)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

/// A non-owning reference to a pool block.
///
/// Does not keep the block allocated. [`upgrade`](Self::upgrade) succeeds
/// only while at least one [`MemoryHandle`] to the block is alive.
#[derive(Clone)]
pub struct WeakHandle {
    pool: Weak<PoolShared>,
    block: BlockId,
    address: usize,
    size: usize,
    host_ptr: Option<NonNull<u8>>,
}

// SAFETY: the pointer is only turned into a handle after the block is
// verified live under the pool lock.
unsafe impl Send for WeakHandle {}
unsafe impl Sync for WeakHandle {}

impl WeakHandle {
    /// Take a new reference to the block if it is still allocated.
    pub fn upgrade(&self) -> Option<MemoryHandle> {
        let pool = self.pool.upgrade()?;
        {
            let mut state = pool.lock();
            let block = state.block_mut(self.block)?;
            if block.free || block.ref_count == 0 {
                return None;
            }
            block.ref_count += 1;
        }
        Some(MemoryHandle {
            pool,
            block: self.block,
            address: self.address,
            size: self.size,
            host_ptr: self.host_ptr,
            released: false,
        })
    }

    /// Whether the block is still allocated.
    pub fn is_live(&self) -> bool {
        self.pool.upgrade().is_some_and(|pool| {
            pool.lock()
                .block(self.block)
                .is_some_and(|block| !block.free && block.ref_count > 0)
        })
    }

    /// Address the block had when the handle was created.
    pub fn address(&self) -> usize {
        self.address
    }

    pub(crate) fn block(&self) -> BlockId {
        self.block
    }
}

impl fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakHandle")
            .field("block", &self.block)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}
