//! Variable-size block allocator over one or more memory regions.

use super::block::{BlockArena, BlockId, MemoryBlock, ReleaseCallback};
use super::defaults::{
    DEFAULT_ALIGNMENT, DEFAULT_GROW_SIZE, DEFAULT_INITIAL_SIZE, MIN_SPLIT_SIZE, REGION_ALIGNMENT,
    align_up,
};
use super::{
    AllocationStrategy, ExternalSegment, HeapSegment, MemoryHandle, MemorySegment, MemoryType,
    SharedMemorySegment,
};
use crate::error::{Error, Result};
use crate::observability::{record_allocation, record_free, record_memory_usage, trace_allocation, trace_free};
use std::fmt::{self, Write as _};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Global counter for unique pool ids.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a [`MemoryPool`].
///
/// # Example
///
/// ```rust
/// use cistern::memory::{AllocationStrategy, MemoryPoolConfig};
///
/// let config = MemoryPoolConfig::default()
///     .with_initial_size(1 << 20)
///     .with_max_size(4 << 20)
///     .with_strategy(AllocationStrategy::FirstFit);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct MemoryPoolConfig {
    /// Kind of backing memory.
    pub memory_type: MemoryType,
    /// Size of the first region in bytes.
    pub initial_size: usize,
    /// Upper bound on the total size. `None` disables growth.
    pub max_size: Option<usize>,
    /// Minimum size of each region added by growth.
    pub grow_size: usize,
    /// Alignment used when a request does not specify one.
    pub alignment: usize,
    /// Free-block selection policy.
    pub strategy: AllocationStrategy,
    /// Keep allocation tags for block dumps.
    pub track_allocations: bool,
    /// Verify block bookkeeping after every allocate and free.
    pub debug_checks: bool,
    /// Log every allocate and free at debug level.
    pub allocation_events: bool,
    /// Name used in logs and metric labels. Defaults to `<type>-<id>`.
    pub name: Option<String>,
    /// Caller-supplied backing memory (External and Gpu pools).
    pub external: Option<Arc<ExternalSegment>>,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            memory_type: MemoryType::Cpu,
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: None,
            grow_size: DEFAULT_GROW_SIZE,
            alignment: DEFAULT_ALIGNMENT,
            strategy: AllocationStrategy::BestFit,
            track_allocations: false,
            debug_checks: false,
            allocation_events: false,
            name: None,
            external: None,
        }
    }
}

impl MemoryPoolConfig {
    /// Default configuration for a memory type.
    pub fn new(memory_type: MemoryType) -> Self {
        Self {
            memory_type,
            ..Self::default()
        }
    }

    /// Configuration for a pool over caller-supplied memory.
    ///
    /// The pool type, initial size and maximum size are taken from the
    /// segment. Every pool built from this configuration carves the same
    /// memory, so build exactly one.
    pub fn from_external(segment: ExternalSegment) -> Self {
        let len = segment.len();
        Self {
            memory_type: segment.memory_type(),
            initial_size: len,
            max_size: None,
            external: Some(Arc::new(segment)),
            ..Self::default()
        }
    }

    /// Set the initial region size.
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self
    }

    /// Allow growth up to `size` bytes in total.
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    /// Set the growth increment.
    pub fn with_grow_size(mut self, size: usize) -> Self {
        self.grow_size = size;
        self
    }

    /// Set the default alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the allocation strategy.
    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Keep allocation tags.
    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.track_allocations = enabled;
        self
    }

    /// Check integrity after every operation.
    pub fn with_debug_checks(mut self, enabled: bool) -> Self {
        self.debug_checks = enabled;
        self
    }

    /// Log allocation events.
    pub fn with_allocation_events(mut self, enabled: bool) -> Self {
        self.allocation_events = enabled;
        self
    }

    /// Set the pool name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Largest total size the pool may reach.
    pub fn effective_max_size(&self) -> usize {
        self.max_size.unwrap_or(self.initial_size).max(self.initial_size)
    }

    /// Whether the pool may add regions on exhaustion.
    pub fn growable(&self) -> bool {
        self.external.is_none()
            && self.memory_type.supports_growth()
            && self.effective_max_size() > self.initial_size
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(self.alignment));
        }
        if self.initial_size == 0 {
            return Err(Error::InvalidConfig("initial_size must be greater than 0".into()));
        }
        if let Some(max) = self.max_size.filter(|&max| max < self.initial_size) {
            return Err(Error::InvalidConfig(format!(
                "max_size {} is below initial_size {}",
                max, self.initial_size
            )));
        }
        if self.growable() && self.grow_size == 0 {
            return Err(Error::InvalidConfig("grow_size must be greater than 0".into()));
        }

        match (self.memory_type, &self.external) {
            (MemoryType::Gpu | MemoryType::External, None) => Err(Error::InvalidConfig(format!(
                "{} pools need caller-supplied memory",
                self.memory_type
            ))),
            (MemoryType::Cpu | MemoryType::Shared, Some(_)) => Err(Error::InvalidConfig(format!(
                "{} pools allocate their own memory",
                self.memory_type
            ))),
            (ty, Some(segment)) if segment.memory_type() != ty => Err(Error::InvalidConfig(format!(
                "pool type {} does not match {} segment",
                ty,
                segment.memory_type()
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for MemoryPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPoolConfig")
            .field("memory_type", &self.memory_type)
            .field("initial_size", &self.initial_size)
            .field("max_size", &self.max_size)
            .field("grow_size", &self.grow_size)
            .field("alignment", &self.alignment)
            .field("strategy", &self.strategy)
            .field("track_allocations", &self.track_allocations)
            .field("debug_checks", &self.debug_checks)
            .field("allocation_events", &self.allocation_events)
            .field("name", &self.name)
            .field("external", &self.external.is_some())
            .finish()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Usage statistics of a memory pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    /// Bytes across all regions.
    pub total_size: usize,
    /// Bytes in allocated blocks, including absorbed padding.
    pub used_size: usize,
    /// Bytes in free blocks.
    pub free_size: usize,
    /// High-water mark of `used_size`.
    pub peak_usage: usize,
    /// Successful allocations since creation.
    pub allocation_count: u64,
    /// Blocks returned to the free list since creation.
    pub free_count: u64,
    /// Allocated blocks.
    pub active_blocks: usize,
    /// Free blocks.
    pub free_blocks: usize,
    /// Size of the largest free block.
    pub largest_free_block: usize,
    /// Live regions (1 unless the pool grew).
    pub region_count: usize,
    /// `free_size / total_size`.
    pub fragmentation_ratio: f64,
}

/// One entry of a block dump.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    /// Region index.
    pub region: usize,
    /// Offset of the block within its region.
    pub offset: usize,
    /// Address of the first usable byte.
    pub address: usize,
    /// Block size including absorbed padding.
    pub size: usize,
    /// Alignment the block was allocated with (1 for free blocks).
    pub alignment: usize,
    /// Whether the block is on the free list.
    pub free: bool,
    /// Live references.
    pub ref_count: u32,
    /// Tag given at allocation (tracking pools only).
    pub tag: Option<String>,
    /// Time since the block was created.
    pub age: Duration,
}

/// Result of [`MemoryPool::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// Adjacent free pairs merged.
    pub merged_blocks: usize,
    /// Grown regions handed back.
    pub released_regions: usize,
    /// Bytes handed back.
    pub released_bytes: usize,
}

// =============================================================================
// Shared state
// =============================================================================

/// A block carved for a request.
pub(crate) struct Allocation {
    pub block: BlockId,
    pub address: usize,
    pub size: usize,
    pub host_ptr: Option<NonNull<u8>>,
}

/// Outcome of dropping one reference.
struct Released {
    reclaimed: bool,
    callback: Option<ReleaseCallback>,
    address: usize,
    size: usize,
    merged: usize,
}

struct Region {
    segment: Arc<dyn MemorySegment>,
    grown: bool,
}

/// Block bookkeeping guarded by the pool lock.
pub(crate) struct PoolState {
    regions: Vec<Option<Region>>,
    blocks: BlockArena,
    total: usize,
    used: usize,
    peak: usize,
    allocation_count: u64,
    free_count: u64,
}

/// State shared by a pool and all of its handles.
pub(crate) struct PoolShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    config: MemoryPoolConfig,
    state: Mutex<PoolState>,
}

impl PoolShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one reference to `block`; returns whether it was reclaimed.
    pub(crate) fn release(&self, block: BlockId) -> Result<bool> {
        let mut state = self.lock();
        let released = state.release(block)?;
        if released.reclaimed && self.config.debug_checks {
            state.check_integrity()?;
        }
        let used = state.used;
        let fragmentation = state.fragmentation();
        drop(state);

        if released.reclaimed {
            record_free(&self.name);
            record_memory_usage(&self.name, used, fragmentation);
            if self.config.allocation_events {
                trace_free(&self.name, released.address, released.size, released.merged);
            }
        }
        if let Some(callback) = released.callback {
            callback();
        }
        Ok(released.reclaimed)
    }
}

impl PoolState {
    fn new(segment: Arc<dyn MemorySegment>) -> Self {
        let len = segment.len();
        let mut blocks = BlockArena::new();
        blocks.insert(MemoryBlock::new_free(0, 0, len));
        Self {
            regions: vec![Some(Region {
                segment,
                grown: false,
            })],
            blocks,
            total: len,
            used: 0,
            peak: 0,
            allocation_count: 0,
            free_count: 0,
        }
    }

    pub(crate) fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.blocks.get(id)
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.blocks.get_mut(id)
    }

    fn segment(&self, region: usize) -> Result<&Arc<dyn MemorySegment>> {
        self.regions
            .get(region)
            .and_then(|r| r.as_ref())
            .map(|r| &r.segment)
            .ok_or_else(|| Error::IntegrityViolation(format!("block refers to missing region {}", region)))
    }

    fn fragmentation(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.total - self.used) as f64 / self.total as f64
        }
    }

    fn largest_free(&self) -> usize {
        self.blocks
            .free_blocks()
            .map(|(_, b)| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Bytes of padding needed before a block to reach `alignment`.
    fn padding_for(&self, block: &MemoryBlock, alignment: usize) -> Option<usize> {
        let start = self.segment(block.region).ok()?.base_address() + block.offset;
        align_up(start, alignment).map(|aligned| aligned - start)
    }

    fn allocate(
        &mut self,
        need: usize,
        alignment: usize,
        strategy: AllocationStrategy,
        tag: Option<String>,
    ) -> Result<Allocation> {
        let candidates: Vec<_> = self
            .blocks
            .free_blocks()
            .filter(|(_, block)| {
                self.padding_for(block, alignment)
                    .and_then(|padding| padding.checked_add(need))
                    .is_some_and(|required| block.size >= required)
            })
            .map(|(id, block)| super::strategy::Candidate {
                id,
                size: block.size,
            })
            .collect();

        let Some(chosen) = strategy.select(candidates) else {
            return Err(Error::PoolExhausted {
                requested: need,
                largest_free: self.largest_free(),
            });
        };
        self.carve(chosen.id, need, alignment, strategy.splits_in_halves(), tag)
    }

    /// Split `id` so that an allocated block of `need` usable bytes at
    /// `alignment` starts inside it.
    fn carve(
        &mut self,
        id: BlockId,
        need: usize,
        alignment: usize,
        halve: bool,
        tag: Option<String>,
    ) -> Result<Allocation> {
        let padding = self
            .blocks
            .get(id)
            .and_then(|block| self.padding_for(block, alignment))
            .ok_or_else(|| Error::IntegrityViolation("selected block is not live".into()))?;
        let free = self
            .blocks
            .remove(id)
            .ok_or_else(|| Error::IntegrityViolation("selected block is not live".into()))?;
        let region = free.region;

        let mut offset = free.offset;
        let mut avail = free.size;
        let mut absorbed = padding;

        // Leading padding large enough to stand alone goes back on the free list.
        if padding >= MIN_SPLIT_SIZE {
            self.blocks.insert(MemoryBlock::new_free(region, offset, padding));
            offset += padding;
            avail -= padding;
            absorbed = 0;
        }

        if halve && absorbed == 0 {
            while avail / 2 >= need {
                let half = avail / 2;
                self.blocks
                    .insert(MemoryBlock::new_free(region, offset + half, avail - half));
                avail = half;
            }
        }

        let take = absorbed + need;
        let remainder = avail - take;
        let size = if remainder >= MIN_SPLIT_SIZE {
            self.blocks
                .insert(MemoryBlock::new_free(region, offset + take, remainder));
            take
        } else {
            avail
        };

        let segment = Arc::clone(self.segment(region)?);
        let block = self.blocks.insert(MemoryBlock {
            region,
            offset,
            size,
            padding: absorbed,
            alignment,
            free: false,
            created: std::time::Instant::now(),
            ref_count: 1,
            tag,
            on_release: None,
        });

        self.used += size;
        self.peak = self.peak.max(self.used);
        self.allocation_count += 1;

        let start = offset + absorbed;
        let host_ptr = segment
            .as_mut_ptr()
            // SAFETY: start + need lies within the segment.
            .and_then(|base| NonNull::new(unsafe { base.add(start) }));

        Ok(Allocation {
            block,
            address: segment.base_address() + start,
            size: need,
            host_ptr,
        })
    }

    fn release(&mut self, id: BlockId) -> Result<Released> {
        let block = self.blocks.get_mut(id).ok_or_else(|| {
            Error::InvalidHandle(format!(
                "block {}:{} is no longer allocated",
                id.index(),
                id.generation()
            ))
        })?;
        if block.free || block.ref_count == 0 {
            return Err(Error::InvalidHandle(format!(
                "double free of block {}:{}",
                id.index(),
                id.generation()
            )));
        }

        block.ref_count -= 1;
        if block.ref_count > 0 {
            return Ok(Released {
                reclaimed: false,
                callback: None,
                address: 0,
                size: block.size,
                merged: 0,
            });
        }

        let mut block = self
            .blocks
            .remove(id)
            .ok_or_else(|| Error::IntegrityViolation("released block vanished".into()))?;
        let callback = block.on_release.take();
        let address = self.segment(block.region)?.base_address() + block.offset + block.padding;

        self.used -= block.size;
        self.free_count += 1;

        let freed = self
            .blocks
            .insert(MemoryBlock::new_free(block.region, block.offset, block.size));
        let merged = self.coalesce(freed);

        Ok(Released {
            reclaimed: true,
            callback,
            address,
            size: block.size,
            merged,
        })
    }

    /// Merge `id` with address-contiguous free neighbours until none remain.
    fn coalesce(&mut self, mut id: BlockId) -> usize {
        let mut merged = 0;
        loop {
            let Some(block) = self.blocks.get(id) else {
                return merged;
            };
            let key = block.key();
            let end = block.end();

            let prev = self
                .blocks
                .prev_in_region(key)
                .filter(|p| self.blocks.get(*p).is_some_and(|b| b.free && b.end() == key.1));
            if let Some(prev) = prev {
                if let Some(low) = self.absorb(prev, id) {
                    id = low;
                    merged += 1;
                    continue;
                }
            }

            let next = self
                .blocks
                .next_in_region(key)
                .filter(|n| self.blocks.get(*n).is_some_and(|b| b.free && b.offset == end));
            if let Some(next) = next {
                if self.absorb(id, next).is_some() {
                    merged += 1;
                    continue;
                }
            }
            return merged;
        }
    }

    /// Fold free block `high` into the free block `low` directly before it.
    fn absorb(&mut self, low: BlockId, high: BlockId) -> Option<BlockId> {
        self.blocks.get(low)?;
        let high = self.blocks.remove(high)?;
        let low_block = self.blocks.get_mut(low)?;
        low_block.size += high.size;
        Some(low)
    }

    /// Add a grown region, reusing a slot left by a released one.
    fn add_region(&mut self, segment: Arc<dyn MemorySegment>) -> usize {
        let len = segment.len();
        let region = Some(Region {
            segment,
            grown: true,
        });
        let index = match self.regions.iter().position(Option::is_none) {
            Some(vacant) => {
                self.regions[vacant] = region;
                vacant
            }
            None => {
                self.regions.push(region);
                self.regions.len() - 1
            }
        };
        self.blocks.insert(MemoryBlock::new_free(index, 0, len));
        self.total += len;
        len
    }

    fn compact(&mut self) -> CompactReport {
        let mut report = CompactReport::default();

        let free: Vec<BlockId> = self.blocks.free_blocks().map(|(id, _)| id).collect();
        for id in free {
            if self.blocks.get(id).is_some() {
                report.merged_blocks += self.coalesce(id);
            }
        }

        for index in 0..self.regions.len() {
            let Some(region) = self.regions[index].as_ref() else {
                continue;
            };
            if !region.grown {
                continue;
            }
            let len = region.segment.len();
            let sole_free = {
                let mut blocks = self.blocks.region_blocks(index);
                match (blocks.next(), blocks.next()) {
                    (Some((id, block)), None) if block.free && block.size == len => Some(id),
                    _ => None,
                }
            };
            if let Some(id) = sole_free {
                self.blocks.remove(id);
                self.regions[index] = None;
                self.total -= len;
                report.released_regions += 1;
                report.released_bytes += len;
            }
        }
        report
    }

    fn check_integrity(&self) -> Result<()> {
        let mut used = 0usize;
        let mut free = 0usize;
        let mut total = 0usize;

        for (index, region) in self.regions.iter().enumerate() {
            let Some(region) = region else {
                if self.blocks.region_blocks(index).next().is_some() {
                    return Err(Error::IntegrityViolation(format!(
                        "released region {} still has blocks",
                        index
                    )));
                }
                continue;
            };
            let len = region.segment.len();
            total += len;

            let mut cursor = 0usize;
            for (_, block) in self.blocks.region_blocks(index) {
                if block.offset != cursor {
                    return Err(Error::IntegrityViolation(format!(
                        "region {}: expected block at offset {}, found {}",
                        index, cursor, block.offset
                    )));
                }
                if block.size == 0 {
                    return Err(Error::IntegrityViolation(format!(
                        "region {}: empty block at offset {}",
                        index, block.offset
                    )));
                }
                if block.free != self.blocks.is_indexed_free(block.key()) {
                    return Err(Error::IntegrityViolation(format!(
                        "region {}: free index disagrees with block at offset {}",
                        index, block.offset
                    )));
                }
                if block.free != (block.ref_count == 0) {
                    return Err(Error::IntegrityViolation(format!(
                        "region {}: block at offset {} has {} references but free={}",
                        index, block.offset, block.ref_count, block.free
                    )));
                }
                if block.free {
                    free += block.size;
                } else {
                    used += block.size;
                }
                cursor = block.end();
            }
            if cursor != len {
                return Err(Error::IntegrityViolation(format!(
                    "region {}: blocks cover {} of {} bytes",
                    index, cursor, len
                )));
            }
        }

        if self.blocks.iter().any(|(_, b)| b.region >= self.regions.len()) {
            return Err(Error::IntegrityViolation("block outside any region".into()));
        }
        if total != self.total || used != self.used || used + free != total {
            return Err(Error::IntegrityViolation(format!(
                "accounting mismatch: total {} (tracked {}), used {} (tracked {}), free {}",
                total, self.total, used, self.used, free
            )));
        }
        Ok(())
    }

    fn stats(&self) -> MemoryStats {
        let free_blocks = self.blocks.free_len();
        MemoryStats {
            total_size: self.total,
            used_size: self.used,
            free_size: self.total - self.used,
            peak_usage: self.peak,
            allocation_count: self.allocation_count,
            free_count: self.free_count,
            active_blocks: self.blocks.len() - free_blocks,
            free_blocks,
            largest_free_block: self.largest_free(),
            region_count: self.regions.iter().flatten().count(),
            fragmentation_ratio: self.fragmentation(),
        }
    }

    fn dump(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .map(|(_, block)| BlockInfo {
                region: block.region,
                offset: block.offset,
                address: self
                    .segment(block.region)
                    .map_or(0, |s| s.base_address() + block.offset + block.padding),
                size: block.size,
                alignment: block.alignment,
                free: block.free,
                ref_count: block.ref_count,
                tag: block.tag.clone(),
                age: block.created.elapsed(),
            })
            .collect()
    }
}

// =============================================================================
// MemoryPool
// =============================================================================

/// A block allocator over CPU, shared, device or caller-supplied memory.
///
/// The pool starts with one free block spanning its region. Allocations
/// carve blocks out of free ones according to the configured
/// [`AllocationStrategy`]; freed blocks merge back with free neighbours.
/// All bookkeeping sits behind one lock.
///
/// `MemoryPool` is a cheap handle: clones refer to the same pool.
///
/// # Example
///
/// ```rust
/// use cistern::memory::{MemoryPool, MemoryPoolConfig};
///
/// let pool = MemoryPool::new(MemoryPoolConfig::default().with_initial_size(4096)).unwrap();
///
/// let a = pool.allocate(100, None, Some("scratch")).unwrap();
/// let b = a.clone(); // second reference to the same block
///
/// assert!(!pool.free(a).unwrap()); // still referenced
/// assert!(pool.free(b).unwrap()); // reclaimed
///
/// let stats = pool.stats();
/// assert_eq!(stats.used_size, 0);
/// assert_eq!(stats.free_blocks, 1);
/// ```
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create a pool and its initial region.
    pub fn new(config: MemoryPoolConfig) -> Result<Self> {
        config.validate()?;
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.memory_type, id));

        let segment: Arc<dyn MemorySegment> = match &config.external {
            Some(external) => Arc::clone(external) as Arc<dyn MemorySegment>,
            None => create_segment(config.memory_type, &name, config.initial_size)?,
        };

        tracing::info!(
            pool = %name,
            memory_type = %config.memory_type,
            size = segment.len(),
            max_size = config.effective_max_size(),
            strategy = %config.strategy,
            "memory pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                name,
                state: Mutex::new(PoolState::new(segment)),
                config,
            }),
        })
    }

    /// Unique id of this pool.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Kind of backing memory.
    pub fn memory_type(&self) -> MemoryType {
        self.shared.config.memory_type
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &MemoryPoolConfig {
        &self.shared.config
    }

    /// Allocate `size` bytes.
    ///
    /// `size` is rounded up to `alignment` (or the pool default). Growable
    /// pools add a region and retry once when no free block fits.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when no block fits; the pool is unchanged.
    pub fn allocate(&self, size: usize, alignment: Option<usize>, tag: Option<&str>) -> Result<MemoryHandle> {
        let config = &self.shared.config;
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }
        let alignment = alignment.unwrap_or(config.alignment);
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }
        let need = config
            .strategy
            .round_request(size, alignment)
            .ok_or(Error::PoolExhausted {
                requested: size,
                largest_free: 0,
            })?;
        let tag = tag.filter(|_| config.track_allocations).map(str::to_owned);

        let mut state = self.shared.lock();
        let allocation = match state.allocate(need, alignment, config.strategy, tag.clone()) {
            Ok(allocation) => allocation,
            Err(exhausted @ Error::PoolExhausted { .. }) => {
                if !config.growable() {
                    return Err(exhausted);
                }
                let remaining = config.effective_max_size().saturating_sub(state.total);
                let required = need.saturating_add(alignment);
                if remaining < required {
                    return Err(exhausted);
                }
                let amount = config.grow_size.max(required).min(remaining);
                self.grow_locked(&mut state, amount)?;
                state.allocate(need, alignment, config.strategy, tag)?
            }
            Err(e) => return Err(e),
        };
        if config.debug_checks {
            state.check_integrity()?;
        }
        let used = state.used;
        let fragmentation = state.fragmentation();
        drop(state);

        record_allocation(&self.shared.name, need);
        record_memory_usage(&self.shared.name, used, fragmentation);
        if config.allocation_events {
            trace_allocation(&self.shared.name, allocation.address, need, alignment);
        }

        Ok(MemoryHandle::new(Arc::clone(&self.shared), allocation))
    }

    /// Drop `handle`'s reference and report whether its block was reclaimed.
    ///
    /// Equivalent to dropping the handle, but surfaces errors.
    ///
    /// # Errors
    ///
    /// [`Error::ForeignHandle`] if the handle came from another pool. The
    /// handle is still released, into the pool that issued it.
    pub fn free(&self, handle: MemoryHandle) -> Result<bool> {
        if handle.pool_id() != self.shared.id {
            return Err(Error::ForeignHandle {
                handle_pool: handle.pool_id(),
                pool: self.shared.id,
            });
        }
        handle.release()
    }

    /// Move `handle` to a block of `new_size` bytes, copying the contents.
    ///
    /// On failure the handle still refers to its original block.
    pub fn realloc(&self, handle: &mut MemoryHandle, new_size: usize) -> Result<()> {
        if handle.pool_id() != self.shared.id {
            return Err(Error::ForeignHandle {
                handle_pool: handle.pool_id(),
                pool: self.shared.id,
            });
        }
        let (alignment, tag) = {
            let state = self.shared.lock();
            let block = state
                .block(handle.block())
                .ok_or_else(|| Error::InvalidHandle("block is no longer allocated".into()))?;
            (block.alignment, block.tag.clone())
        };

        let replacement = self.allocate(new_size, Some(alignment), tag.as_deref())?;
        let copy = handle.size().min(replacement.size());
        if let (Some(src), Some(dst)) = (handle.as_ptr(), replacement.as_ptr()) {
            let _state = self.shared.lock();
            // SAFETY: both blocks are allocated and disjoint; the lock keeps
            // writers through `MemoryHandle::write` out.
            unsafe { std::ptr::copy_nonoverlapping(src, dst as *mut u8, copy) };
        }

        let old = std::mem::replace(handle, replacement);
        drop(old);
        Ok(())
    }

    /// Add a region of at least `bytes` bytes.
    ///
    /// Returns the size of the new region.
    pub fn grow(&self, bytes: usize) -> Result<usize> {
        let mut state = self.shared.lock();
        self.grow_locked(&mut state, bytes)
    }

    fn grow_locked(&self, state: &mut PoolState, bytes: usize) -> Result<usize> {
        let config = &self.shared.config;
        if config.external.is_some() || !config.memory_type.supports_growth() {
            return Err(Error::AllocationFailed(format!(
                "{} pool cannot grow",
                config.memory_type
            )));
        }
        let max = config.effective_max_size();
        if bytes == 0 || state.total.saturating_add(bytes) > max {
            return Err(Error::PoolExhausted {
                requested: bytes,
                largest_free: state.largest_free(),
            });
        }

        let segment = create_segment(config.memory_type, &self.shared.name, bytes)?;
        if state.total + segment.len() > max {
            return Err(Error::PoolExhausted {
                requested: segment.len(),
                largest_free: state.largest_free(),
            });
        }
        let added = state.add_region(segment);
        tracing::info!(
            pool = %self.shared.name,
            added,
            total = state.total,
            "memory pool grown"
        );
        Ok(added)
    }

    /// Merge adjacent free blocks and hand back grown regions that are
    /// entirely free.
    pub fn compact(&self) -> CompactReport {
        let report = self.shared.lock().compact();
        if report.released_regions > 0 || report.merged_blocks > 0 {
            tracing::info!(
                pool = %self.shared.name,
                merged = report.merged_blocks,
                released_bytes = report.released_bytes,
                "memory pool compacted"
            );
        }
        report
    }

    /// Usage statistics.
    pub fn stats(&self) -> MemoryStats {
        self.shared.lock().stats()
    }

    /// Verify that the blocks partition every region with no gaps or
    /// overlaps and that the counters agree with the blocks.
    pub fn check_integrity(&self) -> Result<()> {
        let result = self.shared.lock().check_integrity();
        if let Err(e) = &result {
            tracing::warn!(pool = %self.shared.name, error = %e, "memory pool integrity check failed");
        }
        result
    }

    /// Every block in address order.
    pub fn dump_blocks(&self) -> Vec<BlockInfo> {
        self.shared.lock().dump()
    }

    /// Human-readable block listing.
    pub fn dump(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pool {} ({}): {} / {} bytes used, {} active, {} free, fragmentation {:.3}",
            self.shared.name,
            self.shared.config.memory_type,
            stats.used_size,
            stats.total_size,
            stats.active_blocks,
            stats.free_blocks,
            stats.fragmentation_ratio
        );
        for block in self.dump_blocks() {
            let _ = writeln!(
                out,
                "  [{}] +{:<10} {:#014x} {:>10} {} refs={} {}",
                block.region,
                block.offset,
                block.address,
                block.size,
                if block.free { "free" } else { "used" },
                block.ref_count,
                block.tag.as_deref().unwrap_or("")
            );
        }
        out
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("memory_type", &self.shared.config.memory_type)
            .finish()
    }
}

fn create_segment(memory_type: MemoryType, name: &str, size: usize) -> Result<Arc<dyn MemorySegment>> {
    match memory_type {
        MemoryType::Cpu => Ok(Arc::new(HeapSegment::new(size, REGION_ALIGNMENT)?)),
        MemoryType::Shared => Ok(Arc::new(SharedMemorySegment::new(name, size)?)),
        MemoryType::Gpu | MemoryType::External => Err(Error::InvalidConfig(format!(
            "{} memory must be supplied by the caller",
            memory_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_pool(size: usize) -> MemoryPool {
        MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(size)
                .with_debug_checks(true),
        )
        .unwrap()
    }

    #[test]
    fn test_new_pool_is_one_free_block() {
        let pool = cpu_pool(4096);
        let stats = pool.stats();
        assert_eq!(stats.total_size, 4096);
        assert_eq!(stats.free_size, 4096);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.region_count, 1);
        assert_eq!(stats.fragmentation_ratio, 1.0);
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_allocate_rounds_to_alignment() {
        let pool = cpu_pool(4096);
        let handle = pool.allocate(100, None, None).unwrap();
        assert_eq!(handle.size(), 112);
        assert_eq!(handle.address() % 16, 0);

        let stats = pool.stats();
        assert_eq!(stats.used_size, 112);
        assert_eq!(stats.used_size + stats.free_size, stats.total_size);
    }

    #[test]
    fn test_large_alignment_splits_leading_padding() {
        let pool = cpu_pool(8192);
        let _small = pool.allocate(16, None, None).unwrap();
        let aligned = pool.allocate(64, Some(1024), None).unwrap();
        assert_eq!(aligned.address() % 1024, 0);

        // Padding in front of the aligned block is a free block of its own.
        let blocks = pool.dump_blocks();
        assert!(blocks[1].free);
        assert_eq!(blocks[2].address, aligned.address());
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_zero_size_and_bad_alignment_rejected() {
        let pool = cpu_pool(4096);
        assert!(matches!(
            pool.allocate(0, None, None),
            Err(Error::AllocationFailed(_))
        ));
        assert!(matches!(
            pool.allocate(16, Some(3), None),
            Err(Error::InvalidAlignment(3))
        ));
    }

    #[test]
    fn test_exhaustion_leaves_pool_unchanged() {
        let pool = cpu_pool(1024);
        let _a = pool.allocate(512, None, None).unwrap();
        let before = pool.stats();

        let err = pool.allocate(1024, None, None).unwrap_err();
        assert!(matches!(
            err,
            Error::PoolExhausted {
                requested: 1024,
                largest_free: 512
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_small_remainder_absorbed() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(64)
                .with_alignment(4),
        )
        .unwrap();
        // 60 bytes leaves 4, below the split threshold.
        let handle = pool.allocate(60, None, None).unwrap();
        assert_eq!(handle.size(), 60);
        let stats = pool.stats();
        assert_eq!(stats.used_size, 64);
        assert_eq!(stats.free_blocks, 0);
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let pool = cpu_pool(4096);
        let a = pool.allocate(256, None, None).unwrap();
        let b = pool.allocate(256, None, None).unwrap();
        let c = pool.allocate(256, None, None).unwrap();

        pool.free(a).unwrap();
        pool.free(c).unwrap();
        assert_eq!(pool.stats().free_blocks, 2);

        pool.free(b).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, 4096);
        assert_eq!(stats.free_count, 3);
    }

    #[test]
    fn test_double_release_detected() {
        let pool = cpu_pool(4096);
        let handle = pool.allocate(64, None, None).unwrap();
        let block = handle.block();
        assert!(pool.free(handle).unwrap());

        let err = pool.shared.release(block).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let first = cpu_pool(4096);
        let second = cpu_pool(4096);
        let handle = first.allocate(64, None, None).unwrap();

        let err = second.free(handle).unwrap_err();
        assert!(matches!(err, Error::ForeignHandle { .. }));
        assert_eq!(second.stats().allocation_count, 0);
        // The handle went back to the pool that issued it.
        assert_eq!(first.stats().used_size, 0);
    }

    #[test]
    fn test_realloc_copies_contents() {
        let pool = cpu_pool(4096);
        let mut handle = pool.allocate(16, None, None).unwrap();
        handle.write(0, b"0123456789abcdef").unwrap();
        let old_address = handle.address();

        let _blocker = pool.allocate(16, None, None).unwrap();
        pool.realloc(&mut handle, 64).unwrap();

        assert_ne!(handle.address(), old_address);
        assert_eq!(handle.size(), 64);
        assert_eq!(&handle.as_slice().unwrap()[..16], b"0123456789abcdef");
        assert_eq!(pool.stats().active_blocks, 2);
    }

    #[test]
    fn test_realloc_failure_keeps_handle() {
        let pool = cpu_pool(1024);
        let mut handle = pool.allocate(64, None, None).unwrap();
        let address = handle.address();

        assert!(pool.realloc(&mut handle, 4096).is_err());
        assert_eq!(handle.address(), address);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_growth_on_exhaustion() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_max_size(8192)
                .with_grow_size(2048)
                .with_debug_checks(true),
        )
        .unwrap();

        let _a = pool.allocate(1024, None, None).unwrap();
        let b = pool.allocate(512, None, None).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.region_count, 2);
        assert_eq!(stats.total_size, 1024 + 2048);

        drop(b);
        let report = pool.compact();
        assert_eq!(report.released_regions, 1);
        assert_eq!(report.released_bytes, 2048);
        assert_eq!(pool.stats().total_size, 1024);
        pool.check_integrity().unwrap();
    }

    fn growable_pool() -> MemoryPool {
        MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_max_size(8192)
                .with_grow_size(2048)
                .with_debug_checks(true),
        )
        .unwrap()
    }

    #[test]
    fn test_compact_keeps_partly_used_region() {
        let pool = growable_pool();
        let _a = pool.allocate(1024, None, None).unwrap();
        let b = pool.allocate(512, None, None).unwrap();
        let c = pool.allocate(512, None, None).unwrap();
        assert_eq!(pool.stats().region_count, 2);

        drop(b);
        let report = pool.compact();
        assert_eq!(report.released_regions, 0);
        assert_eq!(report.released_bytes, 0);
        let stats = pool.stats();
        assert_eq!(stats.region_count, 2);
        assert_eq!(stats.total_size, 1024 + 2048);
        assert_eq!(c.size(), 512);

        drop(c);
        assert_eq!(pool.compact().released_regions, 1);
        assert_eq!(pool.stats().total_size, 1024);
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_regrowth_reuses_released_region_slot() {
        let pool = growable_pool();
        let _a = pool.allocate(1024, None, None).unwrap();

        for _ in 0..10 {
            let b = pool.allocate(512, None, None).unwrap();
            assert!(pool.dump_blocks().iter().all(|block| block.region <= 1));
            drop(b);
            assert_eq!(pool.compact().released_regions, 1);
        }
        assert_eq!(pool.shared.lock().regions.len(), 2);
        assert_eq!(pool.stats().region_count, 1);
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_compact_merges_buddy_remainders() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_strategy(AllocationStrategy::Buddy)
                .with_debug_checks(true),
        )
        .unwrap();

        let handle = pool.allocate(100, None, None).unwrap();
        assert_eq!(pool.stats().free_blocks, 3);

        let report = pool.compact();
        assert_eq!(report.merged_blocks, 2);
        assert_eq!(report.released_regions, 0);
        let sizes: Vec<(usize, bool)> = pool.dump_blocks().iter().map(|b| (b.size, b.free)).collect();
        assert_eq!(sizes, vec![(128, false), (896, true)]);

        // Already coalesced.
        assert_eq!(pool.compact().merged_blocks, 0);
        drop(handle);
        assert_eq!(pool.stats().free_blocks, 1);
        pool.check_integrity().unwrap();
    }

    #[test]
    fn test_allocation_events_opt_in() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tracing::subscriber::with_default;
        use tracing::{Event, Metadata, Subscriber, span};

        struct CountEvents(Arc<AtomicUsize>);

        impl Subscriber for CountEvents {
            fn enabled(&self, _: &Metadata<'_>) -> bool {
                true
            }
            fn new_span(&self, _: &span::Attributes<'_>) -> span::Id {
                span::Id::from_u64(1)
            }
            fn record(&self, _: &span::Id, _: &span::Record<'_>) {}
            fn record_follows_from(&self, _: &span::Id, _: &span::Id) {}
            fn event(&self, event: &Event<'_>) {
                if event.metadata().target().ends_with("tracing_support") {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
            fn enter(&self, _: &span::Id) {}
            fn exit(&self, _: &span::Id) {}
        }

        let count = |config: MemoryPoolConfig| {
            let seen = Arc::new(AtomicUsize::new(0));
            let pool = MemoryPool::new(config.with_initial_size(1024)).unwrap();
            with_default(CountEvents(Arc::clone(&seen)), || {
                drop(pool.allocate(64, None, None).unwrap());
            });
            seen.load(Ordering::SeqCst)
        };

        assert_eq!(count(MemoryPoolConfig::default()), 0);
        assert_eq!(count(MemoryPoolConfig::default().with_allocation_events(true)), 2);
    }

    #[test]
    fn test_growth_capped_by_max_size() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_max_size(2048),
        )
        .unwrap();
        let _a = pool.allocate(1024, None, None).unwrap();
        assert!(pool.allocate(4096, None, None).is_err());
        assert!(pool.grow(4096).is_err());
        assert_eq!(pool.grow(1024).unwrap(), 1024);
        assert!(pool.grow(1).is_err());
    }

    #[test]
    fn test_fixed_pool_does_not_grow() {
        let pool = cpu_pool(1024);
        assert!(pool.grow(1024).is_err());
        assert_eq!(pool.stats().region_count, 1);
    }

    #[test]
    fn test_buddy_halves_blocks() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_strategy(AllocationStrategy::Buddy)
                .with_debug_checks(true),
        )
        .unwrap();

        let handle = pool.allocate(100, None, None).unwrap();
        assert_eq!(handle.size(), 128);

        let sizes: Vec<(usize, bool)> = pool.dump_blocks().iter().map(|b| (b.size, b.free)).collect();
        assert_eq!(sizes, vec![(128, false), (128, true), (256, true), (512, true)]);

        drop(handle);
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    fn test_tags_kept_only_when_tracking() {
        let tracked = MemoryPool::new(
            MemoryPoolConfig::default()
                .with_initial_size(1024)
                .with_tracking(true),
        )
        .unwrap();
        let _h = tracked.allocate(16, None, Some("kv-cache")).unwrap();
        assert_eq!(tracked.dump_blocks()[0].tag.as_deref(), Some("kv-cache"));
        assert!(tracked.dump().contains("kv-cache"));

        let untracked = cpu_pool(1024);
        let _h = untracked.allocate(16, None, Some("kv-cache")).unwrap();
        assert!(untracked.dump_blocks()[0].tag.is_none());
    }

    #[test]
    fn test_peak_usage() {
        let pool = cpu_pool(4096);
        let a = pool.allocate(1024, None, None).unwrap();
        let b = pool.allocate(1024, None, None).unwrap();
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.peak_usage, 2048);
        assert_eq!(stats.used_size, 0);
        assert_eq!(stats.allocation_count, 2);
    }

    #[test]
    fn test_shared_pool() {
        let pool = MemoryPool::new(
            MemoryPoolConfig::new(MemoryType::Shared).with_initial_size(5000),
        )
        .unwrap();
        assert_eq!(pool.stats().total_size, 8192);
        let mut handle = pool.allocate(128, None, None).unwrap();
        handle.write(0, b"shared").unwrap();
        assert_eq!(&handle.as_slice().unwrap()[..6], b"shared");
    }

    #[test]
    fn test_device_pool_is_opaque() {
        let segment = ExternalSegment::device(0x1000_0000, 1 << 16).unwrap();
        let pool = MemoryPool::new(MemoryPoolConfig::from_external(segment)).unwrap();
        assert_eq!(pool.memory_type(), MemoryType::Gpu);

        let handle = pool.allocate(4096, Some(256), None).unwrap();
        assert_eq!(handle.address(), 0x1000_0000);
        assert!(handle.as_slice().is_none());
        assert!(pool.grow(4096).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(MemoryPoolConfig::default().validate().is_ok());
        assert!(matches!(
            MemoryPoolConfig::default().with_alignment(12).validate(),
            Err(Error::InvalidAlignment(12))
        ));
        assert!(
            MemoryPoolConfig::default()
                .with_initial_size(0)
                .validate()
                .is_err()
        );
        assert!(
            MemoryPoolConfig::default()
                .with_initial_size(4096)
                .with_max_size(1024)
                .validate()
                .is_err()
        );
        assert!(MemoryPoolConfig::new(MemoryType::Gpu).validate().is_err());
        assert!(MemoryPoolConfig::new(MemoryType::External).validate().is_err());
    }
}
