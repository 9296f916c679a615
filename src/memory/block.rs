//! Block bookkeeping for the memory pool.
//!
//! Blocks live in a slab indexed by [`BlockId`]. Two ordered indices sit on
//! top of the slab:
//!
//! - `by_address`: every block keyed by `(region, offset)`, so neighbours are
//!   a range query away and a region's blocks can be walked in order.
//! - `free`: the subset of free blocks, in the same address order. This is
//!   the free list the allocation strategies scan.
//!
//! A slot's generation is bumped whenever its block is removed, so a stale
//! id never resolves to a block that reused the slot.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::time::Instant;

/// Callback run once when a block's last reference is released.
pub(crate) type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Generational index of a block within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

impl BlockId {
    /// Slot index (for diagnostics).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation (for diagnostics).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Position of a block: region index and byte offset inside the region.
pub(crate) type BlockKey = (usize, usize);

/// One contiguous range of a region, free or allocated.
pub(crate) struct MemoryBlock {
    pub region: usize,
    pub offset: usize,
    pub size: usize,
    /// Bytes between `offset` and the first usable byte (alignment padding
    /// too small to split off).
    pub padding: usize,
    pub alignment: usize,
    pub free: bool,
    pub created: Instant,
    pub ref_count: u32,
    pub tag: Option<String>,
    pub on_release: Option<ReleaseCallback>,
}

impl MemoryBlock {
    pub fn new_free(region: usize, offset: usize, size: usize) -> Self {
        Self {
            region,
            offset,
            size,
            padding: 0,
            alignment: 1,
            free: true,
            created: Instant::now(),
            ref_count: 0,
            tag: None,
            on_release: None,
        }
    }

    pub fn key(&self) -> BlockKey {
        (self.region, self.offset)
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

struct Slot {
    generation: u32,
    block: Option<MemoryBlock>,
}

/// Slab of blocks with address-ordered indices.
#[derive(Default)]
pub(crate) struct BlockArena {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    by_address: BTreeMap<BlockKey, BlockId>,
    free: BTreeSet<BlockKey>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block and index it.
    pub fn insert(&mut self, block: MemoryBlock) -> BlockId {
        let key = block.key();
        let is_free = block.free;

        let id = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.block = Some(block);
                BlockId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    block: Some(block),
                });
                BlockId {
                    index,
                    generation: 0,
                }
            }
        };

        self.by_address.insert(key, id);
        if is_free {
            self.free.insert(key);
        }
        id
    }

    /// Remove a block, invalidating its id.
    pub fn remove(&mut self, id: BlockId) -> Option<MemoryBlock> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.block.is_none() {
            return None;
        }
        let block = slot.block.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);

        self.by_address.remove(&block.key());
        self.free.remove(&block.key());
        Some(block)
    }

    pub fn get(&self, id: BlockId) -> Option<&MemoryBlock> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.block.as_ref()
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.block.as_mut()
    }

    /// Id of the block starting at `key`.
    #[cfg(test)]
    pub fn id_at(&self, key: BlockKey) -> Option<BlockId> {
        self.by_address.get(&key).copied()
    }

    /// The block immediately before `key` in the same region, if any.
    pub fn prev_in_region(&self, key: BlockKey) -> Option<BlockId> {
        self.by_address
            .range(..key)
            .next_back()
            .filter(|((region, _), _)| *region == key.0)
            .map(|(_, id)| *id)
    }

    /// The block immediately after `key` in the same region, if any.
    pub fn next_in_region(&self, key: BlockKey) -> Option<BlockId> {
        self.by_address
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .filter(|((region, _), _)| *region == key.0)
            .map(|(_, id)| *id)
    }

    /// Free blocks in address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (BlockId, &MemoryBlock)> + '_ {
        self.free.iter().filter_map(move |key| {
            let id = self.by_address.get(key)?;
            self.get(*id).map(|b| (*id, b))
        })
    }

    /// All blocks of one region in address order.
    pub fn region_blocks(&self, region: usize) -> impl Iterator<Item = (BlockId, &MemoryBlock)> + '_ {
        self.by_address
            .range((region, 0)..=(region, usize::MAX))
            .filter_map(move |(_, id)| self.get(*id).map(|b| (*id, b)))
    }

    /// All blocks in address order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &MemoryBlock)> + '_ {
        self.by_address
            .values()
            .filter_map(move |id| self.get(*id).map(|b| (*id, b)))
    }

    /// Whether the free index lists `key`.
    pub fn is_indexed_free(&self, key: BlockKey) -> bool {
        self.free.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(region: usize, offset: usize, size: usize) -> MemoryBlock {
        let mut block = MemoryBlock::new_free(region, offset, size);
        block.free = false;
        block.ref_count = 1;
        block
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut arena = BlockArena::new();
        let a = arena.insert(MemoryBlock::new_free(0, 0, 64));
        let b = arena.insert(used(0, 64, 32));

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.free_len(), 1);
        assert_eq!(arena.get(a).unwrap().size, 64);
        assert!(!arena.get(b).unwrap().free);
        assert_eq!(arena.id_at((0, 64)), Some(b));
    }

    #[test]
    fn test_stale_id_rejected_after_reuse() {
        let mut arena = BlockArena::new();
        let a = arena.insert(MemoryBlock::new_free(0, 0, 64));
        arena.remove(a).unwrap();

        let b = arena.insert(MemoryBlock::new_free(0, 0, 128));
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.get(b).unwrap().size, 128);
    }

    #[test]
    fn test_neighbours_stay_within_region() {
        let mut arena = BlockArena::new();
        let r0_last = arena.insert(used(0, 100, 28));
        let r1_first = arena.insert(used(1, 0, 64));
        let r1_second = arena.insert(used(1, 64, 64));

        assert_eq!(arena.next_in_region((0, 100)), None);
        assert_eq!(arena.prev_in_region((1, 0)), None);
        assert_eq!(arena.next_in_region((1, 0)), Some(r1_second));
        assert_eq!(arena.prev_in_region((1, 64)), Some(r1_first));
        assert!(arena.get(r0_last).is_some());
    }

    #[test]
    fn test_free_blocks_in_address_order() {
        let mut arena = BlockArena::new();
        arena.insert(MemoryBlock::new_free(0, 200, 10));
        arena.insert(used(0, 100, 100));
        arena.insert(MemoryBlock::new_free(0, 0, 100));

        let offsets: Vec<usize> = arena.free_blocks().map(|(_, b)| b.offset).collect();
        assert_eq!(offsets, vec![0, 200]);
    }

    #[test]
    fn test_region_blocks() {
        let mut arena = BlockArena::new();
        arena.insert(MemoryBlock::new_free(0, 0, 10));
        arena.insert(MemoryBlock::new_free(1, 0, 20));
        arena.insert(used(1, 20, 30));

        let sizes: Vec<usize> = arena.region_blocks(1).map(|(_, b)| b.size).collect();
        assert_eq!(sizes, vec![20, 30]);
    }
}
