//! Default pool sizes and allocator constants.
//!
//! Sizes are chosen for a single-node inference server: a CPU pool large
//! enough for the weights of a small model plus per-instance scratch, with
//! room to double before hitting the ceiling.

// =============================================================================
// Pool sizes (bytes)
// =============================================================================

/// Initial size of a CPU memory pool (64 MiB).
pub const DEFAULT_INITIAL_SIZE: usize = 64 * 1024 * 1024;

/// Growth increment when a growable pool runs out of space (16 MiB).
pub const DEFAULT_GROW_SIZE: usize = 16 * 1024 * 1024;

/// Default per-instance scratch allocation (1 MiB).
pub const DEFAULT_PRIVATE_MEMORY_SIZE: usize = 1024 * 1024;

// =============================================================================
// Allocator behaviour
// =============================================================================

/// Default alignment for allocations that do not request one.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Smallest remainder worth splitting off as its own free block.
///
/// Remainders below one pointer width stay attached to the allocated block.
pub const MIN_SPLIT_SIZE: usize = std::mem::size_of::<usize>();

/// Alignment of freshly created regions.
///
/// One cache line, so the first block of a region never needs padding for
/// typical tensor alignments.
pub const REGION_ALIGNMENT: usize = 64;

// =============================================================================
// Instance pools
// =============================================================================

/// Default number of warm-up inferences per instance.
pub const DEFAULT_WARMUP_ITERATIONS: u32 = 3;

/// Default idle time before an instance becomes eligible for eviction.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default number of affinity keys a sticky pool remembers.
pub const DEFAULT_AFFINITY_CAPACITY: usize = 4096;

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
