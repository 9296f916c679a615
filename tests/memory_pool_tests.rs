//! Integration tests for the block allocator.
//!
//! These drive `MemoryPool` through its public API: placement strategies,
//! accounting after arbitrary allocate/free sequences, reference counting
//! and concurrent use.

use cistern::memory::{AllocationStrategy, MemoryHandle, MemoryPool, MemoryPoolConfig};
use cistern::Error;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

fn pool(size: usize, strategy: AllocationStrategy) -> MemoryPool {
    MemoryPool::new(
        MemoryPoolConfig::default()
            .with_initial_size(size)
            .with_strategy(strategy)
            .with_debug_checks(true),
    )
    .unwrap()
}

/// Lay out free holes of `holes` bytes separated by small allocated fences.
///
/// Returns the fences (keep them alive) and the addresses of the holes.
fn holes(pool: &MemoryPool, holes: &[usize]) -> (Vec<MemoryHandle>, Vec<usize>) {
    let mut fences = Vec::new();
    let mut addresses = Vec::new();
    let mut gaps = Vec::new();
    for &size in holes {
        let gap = pool.allocate(size, Some(1), None).unwrap();
        addresses.push(gap.address());
        gaps.push(gap);
        fences.push(pool.allocate(8, Some(1), Some("fence")).unwrap());
    }
    drop(gaps);
    (fences, addresses)
}

// ============================================================================
// Placement
// ============================================================================

#[test]
fn test_best_fit_picks_smallest_sufficient_block() {
    // 100 + 8 + 50 + 8 + 200 + 8
    let pool = pool(374, AllocationStrategy::BestFit);
    let (_fences, addresses) = holes(&pool, &[100, 50, 200]);
    assert_eq!(pool.stats().free_size, 350);
    assert_eq!(pool.stats().free_blocks, 3);

    let handle = pool.allocate(60, Some(1), None).unwrap();
    assert_eq!(handle.address(), addresses[0]);

    // The 40-byte remainder went back on the free list.
    let free: Vec<usize> = pool
        .dump_blocks()
        .into_iter()
        .filter(|b| b.free)
        .map(|b| b.size)
        .collect();
    assert_eq!(free, vec![40, 50, 200]);
}

#[test]
fn test_first_fit_picks_lowest_address() {
    let pool = pool(374, AllocationStrategy::FirstFit);
    let (_fences, addresses) = holes(&pool, &[100, 50, 200]);
    let handle = pool.allocate(40, Some(1), None).unwrap();
    assert_eq!(handle.address(), addresses[0]);
}

#[test]
fn test_worst_fit_picks_largest_block() {
    let pool = pool(374, AllocationStrategy::WorstFit);
    let (_fences, addresses) = holes(&pool, &[100, 50, 200]);
    let handle = pool.allocate(40, Some(1), None).unwrap();
    assert_eq!(handle.address(), addresses[2]);
}

#[test]
fn test_best_fit_tie_goes_to_lowest_address() {
    let pool = pool(216, AllocationStrategy::BestFit);
    let (_fences, addresses) = holes(&pool, &[100, 100]);
    let handle = pool.allocate(64, Some(1), None).unwrap();
    assert_eq!(handle.address(), addresses[0]);
}

#[test]
fn test_remainder_below_split_threshold_is_absorbed() {
    let pool = pool(374, AllocationStrategy::BestFit);
    let (_fences, _) = holes(&pool, &[100, 50, 200]);

    // 50 - 46 = 4 bytes, too small to split.
    let handle = pool.allocate(46, Some(1), None).unwrap();
    assert_eq!(handle.size(), 46);
    assert_eq!(pool.stats().free_blocks, 2);
    assert_eq!(pool.stats().free_size, 300);
}

// ============================================================================
// Reference counting
// ============================================================================

#[test]
fn test_ref_then_two_frees() {
    let pool = pool(4096, AllocationStrategy::BestFit);
    let handle = pool.allocate(256, None, None).unwrap();
    let extra = handle.clone();
    assert_eq!(handle.ref_count(), 2);

    assert!(!pool.free(handle).unwrap());
    assert_eq!(pool.stats().active_blocks, 1);
    assert_eq!(extra.ref_count(), 1);

    assert!(pool.free(extra).unwrap());
    assert_eq!(pool.stats().active_blocks, 0);
    assert_eq!(pool.stats().used_size, 0);
}

#[test]
fn test_release_callback_runs_once_at_zero() {
    let pool = pool(4096, AllocationStrategy::BestFit);
    let calls = Arc::new(AtomicUsize::new(0));

    let handle = pool.allocate(64, None, None).unwrap();
    let counter = Arc::clone(&calls);
    handle.on_release(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let clones: Vec<_> = (0..3).map(|_| handle.clone()).collect();

    drop(handle);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    drop(clones);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_foreign_handle_rejected() {
    let a = pool(4096, AllocationStrategy::BestFit);
    let b = pool(4096, AllocationStrategy::BestFit);
    let handle = a.allocate(64, None, None).unwrap();

    let err = b.free(handle).unwrap_err();
    assert!(matches!(err, Error::ForeignHandle { .. }));
    // Released into its own pool anyway.
    assert_eq!(a.stats().used_size, 0);
    assert_eq!(b.stats().free_count, 0);
}

// ============================================================================
// Exhaustion and growth
// ============================================================================

#[test]
fn test_exhaustion_is_recoverable_by_freeing() {
    let pool = pool(1024, AllocationStrategy::FirstFit);
    let big = pool.allocate(1024, None, None).unwrap();

    let err = pool.allocate(16, None, None).unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(err, Error::PoolExhausted { largest_free: 0, .. }));

    drop(big);
    assert!(pool.allocate(16, None, None).is_ok());
}

#[test]
fn test_growth_then_compact_restores_initial_region() {
    let pool = MemoryPool::new(
        MemoryPoolConfig::default()
            .with_initial_size(4096)
            .with_max_size(4096 * 4)
            .with_grow_size(4096),
    )
    .unwrap();

    let handles: Vec<_> = (0..6).map(|_| pool.allocate(1024, None, None).unwrap()).collect();
    let grown = pool.stats();
    assert!(grown.region_count > 1);
    assert!(grown.total_size > 4096);

    drop(handles);
    let report = pool.compact();
    assert!(report.released_regions >= 1);

    let stats = pool.stats();
    assert_eq!(stats.total_size, 4096);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free_block, 4096);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_allocate_free() {
    let pool = pool(1 << 20, AllocationStrategy::BestFit);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let size = 64 + ((t * 31 + i * 17) % 512);
                    let mut handle = pool.allocate(size, None, None).unwrap();
                    handle.write(0, &[t as u8; 8]).unwrap();
                    assert_eq!(&handle.as_slice().unwrap()[..8], &[t as u8; 8]);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.used_size, 0);
    assert_eq!(stats.allocation_count, 8 * 200);
    assert_eq!(stats.free_blocks, 1);
    pool.check_integrity().unwrap();
}

// ============================================================================
// Accounting properties
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Clone(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (1usize..2048).prop_map(Op::Alloc),
            2 => any::<usize>().prop_map(Op::Free),
            1 => any::<usize>().prop_map(Op::Clone),
        ],
        1..64,
    )
}

fn strategies() -> impl Strategy<Value = AllocationStrategy> {
    prop_oneof![
        Just(AllocationStrategy::FirstFit),
        Just(AllocationStrategy::BestFit),
        Just(AllocationStrategy::WorstFit),
        Just(AllocationStrategy::Buddy),
    ]
}

proptest! {
    #[test]
    fn prop_used_plus_free_is_total(strategy in strategies(), ops in ops()) {
        let pool = pool(32 * 1024, strategy);
        let mut live: Vec<MemoryHandle> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => match pool.allocate(size, None, None) {
                    Ok(handle) => live.push(handle),
                    Err(Error::PoolExhausted { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                },
                Op::Free(i) if !live.is_empty() => {
                    let handle = live.swap_remove(i % live.len());
                    pool.free(handle).unwrap();
                }
                Op::Clone(i) if !live.is_empty() => {
                    let handle = live[i % live.len()].clone();
                    live.push(handle);
                }
                _ => {}
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.used_size + stats.free_size, stats.total_size);
            prop_assert!(pool.check_integrity().is_ok());
        }

        drop(live);
        let stats = pool.stats();
        prop_assert_eq!(stats.used_size, 0);
        prop_assert_eq!(stats.free_blocks, 1);
        prop_assert_eq!(stats.largest_free_block, 32 * 1024);
    }

    #[test]
    fn prop_allocations_never_overlap(sizes in prop::collection::vec(1usize..1024, 1..32)) {
        let pool = pool(64 * 1024, AllocationStrategy::BestFit);
        let handles: Vec<MemoryHandle> = sizes
            .iter()
            .filter_map(|&size| pool.allocate(size, None, None).ok())
            .collect();
        for handle in &handles {
            prop_assert_eq!(handle.address() % 16, 0);
        }
        let mut spans: Vec<(usize, usize)> = handles
            .iter()
            .map(|h| (h.address(), h.address() + h.size()))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }
}
