//! # Serving
//!
//! Four worker threads share one model through an instance pool. Weights
//! are loaded once and shared; each instance gets its own scratch block.
//!
//! ```text
//! [worker 0..4] → acquire → [instance 0..2] → release
//! ```
//!
//! Run: `cargo run --example 01_serving`

use cistern::prelude::*;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    let mut model = tempfile::NamedTempFile::new()?;
    model.write_all(&[0x42; 64 * 1024])?;

    let manager = InstanceManager::new(ManagerConfig::new(
        MemoryPoolConfig::default().with_initial_size(8 * 1024 * 1024),
    ))?;
    let pool = manager.create_pool(
        InstancePoolConfig::new("demo", model.path())
            .with_instances(1, 3)
            .with_share_type(ShareType::Weights)
            .with_strategy(SchedulingStrategy::LeastLoaded)
            .with_warmup(2),
    )?;

    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || -> Result<()> {
                let mut outputs = Vec::new();
                for request in 0..25u8 {
                    let lease = pool.acquire(Some(Duration::from_secs(1)))?;
                    lease.infer(&[&[worker, request][..]], &mut outputs)?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    let stats = pool.get_stats();
    println!(
        "{} instances, {} inferences, avg latency {:?}, {} bytes in use",
        stats.total_instances,
        stats.total_inferences,
        stats.avg_latency,
        manager.default_memory_pool().stats().used_size
    );
    for info in pool.get_instances() {
        println!("  instance {}: {} ({} inferences)", info.id, info.status, info.inference_count);
    }

    manager.destroy_pool("demo")?;
    println!("after destroy: {} bytes in use", manager.default_memory_pool().stats().used_size);
    Ok(())
}
