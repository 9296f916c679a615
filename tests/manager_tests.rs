//! Integration tests for the instance manager and shared weights.

use cistern::instance::{InstanceManager, InstancePoolConfig, ManagerConfig, ShareType};
use cistern::memory::{MemoryPoolConfig, MemoryType};
use cistern::Error;
use std::io::Write;
use std::time::Duration;

fn manager() -> InstanceManager {
    InstanceManager::new(ManagerConfig::new(
        MemoryPoolConfig::default().with_initial_size(1 << 20),
    ))
    .unwrap()
}

fn model_file(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file
}

#[test]
fn test_shared_weights_loaded_once_per_path() {
    let manager = manager();
    let file = model_file(&[7u8; 1000]);
    let memory = manager.default_memory_pool().clone();

    let a = manager.create_shared_weights(file.path()).unwrap();
    let b = manager.create_shared_weights(file.path()).unwrap();
    assert_eq!(a.address(), b.address());
    assert_eq!(a.len(), 1000);
    assert_eq!(a.ref_count(), 2);
    assert_eq!(memory.stats().active_blocks, 1);

    // Dropping one lease leaves the other readable.
    assert!(!manager.destroy_shared_weights(a).unwrap());
    assert_eq!(b.bytes().unwrap(), &[7u8; 1000][..]);

    assert!(manager.destroy_shared_weights(b).unwrap());
    assert_eq!(memory.stats().used_size, 0);
}

#[test]
fn test_shared_weights_reloaded_after_last_release() {
    let manager = manager();
    let file = model_file(b"first");

    let weights = manager.create_shared_weights(file.path()).unwrap();
    assert_eq!(weights.bytes().unwrap(), b"first");
    drop(weights);

    std::fs::write(file.path(), b"second").unwrap();
    let weights = manager.create_shared_weights(file.path()).unwrap();
    assert_eq!(weights.bytes().unwrap(), b"second");
}

#[test]
fn test_missing_model_reported() {
    let manager = manager();
    let err = manager
        .create_shared_weights(std::path::Path::new("/nonexistent/model.bin"))
        .unwrap_err();
    assert!(!err.is_recoverable());
    assert_eq!(manager.default_memory_pool().stats().used_size, 0);
}

#[test]
fn test_pools_share_weights_across_models() {
    let manager = manager();
    let file = model_file(&[3u8; 2048]);

    let a = manager
        .create_pool(
            InstancePoolConfig::new("model-a", file.path())
                .with_instances(2, 2)
                .with_share_type(ShareType::Weights)
                .with_private_memory(1024),
        )
        .unwrap();
    let b = manager
        .create_pool(
            InstancePoolConfig::new("model-b", file.path())
                .with_instances(1, 1)
                .with_share_type(ShareType::Full)
                .with_workspace(1024),
        )
        .unwrap();

    let external = manager.create_shared_weights(file.path()).unwrap();
    let lease_a = a.acquire(None).unwrap();
    let lease_b = b.acquire(None).unwrap();
    assert_eq!(lease_a.shared_weights().unwrap().address(), external.address());
    assert_eq!(lease_b.shared_weights().unwrap().address(), external.address());

    // Three instances and the external lease.
    assert_eq!(external.ref_count(), 4);

    let mut outputs = Vec::new();
    lease_a.infer(&[&b"ping"[..]], &mut outputs).unwrap();
    assert_eq!(outputs, vec![b"ping".to_vec()]);
}

#[test]
fn test_duplicate_pool_rejected() {
    let manager = manager();
    let file = model_file(&[1u8; 64]);
    let config = InstancePoolConfig::new("dup", file.path()).with_private_memory(1024);

    manager.create_pool(config.clone()).unwrap();
    assert!(matches!(manager.create_pool(config), Err(Error::PoolExists(id)) if id == "dup"));
    assert_eq!(manager.list_pools(), vec!["dup".to_string()]);
}

#[test]
fn test_destroy_pool_frees_memory() {
    let manager = manager();
    let file = model_file(&[1u8; 64]);
    let memory = manager.default_memory_pool().clone();

    let pool = manager
        .create_pool(
            InstancePoolConfig::new("gone", file.path())
                .with_instances(3, 3)
                .with_private_memory(4096),
        )
        .unwrap();
    assert_eq!(memory.stats().used_size, 3 * 4096);

    manager.destroy_pool("gone").unwrap();
    assert!(pool.is_closed());
    assert!(manager.get_pool("gone").is_none());
    assert_eq!(memory.stats().used_size, 0);
    assert!(matches!(manager.destroy_pool("gone"), Err(Error::PoolNotFound(_))));
    assert!(matches!(pool.acquire(None), Err(Error::PoolClosed(_))));
}

#[test]
fn test_leased_instance_outlives_destroy() {
    let manager = manager();
    let file = model_file(&[1u8; 64]);
    let memory = manager.default_memory_pool().clone();

    let pool = manager
        .create_pool(
            InstancePoolConfig::new("held", file.path())
                .with_instances(1, 1)
                .with_private_memory(4096),
        )
        .unwrap();
    let lease = pool.acquire(None).unwrap();
    manager.destroy_pool("held").unwrap();

    // Still usable until released.
    let mut outputs = Vec::new();
    lease.infer(&[&b"late"[..]], &mut outputs).unwrap();
    assert_eq!(memory.stats().used_size, 4096);

    drop(lease);
    assert_eq!(memory.stats().used_size, 0);
}

#[test]
fn test_pools_on_separate_memory_types() {
    let manager = InstanceManager::new(
        ManagerConfig::new(MemoryPoolConfig::default().with_initial_size(1 << 20))
            .with_memory_pool(MemoryPoolConfig::new(MemoryType::Shared).with_initial_size(1 << 20)),
    )
    .unwrap();
    let file = model_file(&[5u8; 256]);

    let shared = manager.memory_pool(MemoryType::Shared).unwrap().clone();
    let cpu = manager.memory_pool(MemoryType::Cpu).unwrap().clone();

    manager
        .create_pool(
            InstancePoolConfig::new("shm", file.path())
                .with_memory_type(MemoryType::Shared)
                .with_private_memory(2048),
        )
        .unwrap();
    assert_eq!(shared.stats().used_size, 2048);
    assert_eq!(cpu.stats().used_size, 0);

    let weights = manager
        .create_shared_weights_in(MemoryType::Shared, file.path())
        .unwrap();
    assert_eq!(weights.handle().pool_id(), shared.id());

    let err = manager
        .create_pool(InstancePoolConfig::new("gpu", file.path()).with_memory_type(MemoryType::Gpu))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn test_stats_cleanup_and_shutdown() {
    let manager = manager();
    let file = model_file(&[1u8; 64]);

    for id in ["b", "a"] {
        manager
            .create_pool(
                InstancePoolConfig::new(id, file.path())
                    .with_instances(0, 2)
                    .with_idle_timeout(Duration::ZERO)
                    .with_private_memory(1024),
            )
            .unwrap();
    }

    for id in ["a", "b"] {
        let pool = manager.get_pool(id).unwrap();
        drop(pool.acquire(None).unwrap());
    }

    let stats = manager.pool_stats();
    let ids: Vec<&str> = stats.iter().map(|s| s.model_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(stats.iter().all(|s| s.total_instances == 1 && s.acquisitions == 1));
    assert!(manager.health_check());

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(manager.cleanup_idle(), 2);

    let pool = manager.get_pool("a").unwrap();
    drop(manager);
    assert!(pool.is_closed());
}
