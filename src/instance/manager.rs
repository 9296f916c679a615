//! Top-level owner of memory pools and instance pools.

use super::pool::{InstancePool, InstancePoolConfig, PoolResources, PoolStats};
use super::weights::{SharedWeights, SharedWeightsTable};
use crate::engine::BackendRegistry;
use crate::error::{Error, Result};
use crate::memory::{MemoryPool, MemoryPoolConfig, MemoryType};
use crate::model::{FileModelLoader, ModelLoader};
use crate::observability::TracingConfig;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Configuration of an [`InstanceManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// One memory pool per memory type. The first is the default.
    pub memory_pools: Vec<MemoryPoolConfig>,
    /// Span configuration handed to every instance pool.
    pub tracing: TracingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            memory_pools: vec![MemoryPoolConfig::default()],
            tracing: TracingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// A manager with a single memory pool.
    pub fn new(memory: MemoryPoolConfig) -> Self {
        Self {
            memory_pools: vec![memory],
            tracing: TracingConfig::default(),
        }
    }

    /// Add a memory pool of another type.
    pub fn with_memory_pool(mut self, memory: MemoryPoolConfig) -> Self {
        self.memory_pools.push(memory);
        self
    }

    /// Set span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.memory_pools.is_empty() {
            return Err(Error::InvalidConfig("at least one memory pool is required".into()));
        }
        let mut seen = Vec::with_capacity(self.memory_pools.len());
        for pool in &self.memory_pools {
            if seen.contains(&pool.memory_type) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate {} memory pool",
                    pool.memory_type
                )));
            }
            seen.push(pool.memory_type);
            pool.validate()?;
        }
        Ok(())
    }
}

struct MemoryEntry {
    memory: MemoryPool,
    weights: Arc<SharedWeightsTable>,
}

/// Owns memory pools, the backend registry and one instance pool per model.
///
/// # Example
///
/// ```rust,ignore
/// use cistern::instance::{InstanceManager, InstancePoolConfig, ManagerConfig};
///
/// let manager = InstanceManager::new(ManagerConfig::default())?;
/// let pool = manager.create_pool(InstancePoolConfig::new("resnet50", "/models/resnet50.onnx"))?;
///
/// let lease = pool.acquire(None)?;
/// ```
pub struct InstanceManager {
    memory: BTreeMap<MemoryType, MemoryEntry>,
    default_type: MemoryType,
    backends: Arc<BackendRegistry>,
    pools: RwLock<HashMap<String, Arc<InstancePool>>>,
    tracing: TracingConfig,
}

impl InstanceManager {
    /// Create a manager with the built-in backends and a file model loader.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_components(
            config,
            Arc::new(BackendRegistry::with_defaults()),
            Arc::new(FileModelLoader::new()),
        )
    }

    /// Create a manager with a caller-supplied registry and model loader.
    pub fn with_components(
        config: ManagerConfig,
        backends: Arc<BackendRegistry>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        config.validate()?;
        let default_type = config.memory_pools[0].memory_type;

        let mut memory = BTreeMap::new();
        for pool_config in config.memory_pools {
            let memory_type = pool_config.memory_type;
            let pool = MemoryPool::new(pool_config)?;
            let weights = Arc::new(SharedWeightsTable::new(pool.clone(), Arc::clone(&loader)));
            memory.insert(memory_type, MemoryEntry { memory: pool, weights });
        }

        tracing::info!(
            memory_pools = memory.len(),
            default = %default_type,
            backends = ?backends.list_backends(),
            "instance manager created"
        );
        Ok(Self {
            memory,
            default_type,
            backends,
            pools: RwLock::new(HashMap::new()),
            tracing: config.tracing,
        })
    }

    fn read_pools(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<InstancePool>>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pools(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<InstancePool>>> {
        self.pools.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, memory_type: MemoryType) -> Result<&MemoryEntry> {
        self.memory
            .get(&memory_type)
            .ok_or_else(|| Error::InvalidConfig(format!("no {} memory pool configured", memory_type)))
    }

    /// The backend registry. Register custom backends here before creating pools.
    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// Memory pool of `memory_type`.
    pub fn memory_pool(&self, memory_type: MemoryType) -> Option<&MemoryPool> {
        self.memory.get(&memory_type).map(|entry| &entry.memory)
    }

    /// The first configured memory pool.
    pub fn default_memory_pool(&self) -> &MemoryPool {
        // validate() guarantees the default type is present.
        &self.memory[&self.default_type].memory
    }

    /// Create the instance pool for `config.model_id`.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExists`] if the model already has a pool; otherwise any
    /// error from [`InstancePool::new`] (including preloading).
    pub fn create_pool(&self, config: InstancePoolConfig) -> Result<Arc<InstancePool>> {
        if self.read_pools().contains_key(&config.model_id) {
            return Err(Error::PoolExists(config.model_id));
        }
        let entry = self.entry(config.memory_type)?;
        let resources = PoolResources::new(entry.memory.clone(), Arc::clone(&self.backends))
            .with_weights(Arc::clone(&entry.weights))
            .with_tracing(self.tracing.clone());

        // Built outside the map lock: preloading may take a while.
        let model_id = config.model_id.clone();
        let pool = Arc::new(InstancePool::new(config, resources)?);

        let mut pools = self.write_pools();
        if pools.contains_key(&model_id) {
            drop(pools);
            pool.shutdown();
            return Err(Error::PoolExists(model_id));
        }
        pools.insert(model_id, Arc::clone(&pool));
        Ok(pool)
    }

    /// Shut down and forget the pool for `model_id`.
    ///
    /// Idle instances are unloaded immediately, leased ones when released.
    pub fn destroy_pool(&self, model_id: &str) -> Result<()> {
        let pool = self
            .write_pools()
            .remove(model_id)
            .ok_or_else(|| Error::PoolNotFound(model_id.to_string()))?;
        pool.shutdown();
        tracing::info!(model = %model_id, "instance pool destroyed");
        Ok(())
    }

    /// The pool for `model_id`.
    pub fn get_pool(&self, model_id: &str) -> Option<Arc<InstancePool>> {
        self.read_pools().get(model_id).cloned()
    }

    /// Model ids with a pool, sorted.
    pub fn list_pools(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_pools().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Statistics of every pool, sorted by model id.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<InstancePool>> = self.read_pools().values().cloned().collect();
        let mut stats: Vec<PoolStats> = pools.iter().map(|pool| pool.get_stats()).collect();
        stats.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        stats
    }

    /// Lease the weights of `model_path` from the default memory pool.
    ///
    /// The file is loaded once per distinct path; later calls return new
    /// references to the same block.
    pub fn create_shared_weights(&self, model_path: &Path) -> Result<SharedWeights> {
        self.create_shared_weights_in(self.default_type, model_path)
    }

    /// Lease the weights of `model_path` from the pool of `memory_type`.
    pub fn create_shared_weights_in(&self, memory_type: MemoryType, model_path: &Path) -> Result<SharedWeights> {
        self.entry(memory_type)?.weights.acquire(model_path)
    }

    /// Drop one weights lease. Returns true if the weights were freed.
    pub fn destroy_shared_weights(&self, weights: SharedWeights) -> Result<bool> {
        let pool_id = weights.handle().pool_id();
        let entry = self
            .memory
            .values()
            .find(|entry| entry.memory.id() == pool_id)
            .ok_or_else(|| Error::InvalidHandle(format!("weights belong to unknown memory pool {}", pool_id)))?;
        entry.weights.release(weights)
    }

    /// Run idle cleanup on every pool. Returns the total evicted.
    pub fn cleanup_idle(&self) -> usize {
        let pools: Vec<Arc<InstancePool>> = self.read_pools().values().cloned().collect();
        pools.iter().map(|pool| pool.cleanup_idle()).sum()
    }

    /// False if any pool or memory pool is unhealthy.
    pub fn health_check(&self) -> bool {
        let pools: Vec<Arc<InstancePool>> = self.read_pools().values().cloned().collect();
        let pools_ok = pools.iter().all(|pool| pool.health_check());
        let memory_ok = self
            .memory
            .values()
            .all(|entry| entry.memory.check_integrity().is_ok());
        pools_ok && memory_ok
    }

    /// Shut down and forget every pool.
    pub fn shutdown(&self) {
        let pools: Vec<Arc<InstancePool>> = self.write_pools().drain().map(|(_, pool)| pool).collect();
        for pool in &pools {
            pool.shutdown();
        }
        tracing::info!(pools = pools.len(), "instance manager shut down");
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("memory_pools", &self.memory.keys().collect::<Vec<_>>())
            .field("pools", &self.list_pools())
            .finish()
    }
}
