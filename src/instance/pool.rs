//! Bounded pool of instances for one model.
//!
//! Callers lease instances with [`InstancePool::acquire`]. The pool hands
//! out an idle instance chosen by the configured [`SchedulingStrategy`],
//! creates a new one while below `max_instances`, or blocks until a lease
//! is returned or the timeout expires.
//!
//! # Example
//!
//! ```rust,ignore
//! use cistern::instance::{InstancePool, InstancePoolConfig, PoolResources};
//! use std::time::Duration;
//!
//! let pool = InstancePool::new(InstancePoolConfig::new("resnet50", "/models/resnet50.onnx"), resources)?;
//!
//! let lease = pool.acquire(Some(Duration::from_millis(50)))?;
//! let mut outputs = Vec::new();
//! lease.infer(&[&input], &mut outputs)?;
//! drop(lease); // back to idle
//! ```

use super::instance::{Instance, InstanceInfo, InstanceMemory, InstanceStatus};
use super::scheduler::{Binding, Candidate, Scheduler, SchedulingStrategy, Selection};
use super::weights::SharedWeightsTable;
use crate::engine::{BackendRegistry, EngineConfig};
use crate::error::{Error, Result};
use crate::memory::defaults::{
    DEFAULT_AFFINITY_CAPACITY, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PRIVATE_MEMORY_SIZE, DEFAULT_WARMUP_ITERATIONS,
};
use crate::memory::{MemoryHandle, MemoryPool, MemoryType};
use crate::model::FileModelLoader;
use crate::observability::{InstancePoolMetrics, TracingConfig, trace_eviction};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// =============================================================================
// Configuration
// =============================================================================

/// Which resources instances of a pool share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShareType {
    /// Every instance loads its own model and owns its scratch memory.
    #[default]
    None,
    /// Instances borrow one de-duplicated weights lease.
    Weights,
    /// Instances share one workspace block instead of private scratch.
    Memory,
    /// Shared weights and shared workspace.
    Full,
}

impl ShareType {
    /// Whether weights come from the shared-weights table.
    pub fn shares_weights(&self) -> bool {
        matches!(self, ShareType::Weights | ShareType::Full)
    }

    /// Whether scratch memory is one pool-wide workspace.
    pub fn shares_memory(&self) -> bool {
        matches!(self, ShareType::Memory | ShareType::Full)
    }
}

/// Configuration of an [`InstancePool`].
#[derive(Debug, Clone)]
pub struct InstancePoolConfig {
    /// Model identifier, the pool's key in an
    /// [`InstanceManager`](super::InstanceManager).
    pub model_id: String,
    /// Model file handed to the engine or the weights loader.
    pub model_path: PathBuf,
    /// Backend name in the [`BackendRegistry`].
    pub backend: String,
    /// Instances kept alive by idle cleanup.
    pub min_instances: usize,
    /// Hard cap on instances, including ones being created.
    pub max_instances: usize,
    /// Idle time after which an instance may be evicted.
    pub idle_timeout: Duration,
    /// Resource sharing between instances.
    pub share_type: ShareType,
    /// Selection among idle instances.
    pub strategy: SchedulingStrategy,
    /// Strategy used by [`SchedulingStrategy::Sticky`] for unbound keys.
    pub sticky_fallback: SchedulingStrategy,
    /// Affinity keys remembered by [`SchedulingStrategy::Sticky`]; the least
    /// recently used key is forgotten past this.
    pub affinity_capacity: usize,
    /// Settings passed to the backend for every engine.
    pub engine: EngineConfig,
    /// Memory pool type the pool allocates from.
    pub memory_type: MemoryType,
    /// Private scratch per instance (0 for none).
    pub private_memory_size: usize,
    /// Size of the shared workspace when memory is shared.
    pub workspace_size: usize,
    /// Create `min_instances` up front.
    pub preload: bool,
    /// Warm instances up when the pool is created.
    pub warmup: bool,
    /// Synthetic inferences per instance during warm-up.
    pub warmup_iterations: u32,
}

impl InstancePoolConfig {
    /// Configuration for `model_id` served from `model_path`, on the echo backend.
    pub fn new(model_id: impl Into<String>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_id: model_id.into(),
            model_path: model_path.into(),
            backend: crate::engine::EchoBackend::NAME.to_string(),
            min_instances: 1,
            max_instances: 4,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            share_type: ShareType::None,
            strategy: SchedulingStrategy::RoundRobin,
            sticky_fallback: SchedulingStrategy::LeastLoaded,
            affinity_capacity: DEFAULT_AFFINITY_CAPACITY,
            engine: EngineConfig::default(),
            memory_type: MemoryType::Cpu,
            private_memory_size: DEFAULT_PRIVATE_MEMORY_SIZE,
            workspace_size: DEFAULT_PRIVATE_MEMORY_SIZE,
            preload: true,
            warmup: false,
            warmup_iterations: DEFAULT_WARMUP_ITERATIONS,
        }
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Set instance bounds.
    pub fn with_instances(mut self, min: usize, max: usize) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the share type.
    pub fn with_share_type(mut self, share_type: ShareType) -> Self {
        self.share_type = share_type;
        self
    }

    /// Set the scheduling strategy.
    pub fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the fallback for unbound sticky keys.
    pub fn with_sticky_fallback(mut self, strategy: SchedulingStrategy) -> Self {
        self.sticky_fallback = strategy;
        self
    }

    /// Set how many affinity keys a sticky pool remembers.
    pub fn with_affinity_capacity(mut self, keys: usize) -> Self {
        self.affinity_capacity = keys;
        self
    }

    /// Set the engine configuration.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the memory type.
    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    /// Set private scratch per instance.
    pub fn with_private_memory(mut self, bytes: usize) -> Self {
        self.private_memory_size = bytes;
        self
    }

    /// Set the shared workspace size.
    pub fn with_workspace(mut self, bytes: usize) -> Self {
        self.workspace_size = bytes;
        self
    }

    /// Enable or disable preloading.
    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    /// Warm up with `iterations` inferences per instance at creation.
    pub fn with_warmup(mut self, iterations: u32) -> Self {
        self.warmup = iterations > 0;
        self.warmup_iterations = iterations;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.model_id.is_empty() {
            return Err(Error::InvalidConfig("model_id must not be empty".into()));
        }
        if self.backend.is_empty() {
            return Err(Error::InvalidConfig("backend must not be empty".into()));
        }
        validate_bounds(self.min_instances, self.max_instances)?;
        if self.warmup && self.warmup_iterations == 0 {
            return Err(Error::InvalidConfig("warmup_iterations must be > 0".into()));
        }
        if self.affinity_capacity == 0 {
            return Err(Error::InvalidConfig("affinity_capacity must be > 0".into()));
        }
        Ok(())
    }
}

fn validate_bounds(min: usize, max: usize) -> Result<()> {
    if max == 0 {
        return Err(Error::InvalidConfig("max_instances must be > 0".into()));
    }
    if min > max {
        return Err(Error::InvalidConfig(format!(
            "min_instances ({}) exceeds max_instances ({})",
            min, max
        )));
    }
    Ok(())
}

/// Shared collaborators of an instance pool.
#[derive(Clone)]
pub struct PoolResources {
    /// Memory pool for scratch, workspace and (through `weights`) weights.
    pub memory: MemoryPool,
    /// Backends engines are created from.
    pub backends: Arc<BackendRegistry>,
    /// De-duplication table for shared weights.
    pub weights: Arc<SharedWeightsTable>,
    /// Span configuration.
    pub tracing: TracingConfig,
}

impl PoolResources {
    /// Resources with a private weights table loading files from disk.
    pub fn new(memory: MemoryPool, backends: Arc<BackendRegistry>) -> Self {
        let weights = Arc::new(SharedWeightsTable::new(
            memory.clone(),
            Arc::new(FileModelLoader::new()),
        ));
        Self {
            memory,
            backends,
            weights,
            tracing: TracingConfig::default(),
        }
    }

    /// Use a shared weights table.
    pub fn with_weights(mut self, weights: Arc<SharedWeightsTable>) -> Self {
        self.weights = weights;
        self
    }

    /// Set span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

impl std::fmt::Debug for PoolResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolResources")
            .field("memory", &self.memory)
            .field("backends", &self.backends)
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of pool-level statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Model served by the pool.
    pub model_id: String,
    /// Instances currently in the pool.
    pub total_instances: usize,
    /// Idle instances.
    pub idle_instances: usize,
    /// Leased instances.
    pub busy_instances: usize,
    /// Instances in `Error`.
    pub error_instances: usize,
    /// Instances being created.
    pub pending_instances: usize,
    /// Current lower bound.
    pub min_instances: usize,
    /// Current upper bound.
    pub max_instances: usize,
    /// Successful inferences, including by evicted instances.
    pub total_inferences: u64,
    /// Mean latency of the current instances' inferences.
    pub avg_latency: Duration,
    /// Inferences per second since the pool was created.
    pub throughput: f64,
    /// Bytes leased by the pool's instances; shared leases counted once.
    pub memory_bytes: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Total time callers spent in `acquire`.
    pub total_wait: Duration,
    /// Instances created.
    pub created: u64,
    /// Instance creations that failed.
    pub failed_creations: u64,
    /// Instances evicted or torn down.
    pub evicted: u64,
    /// Time since the pool was created.
    pub uptime: Duration,
}

/// Result of [`InstancePool::warmup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Instances that completed every iteration.
    pub instances_warmed: usize,
    /// Synthetic inferences run successfully.
    pub inferences: u64,
    /// Instances that failed and are now in `Error`.
    pub failures: usize,
    /// Wall time spent.
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    acquisitions: u64,
    timeouts: u64,
    total_wait: Duration,
    created: u64,
    failed_creations: u64,
    evicted: u64,
    /// Inferences of instances no longer in the pool.
    retired_inferences: u64,
}

// =============================================================================
// Pool
// =============================================================================

fn find(instances: &[Arc<Instance>], id: u64) -> Option<&Arc<Instance>> {
    instances
        .binary_search_by_key(&id, |i| i.id())
        .ok()
        .map(|index| &instances[index])
}

fn binding(instances: &[Arc<Instance>], id: u64) -> Binding {
    match find(instances, id).map(|i| i.status()) {
        Some(InstanceStatus::Idle) => Binding::Idle,
        Some(InstanceStatus::Busy) | Some(InstanceStatus::Loading) => Binding::Busy,
        _ => Binding::Gone,
    }
}

struct PoolInner {
    /// Sorted by id.
    instances: Vec<Arc<Instance>>,
    scheduler: Scheduler,
    /// Reserved slots for instances being created outside the lock.
    pending: usize,
    next_id: u64,
    min: usize,
    max: usize,
    closed: bool,
    counters: Counters,
    workspace: Option<MemoryHandle>,
}

impl PoolInner {
    fn find(&self, id: u64) -> Option<&Arc<Instance>> {
        find(&self.instances, id)
    }

    fn insert(&mut self, instance: Arc<Instance>) {
        let index = self.instances.partition_point(|i| i.id() < instance.id());
        self.instances.insert(index, instance);
    }

    /// Settle a reservation with the instance created for it.
    fn admit(&mut self, instance: Arc<Instance>, key: Option<&str>) {
        self.pending -= 1;
        self.counters.created += 1;
        self.scheduler.on_created(instance.id(), key);
        self.insert(instance);
    }

    fn take(&mut self, id: u64) -> Option<Arc<Instance>> {
        let index = self.instances.binary_search_by_key(&id, |i| i.id()).ok()?;
        let instance = self.instances.remove(index);
        self.scheduler.on_removed(id);
        self.counters.evicted += 1;
        self.counters.retired_inferences += instance.inference_count();
        Some(instance)
    }

    fn idle_candidates(&self) -> Vec<Candidate> {
        self.instances
            .iter()
            .filter(|i| i.is_idle())
            .map(|i| {
                let (inference_count, avg_latency_ns, priority) = i.load_stats();
                Candidate {
                    id: i.id(),
                    inference_count,
                    avg_latency_ns,
                    priority,
                }
            })
            .collect()
    }

    fn count(&self, status: InstanceStatus) -> usize {
        self.instances.iter().filter(|i| i.status() == status).count()
    }

    fn has_room(&self) -> bool {
        self.instances.len() + self.pending < self.max
    }

    /// Reserve a slot and an id for an instance created outside the lock.
    fn reserve(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending += 1;
        id
    }
}

/// Pool of instances serving one model.
pub struct InstancePool {
    config: InstancePoolConfig,
    resources: PoolResources,
    inner: Mutex<PoolInner>,
    available: Condvar,
    metrics: InstancePoolMetrics,
    created: Instant,
}

impl InstancePool {
    /// Create a pool. Preloads `min_instances` and warms them up as configured.
    pub fn new(config: InstancePoolConfig, resources: PoolResources) -> Result<Self> {
        config.validate()?;
        if resources.memory.memory_type() != config.memory_type {
            return Err(Error::InvalidConfig(format!(
                "pool for '{}' wants {} memory, got a {} memory pool",
                config.model_id,
                config.memory_type,
                resources.memory.memory_type()
            )));
        }
        resources.backends.resolve(&config.backend)?;

        let workspace = if config.share_type.shares_memory() && config.workspace_size > 0 {
            let tag = format!("workspace:{}", config.model_id);
            Some(resources.memory.allocate(config.workspace_size, None, Some(&tag))?)
        } else {
            None
        };

        let pool = Self {
            inner: Mutex::new(PoolInner {
                instances: Vec::new(),
                scheduler: Scheduler::new(config.strategy, config.sticky_fallback, config.affinity_capacity),
                pending: 0,
                next_id: 0,
                min: config.min_instances,
                max: config.max_instances,
                closed: false,
                counters: Counters::default(),
                workspace,
            }),
            available: Condvar::new(),
            metrics: InstancePoolMetrics::new(&config.model_id),
            created: Instant::now(),
            config,
            resources,
        };

        tracing::info!(
            model = %pool.config.model_id,
            backend = %pool.config.backend,
            min = pool.config.min_instances,
            max = pool.config.max_instances,
            strategy = %pool.config.strategy,
            "instance pool created"
        );

        if pool.config.preload {
            pool.ensure_min()?;
        }
        if pool.config.warmup {
            pool.warmup(pool.config.warmup_iterations)?;
        }
        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Model served by this pool.
    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    /// Configuration the pool was created with (bounds may since have been resized).
    pub fn config(&self) -> &InstancePoolConfig {
        &self.config
    }

    /// Memory pool backing the instances.
    pub fn memory(&self) -> &MemoryPool {
        &self.resources.memory
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // -------------------------------------------------------------------------
    // Instance creation
    // -------------------------------------------------------------------------

    /// Bring up one instance. Everything allocated so far is dropped on failure.
    fn build_instance(&self, id: u64, workspace: Option<MemoryHandle>) -> Result<Instance> {
        let config = &self.config;
        let engine = self
            .resources
            .backends
            .create_engine(&config.backend, &config.engine)?;

        let weights = if config.share_type.shares_weights() {
            Some(self.resources.weights.acquire(&config.model_path)?)
        } else {
            None
        };

        let private = if !config.share_type.shares_memory() && config.private_memory_size > 0 {
            let tag = format!("scratch:{}:{}", config.model_id, id);
            Some(
                self.resources
                    .memory
                    .allocate(config.private_memory_size, None, Some(&tag))?,
            )
        } else {
            None
        };

        let instance = Instance::new(
            id,
            &config.model_id,
            engine,
            InstanceMemory {
                private,
                weights,
                workspace,
            },
            0,
        );
        instance.load(&config.model_path)?;
        Ok(instance)
    }

    /// Create the instance for a reserved slot.
    ///
    /// Called without the pool lock. On failure the reservation is dropped;
    /// on success the caller admits the instance.
    fn create_reserved(&self, id: u64, workspace: Option<MemoryHandle>) -> Result<Arc<Instance>> {
        let started = Instant::now();
        match self.build_instance(id, workspace) {
            Ok(instance) => {
                self.metrics.record_created();
                tracing::info!(
                    model = %self.config.model_id,
                    instance = id,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "instance created"
                );
                Ok(Arc::new(instance))
            }
            Err(e) => {
                let mut inner = self.lock();
                inner.pending -= 1;
                inner.counters.failed_creations += 1;
                drop(inner);
                // The reserved slot is free again.
                self.available.notify_all();
                tracing::warn!(
                    model = %self.config.model_id,
                    instance = id,
                    error = %e,
                    "instance creation failed"
                );
                Err(Error::InstanceCreation {
                    model_id: self.config.model_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Settle the reservation of a freshly created instance and add it to
    /// the pool.
    ///
    /// If the pool was shut down while the instance was being built, the
    /// instance is unloaded instead and [`Error::PoolClosed`] is returned.
    fn admit_created(&self, instance: &Arc<Instance>, key: Option<&str>) -> Result<MutexGuard<'_, PoolInner>> {
        let mut inner = self.lock();
        inner.admit(Arc::clone(instance), key);
        if inner.closed {
            let evicted: Vec<Arc<Instance>> = inner.take(instance.id()).into_iter().collect();
            drop(inner);
            self.unload(&evicted, "shutdown");
            return Err(Error::PoolClosed(self.config.model_id.clone()));
        }
        Ok(inner)
    }

    /// Create idle instances until the pool holds `min_instances`.
    ///
    /// Returns the number created.
    pub fn ensure_min(&self) -> Result<usize> {
        let mut created = 0;
        loop {
            let (id, workspace) = {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(Error::PoolClosed(self.config.model_id.clone()));
                }
                if inner.instances.len() + inner.pending >= inner.min || !inner.has_room() {
                    break;
                }
                let id = inner.reserve();
                (id, inner.workspace.clone())
            };

            let instance = self.create_reserved(id, workspace)?;
            drop(self.admit_created(&instance, None)?);
            self.available.notify_all();
            created += 1;
        }
        if created > 0 {
            self.publish_states();
        }
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Acquire / release
    // -------------------------------------------------------------------------

    /// Lease an instance, waiting up to `timeout`.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` never blocks.
    ///
    /// # Errors
    ///
    /// - [`Error::AcquireTimeout`] if nothing became available in time.
    /// - [`Error::InstanceCreation`] if a new instance was needed and failed;
    ///   the pool's accounting is unchanged.
    /// - [`Error::PoolClosed`] after [`shutdown`](Self::shutdown).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<InstanceLease<'_>> {
        self.acquire_with_key(None, timeout)
    }

    /// Lease an instance without blocking.
    pub fn try_acquire(&self) -> Result<InstanceLease<'_>> {
        self.acquire_with_key(None, Some(Duration::ZERO))
    }

    /// Lease an instance for an affinity key.
    ///
    /// Under [`SchedulingStrategy::Sticky`] every request with the same key
    /// is routed to the same instance while it exists. Other strategies
    /// ignore the key.
    pub fn acquire_with_key(&self, key: Option<&str>, timeout: Option<Duration>) -> Result<InstanceLease<'_>> {
        let span = self.resources.tracing.pool_span(&self.config.model_id);
        let _guard = span.enter();

        let start = Instant::now();
        let deadline = timeout.and_then(|t| start.checked_add(t));
        let mut inner = self.lock();

        loop {
            if inner.closed {
                return Err(Error::PoolClosed(self.config.model_id.clone()));
            }

            let idle = inner.idle_candidates();
            let state = &mut *inner;
            let selection = state
                .scheduler
                .select(&idle, key, |id| binding(&state.instances, id));

            match selection {
                Selection::Pick(id) => {
                    if let Some(instance) = inner.find(id).cloned() {
                        if instance.mark_busy().is_ok() {
                            return Ok(self.hand_out(inner, instance, start));
                        }
                    }
                }
                Selection::NoneIdle if inner.has_room() => {
                    let id = inner.reserve();
                    let workspace = inner.workspace.clone();
                    drop(inner);

                    let instance = self.create_reserved(id, workspace)?;
                    inner = self.admit_created(&instance, key)?;
                    instance.mark_busy()?;
                    return Ok(self.hand_out(inner, instance, start));
                }
                Selection::NoneIdle | Selection::Wait => {}
            }

            inner = match deadline {
                None => self.available.wait(inner).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        inner.counters.timeouts += 1;
                        drop(inner);
                        let waited = start.elapsed();
                        self.metrics.record_timeout();
                        tracing::warn!(
                            model = %self.config.model_id,
                            waited_us = waited.as_micros() as u64,
                            "acquire timed out"
                        );
                        return Err(Error::AcquireTimeout {
                            model_id: self.config.model_id.clone(),
                            waited,
                        });
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
            };
        }
    }

    fn hand_out(
        &self,
        mut inner: MutexGuard<'_, PoolInner>,
        instance: Arc<Instance>,
        start: Instant,
    ) -> InstanceLease<'_> {
        let waited = start.elapsed();
        inner.counters.acquisitions += 1;
        inner.counters.total_wait += waited;
        drop(inner);

        self.metrics.record_wait(waited);
        tracing::debug!(
            model = %self.config.model_id,
            instance = instance.id(),
            waited_us = waited.as_micros() as u64,
            "instance acquired"
        );
        InstanceLease {
            pool: self,
            instance,
        }
    }

    /// Return a lease early. Equivalent to dropping it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the lease came from another pool; it is
    /// still returned to the pool that issued it.
    pub fn release(&self, lease: InstanceLease<'_>) -> Result<()> {
        if !std::ptr::eq(lease.pool, self) {
            return Err(Error::InvalidHandle(format!(
                "lease for '{}' returned to pool '{}'",
                lease.pool.model_id(),
                self.config.model_id
            )));
        }
        drop(lease);
        Ok(())
    }

    fn release_instance(&self, instance: Arc<Instance>) {
        let mut inner = self.lock();
        let status = instance.mark_released();
        let over = inner.closed || inner.instances.len() > inner.max;
        let evicted = if over {
            inner.take(instance.id())
        } else {
            None
        };
        drop(inner);
        self.available.notify_all();

        tracing::debug!(
            model = %self.config.model_id,
            instance = instance.id(),
            status = %status,
            "instance released"
        );
        if let Some(evicted) = evicted {
            self.unload(&[evicted], "released over capacity");
        } else {
            self.publish_states();
        }
    }

    fn unload(&self, evicted: &[Arc<Instance>], reason: &str) {
        if evicted.is_empty() {
            return;
        }
        for instance in evicted {
            instance.mark_unloaded();
            trace_eviction(&self.config.model_id, instance.id(), reason);
        }
        self.metrics.record_evicted(evicted.len());
        self.publish_states();
    }

    fn publish_states(&self) {
        let inner = self.lock();
        let idle = inner.count(InstanceStatus::Idle);
        let busy = inner.count(InstanceStatus::Busy);
        let error = inner.count(InstanceStatus::Error);
        drop(inner);
        self.metrics.record_states(idle, busy, error);
    }

    // -------------------------------------------------------------------------
    // Sizing and eviction
    // -------------------------------------------------------------------------

    /// Change the instance bounds.
    ///
    /// Evicts least recently used idle instances while the pool holds more
    /// than `max`. Busy instances are never evicted here; they are dropped
    /// when released if the pool is still over `max`. Returns the number
    /// evicted.
    pub fn resize(&self, min: usize, max: usize) -> Result<usize> {
        validate_bounds(min, max)?;
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::PoolClosed(self.config.model_id.clone()));
        }
        inner.min = min;
        inner.max = max;

        let excess = inner.instances.len().saturating_sub(max);
        let mut idle: Vec<(Instant, u64)> = inner
            .instances
            .iter()
            .filter(|i| i.is_idle())
            .map(|i| (i.last_used(), i.id()))
            .collect();
        idle.sort();
        let evicted: Vec<Arc<Instance>> = idle
            .into_iter()
            .take(excess)
            .filter_map(|(_, id)| inner.take(id))
            .collect();
        drop(inner);
        // Room may have opened up for waiters.
        self.available.notify_all();

        tracing::info!(model = %self.config.model_id, min, max, evicted = evicted.len(), "instance pool resized");
        self.unload(&evicted, "resize");
        if self.config.preload {
            self.ensure_min()?;
        }
        Ok(evicted.len())
    }

    /// Evict instances idle for longer than `idle_timeout`, oldest first,
    /// never going below `min_instances`. Returns the number evicted.
    ///
    /// Meant to be called periodically by the application.
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut expired: Vec<(Duration, u64)> = inner
            .instances
            .iter()
            .filter(|i| i.is_idle())
            .map(|i| (i.idle_for(now), i.id()))
            .filter(|(idle_for, _)| *idle_for > self.config.idle_timeout)
            .collect();
        expired.sort_by(|a, b| b.cmp(a));

        let removable = inner.instances.len().saturating_sub(inner.min);
        let evicted: Vec<Arc<Instance>> = expired
            .into_iter()
            .take(removable)
            .filter_map(|(_, id)| inner.take(id))
            .collect();
        drop(inner);

        if !evicted.is_empty() {
            self.available.notify_all();
            tracing::debug!(model = %self.config.model_id, evicted = evicted.len(), "idle instances evicted");
        }
        self.unload(&evicted, "idle timeout");
        evicted.len()
    }

    /// Evict instances in `Error` state. Returns the number evicted.
    pub fn remove_failed(&self) -> usize {
        let mut inner = self.lock();
        let failed: Vec<u64> = inner
            .instances
            .iter()
            .filter(|i| i.status() == InstanceStatus::Error)
            .map(|i| i.id())
            .collect();
        let evicted: Vec<Arc<Instance>> = failed.into_iter().filter_map(|id| inner.take(id)).collect();
        drop(inner);

        if !evicted.is_empty() {
            self.available.notify_all();
        }
        self.unload(&evicted, "failed");
        evicted.len()
    }

    /// Pre-create `min_instances` and run `iterations` synthetic inferences
    /// on every idle instance.
    ///
    /// Instances that fail move to `Error` and are counted in the report.
    pub fn warmup(&self, iterations: u32) -> Result<WarmupReport> {
        let start = Instant::now();
        self.ensure_min()?;

        let claimed: Vec<Arc<Instance>> = {
            let inner = self.lock();
            inner
                .instances
                .iter()
                .filter(|i| i.is_idle() && i.mark_busy().is_ok())
                .cloned()
                .collect()
        };

        let mut report = WarmupReport::default();
        for instance in claimed {
            match instance.warmup(iterations) {
                Ok(()) => {
                    report.instances_warmed += 1;
                    report.inferences += u64::from(iterations);
                }
                Err(_) => report.failures += 1,
            }
            self.release_instance(instance);
        }
        report.elapsed = start.elapsed();

        tracing::info!(
            model = %self.config.model_id,
            warmed = report.instances_warmed,
            failures = report.failures,
            elapsed_us = report.elapsed.as_micros() as u64,
            "warm-up complete"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// False if any instance is in `Error` or the memory pool fails its
    /// integrity check.
    pub fn health_check(&self) -> bool {
        let failed = self.lock().count(InstanceStatus::Error);
        if failed > 0 {
            tracing::warn!(model = %self.config.model_id, failed, "unhealthy instances");
            return false;
        }
        self.resources.memory.check_integrity().is_ok()
    }

    /// Pool statistics.
    pub fn get_stats(&self) -> PoolStats {
        let inner = self.lock();
        let infos: Vec<InstanceInfo> = inner.instances.iter().map(|i| i.info()).collect();

        let live_inferences: u64 = infos.iter().map(|i| i.inference_count).sum();
        let weighted: f64 = infos
            .iter()
            .map(|i| i.avg_latency.as_nanos() as f64 * i.inference_count as f64)
            .sum();
        let avg_latency = if live_inferences > 0 {
            Duration::from_nanos((weighted / live_inferences as f64) as u64)
        } else {
            Duration::ZERO
        };

        let private: usize = inner
            .instances
            .iter()
            .filter_map(|i| i.private_memory())
            .map(MemoryHandle::size)
            .sum();
        let weights = inner
            .instances
            .iter()
            .find_map(|i| i.shared_weights())
            .map_or(0, |w| w.handle().size());
        let workspace = inner.workspace.as_ref().map_or(0, MemoryHandle::size);

        let uptime = self.created.elapsed();
        let total_inferences = inner.counters.retired_inferences + live_inferences;
        PoolStats {
            model_id: self.config.model_id.clone(),
            total_instances: infos.len(),
            idle_instances: infos.iter().filter(|i| i.status == InstanceStatus::Idle).count(),
            busy_instances: infos.iter().filter(|i| i.status == InstanceStatus::Busy).count(),
            error_instances: infos.iter().filter(|i| i.status == InstanceStatus::Error).count(),
            pending_instances: inner.pending,
            min_instances: inner.min,
            max_instances: inner.max,
            total_inferences,
            avg_latency,
            throughput: total_inferences as f64 / uptime.as_secs_f64().max(f64::EPSILON),
            memory_bytes: private + weights + workspace,
            acquisitions: inner.counters.acquisitions,
            timeouts: inner.counters.timeouts,
            total_wait: inner.counters.total_wait,
            created: inner.counters.created,
            failed_creations: inner.counters.failed_creations,
            evicted: inner.counters.evicted,
            uptime,
        }
    }

    /// Snapshots of all instances, by id.
    pub fn get_instances(&self) -> Vec<InstanceInfo> {
        self.lock().instances.iter().map(|i| i.info()).collect()
    }

    /// Close the pool.
    ///
    /// Blocked and future `acquire` calls fail with [`Error::PoolClosed`].
    /// Idle and failed instances are unloaded now, leased ones when they are
    /// released. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let ids: Vec<u64> = inner
            .instances
            .iter()
            .filter(|i| i.status() != InstanceStatus::Busy)
            .map(|i| i.id())
            .collect();
        let evicted: Vec<Arc<Instance>> = ids.into_iter().filter_map(|id| inner.take(id)).collect();
        let workspace = inner.workspace.take();
        drop(inner);
        self.available.notify_all();
        drop(workspace);

        tracing::info!(model = %self.config.model_id, "instance pool shut down");
        self.unload(&evicted, "shutdown");
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("InstancePool")
            .field("model_id", &self.config.model_id)
            .field("instances", &inner.instances.len())
            .field("min", &inner.min)
            .field("max", &inner.max)
            .field("closed", &inner.closed)
            .finish()
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive lease on one instance. Dropping it returns the instance.
pub struct InstanceLease<'a> {
    pool: &'a InstancePool,
    instance: Arc<Instance>,
}

impl InstanceLease<'_> {
    /// The leased instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Run one inference on the leased instance.
    ///
    /// An engine failure moves the instance to `Error`; it stays there after
    /// release until [`InstancePool::remove_failed`] evicts it.
    pub fn infer(&self, inputs: &[&[u8]], outputs: &mut Vec<Vec<u8>>) -> Result<Duration> {
        let span = self
            .pool
            .resources
            .tracing
            .instance_span(self.instance.model_id(), self.instance.id());
        let _guard = span.enter();

        let elapsed = self.instance.infer(inputs, outputs)?;
        self.pool.metrics.record_inference(elapsed);
        Ok(elapsed)
    }
}

impl std::ops::Deref for InstanceLease<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for InstanceLease<'_> {
    fn drop(&mut self) {
        self.pool.release_instance(Arc::clone(&self.instance));
    }
}

impl std::fmt::Debug for InstanceLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("model_id", &self.pool.model_id())
            .field("instance", &self.instance.id())
            .finish()
    }
}
