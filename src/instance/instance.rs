//! One loaded execution context.

use super::weights::SharedWeights;
use crate::engine::{EngineError, InferenceEngine, ModelSource};
use crate::error::{Error, Result};
use crate::memory::MemoryHandle;
use crate::observability::trace_status_change;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lifecycle state of an [`Instance`].
///
/// ```text
/// Unloaded -> Loading -> Idle <-> Busy
///                 any -> Error
///        Idle | Error -> Unloaded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    /// No model loaded (new, or torn down).
    Unloaded,
    /// Model is being loaded into the engine.
    Loading,
    /// Ready to be acquired.
    Idle,
    /// Leased to a caller.
    Busy,
    /// Load or inference failed; the instance is not handed out again.
    Error,
}

impl InstanceStatus {
    /// Lowercase name for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unloaded => "unloaded",
            InstanceStatus::Loading => "loading",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Busy => "busy",
            InstanceStatus::Error => "error",
        }
    }

    fn can_become(self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Unloaded, Loading)
                | (Loading, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Unloaded)
                | (Error, Unloaded)
                | (_, Error)
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable bookkeeping, guarded by the instance's own lock.
#[derive(Debug)]
struct InstanceState {
    status: InstanceStatus,
    inference_count: u64,
    failure_count: u64,
    /// Cumulative moving average over successful inferences.
    avg_latency_ns: f64,
    last_used: Instant,
    priority: i32,
    last_error: Option<String>,
}

/// Memory an instance holds for its lifetime.
#[derive(Debug, Default)]
pub(crate) struct InstanceMemory {
    pub private: Option<MemoryHandle>,
    pub weights: Option<SharedWeights>,
    pub workspace: Option<MemoryHandle>,
}

/// One loaded engine plus the memory leases it runs with.
///
/// Instances are created and owned by an
/// [`InstancePool`](super::InstancePool). Dropping the last reference
/// destroys the engine and returns the leases to their memory pools.
pub struct Instance {
    id: u64,
    model_id: String,
    created: Instant,
    state: Mutex<InstanceState>,
    engine: Mutex<Box<dyn InferenceEngine>>,
    memory: InstanceMemory,
}

impl Instance {
    pub(crate) fn new(
        id: u64,
        model_id: &str,
        engine: Box<dyn InferenceEngine>,
        memory: InstanceMemory,
        priority: i32,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            model_id: model_id.to_string(),
            created: now,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Unloaded,
                inference_count: 0,
                failure_count: 0,
                avg_latency_ns: 0.0,
                last_used: now,
                priority,
                last_error: None,
            }),
            engine: Mutex::new(engine),
            memory,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_engine(&self) -> MutexGuard<'_, Box<dyn InferenceEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut InstanceState, to: InstanceStatus) -> Result<()> {
        let from = state.status;
        if !from.can_become(to) {
            return Err(Error::InvalidHandle(format!(
                "instance {} of '{}' cannot go from {} to {}",
                self.id, self.model_id, from, to
            )));
        }
        state.status = to;
        trace_status_change(&self.model_id, self.id, from.as_str(), to.as_str());
        Ok(())
    }

    /// Pool-assigned id, unique within the pool and increasing in creation order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Model served by this instance.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Current status.
    pub fn status(&self) -> InstanceStatus {
        self.lock_state().status
    }

    /// Scheduling priority (higher wins under the priority strategy).
    pub fn priority(&self) -> i32 {
        self.lock_state().priority
    }

    /// Change the scheduling priority.
    pub fn set_priority(&self, priority: i32) {
        self.lock_state().priority = priority;
    }

    /// Successful inferences run so far.
    pub fn inference_count(&self) -> u64 {
        self.lock_state().inference_count
    }

    /// Average latency of successful inferences.
    pub fn avg_latency(&self) -> Duration {
        Duration::from_nanos(self.lock_state().avg_latency_ns as u64)
    }

    /// When the instance was last released or used.
    pub fn last_used(&self) -> Instant {
        self.lock_state().last_used
    }

    /// When the instance was created.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Private scratch memory, if the pool allocated any.
    pub fn private_memory(&self) -> Option<&MemoryHandle> {
        self.memory.private.as_ref()
    }

    /// Shared weights lease, if weights are shared.
    pub fn shared_weights(&self) -> Option<&SharedWeights> {
        self.memory.weights.as_ref()
    }

    /// Pool-wide workspace, if memory is shared.
    pub fn workspace(&self) -> Option<&MemoryHandle> {
        self.memory.workspace.as_ref()
    }

    /// Bytes of memory leases held by this instance.
    ///
    /// Shared leases are counted in full for every instance holding them.
    pub fn memory_usage(&self) -> usize {
        let private = self.memory.private.as_ref().map_or(0, MemoryHandle::size);
        let weights = self.memory.weights.as_ref().map_or(0, |w| w.handle().size());
        let workspace = self.memory.workspace.as_ref().map_or(0, MemoryHandle::size);
        private + weights + workspace
    }

    /// Point-in-time snapshot.
    pub fn info(&self) -> InstanceInfo {
        let state = self.lock_state();
        InstanceInfo {
            id: self.id,
            model_id: self.model_id.clone(),
            status: state.status,
            inference_count: state.inference_count,
            failure_count: state.failure_count,
            avg_latency: Duration::from_nanos(state.avg_latency_ns as u64),
            idle_for: state.last_used.elapsed(),
            age: self.created.elapsed(),
            priority: state.priority,
            memory_bytes: self.memory_usage(),
            shares_weights: self.memory.weights.is_some(),
            last_error: state.last_error.clone(),
        }
    }

    /// Load the model into the engine.
    ///
    /// Shared weights take precedence over `path`: host weights are passed
    /// as a buffer, device weights by address.
    pub(crate) fn load(&self, path: &Path) -> Result<()> {
        {
            let mut state = self.lock_state();
            self.set_status(&mut state, InstanceStatus::Loading)?;
        }

        let source = match &self.memory.weights {
            Some(weights) => match weights.bytes() {
                Some(bytes) => ModelSource::Buffer(bytes),
                None => ModelSource::Device {
                    address: weights.address(),
                    len: weights.len(),
                },
            },
            None => ModelSource::Path(path),
        };
        let result = self.lock_engine().load_model(source);

        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                state.last_used = Instant::now();
                self.set_status(&mut state, InstanceStatus::Idle)
            }
            Err(e) => {
                self.fail(&mut state, &e);
                Err(e.into())
            }
        }
    }

    fn fail(&self, state: &mut InstanceState, error: &EngineError) {
        state.failure_count += 1;
        state.last_error = Some(error.to_string());
        // Every status may move to Error.
        let _ = self.set_status(state, InstanceStatus::Error);
        tracing::warn!(
            model = %self.model_id,
            instance = self.id,
            error = %error,
            "instance failed"
        );
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.status() == InstanceStatus::Idle
    }

    pub(crate) fn mark_busy(&self) -> Result<()> {
        let mut state = self.lock_state();
        self.set_status(&mut state, InstanceStatus::Busy)
    }

    /// Return a leased instance. Instances that failed while leased stay in
    /// `Error`.
    pub(crate) fn mark_released(&self) -> InstanceStatus {
        let mut state = self.lock_state();
        state.last_used = Instant::now();
        if state.status == InstanceStatus::Busy {
            // Busy -> Idle is always allowed.
            let _ = self.set_status(&mut state, InstanceStatus::Idle);
        }
        state.status
    }

    pub(crate) fn mark_unloaded(&self) {
        let mut state = self.lock_state();
        if state.status == InstanceStatus::Unloaded {
            return;
        }
        if self.set_status(&mut state, InstanceStatus::Unloaded).is_err() {
            tracing::warn!(
                model = %self.model_id,
                instance = self.id,
                status = %state.status,
                "unloading instance in unexpected state"
            );
            state.status = InstanceStatus::Unloaded;
        }
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock_state().last_used)
    }

    /// Scheduling inputs, read under the instance lock.
    pub(crate) fn load_stats(&self) -> (u64, f64, i32) {
        let state = self.lock_state();
        (state.inference_count, state.avg_latency_ns, state.priority)
    }

    /// Run one inference and fold its latency into the statistics.
    ///
    /// The engine lock is held for the call; the bookkeeping lock is not.
    pub(crate) fn infer(&self, inputs: &[&[u8]], outputs: &mut Vec<Vec<u8>>) -> Result<Duration> {
        let start = Instant::now();
        let result = self.lock_engine().infer(inputs, outputs);
        let elapsed = start.elapsed();

        let mut state = self.lock_state();
        state.last_used = Instant::now();
        match result {
            Ok(()) => {
                state.inference_count += 1;
                let n = state.inference_count as f64;
                state.avg_latency_ns += (elapsed.as_nanos() as f64 - state.avg_latency_ns) / n;
                Ok(elapsed)
            }
            Err(e) => {
                self.fail(&mut state, &e);
                Err(e.into())
            }
        }
    }

    /// Run `iterations` synthetic inferences. Not counted in the statistics.
    pub(crate) fn warmup(&self, iterations: u32) -> Result<()> {
        let mut engine = self.lock_engine();
        for _ in 0..iterations {
            if let Err(e) = engine.warmup() {
                drop(engine);
                let mut state = self.lock_state();
                self.fail(&mut state, &e);
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("status", &state.status)
            .field("inference_count", &state.inference_count)
            .finish()
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    /// Instance id.
    pub id: u64,
    /// Model served.
    pub model_id: String,
    /// Status at snapshot time.
    pub status: InstanceStatus,
    /// Successful inferences.
    pub inference_count: u64,
    /// Failed loads, warm-ups and inferences.
    pub failure_count: u64,
    /// Average latency of successful inferences.
    pub avg_latency: Duration,
    /// Time since last use.
    pub idle_for: Duration,
    /// Time since creation.
    pub age: Duration,
    /// Scheduling priority.
    pub priority: i32,
    /// Bytes of memory leases held.
    pub memory_bytes: usize,
    /// Whether the instance borrows shared weights.
    pub shares_weights: bool,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}
