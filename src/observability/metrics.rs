//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const MEMORY_ALLOCATIONS: &str = "cistern_memory_allocations";
const MEMORY_FREES: &str = "cistern_memory_frees";
const MEMORY_USED_BYTES: &str = "cistern_memory_used_bytes";
const MEMORY_FRAGMENTATION: &str = "cistern_memory_fragmentation";
const INSTANCES_CREATED: &str = "cistern_instances_created";
const INSTANCES_EVICTED: &str = "cistern_instances_evicted";
const ACQUIRE_WAIT_NS: &str = "cistern_acquire_wait_ns";
const ACQUIRE_TIMEOUTS: &str = "cistern_acquire_timeouts";
const INFERENCE_TIME_NS: &str = "cistern_inference_time_ns";
const POOL_INSTANCES: &str = "cistern_pool_instances";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        MEMORY_ALLOCATIONS,
        Unit::Count,
        "Blocks handed out by memory pools"
    );
    metrics::describe_counter!(
        MEMORY_FREES,
        Unit::Count,
        "Blocks returned to memory pools"
    );
    metrics::describe_gauge!(
        MEMORY_USED_BYTES,
        Unit::Bytes,
        "Bytes currently allocated from a memory pool"
    );
    metrics::describe_gauge!(
        MEMORY_FRAGMENTATION,
        "Free bytes divided by total bytes of a memory pool"
    );
    metrics::describe_counter!(
        INSTANCES_CREATED,
        Unit::Count,
        "Inference instances brought up"
    );
    metrics::describe_counter!(
        INSTANCES_EVICTED,
        Unit::Count,
        "Inference instances torn down"
    );
    metrics::describe_histogram!(
        ACQUIRE_WAIT_NS,
        Unit::Nanoseconds,
        "Time spent waiting in acquire"
    );
    metrics::describe_counter!(
        ACQUIRE_TIMEOUTS,
        Unit::Count,
        "Acquire calls that gave up waiting"
    );
    metrics::describe_histogram!(
        INFERENCE_TIME_NS,
        Unit::Nanoseconds,
        "Duration of a single engine inference"
    );
    metrics::describe_gauge!(
        POOL_INSTANCES,
        Unit::Count,
        "Instances in a pool by state"
    );
}

/// Record a block allocation.
#[inline]
pub fn record_allocation(pool: &str, bytes: usize) {
    counter!(MEMORY_ALLOCATIONS, "pool" => pool.to_string()).increment(1);
    tracing::trace!(pool = %pool, bytes, "allocation recorded");
}

/// Record a block returning to the free list.
#[inline]
pub fn record_free(pool: &str) {
    counter!(MEMORY_FREES, "pool" => pool.to_string()).increment(1);
}

/// Record current usage and fragmentation of a memory pool.
#[inline]
pub fn record_memory_usage(pool: &str, used: usize, fragmentation: f64) {
    gauge!(MEMORY_USED_BYTES, "pool" => pool.to_string()).set(used as f64);
    gauge!(MEMORY_FRAGMENTATION, "pool" => pool.to_string()).set(fragmentation);
}

/// Record per-state instance counts of a pool.
#[inline]
pub fn record_pool_instances(model: &str, idle: usize, busy: usize, error: usize) {
    gauge!(POOL_INSTANCES, "model" => model.to_string(), "state" => "idle").set(idle as f64);
    gauge!(POOL_INSTANCES, "model" => model.to_string(), "state" => "busy").set(busy as f64);
    gauge!(POOL_INSTANCES, "model" => model.to_string(), "state" => "error").set(error as f64);
}

/// Metrics collector for one instance pool.
///
/// Handles are created once with the model label so the hot paths
/// (acquire, inference) avoid rebuilding label sets.
#[derive(Clone)]
pub struct InstancePoolMetrics {
    model: String,
    created: Counter,
    evicted: Counter,
    timeouts: Counter,
    acquire_wait: Histogram,
    inference_time: Histogram,
}

impl InstancePoolMetrics {
    /// Create a collector labelled with `model`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            created: counter!(INSTANCES_CREATED, "model" => model.to_string()),
            evicted: counter!(INSTANCES_EVICTED, "model" => model.to_string()),
            timeouts: counter!(ACQUIRE_TIMEOUTS, "model" => model.to_string()),
            acquire_wait: histogram!(ACQUIRE_WAIT_NS, "model" => model.to_string()),
            inference_time: histogram!(INFERENCE_TIME_NS, "model" => model.to_string()),
        }
    }

    /// Record an instance brought up.
    #[inline]
    pub fn record_created(&self) {
        self.created.increment(1);
    }

    /// Record instances torn down.
    #[inline]
    pub fn record_evicted(&self, count: usize) {
        self.evicted.increment(count as u64);
    }

    /// Record an acquire that timed out.
    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.increment(1);
    }

    /// Record time spent in acquire.
    #[inline]
    pub fn record_wait(&self, waited: Duration) {
        self.acquire_wait.record(waited.as_nanos() as f64);
    }

    /// Record one inference.
    #[inline]
    pub fn record_inference(&self, duration: Duration) {
        self.inference_time.record(duration.as_nanos() as f64);
    }

    /// Publish per-state instance counts.
    pub fn record_states(&self, idle: usize, busy: usize, error: usize) {
        record_pool_instances(&self.model, idle, busy, error);
    }

    /// Get the model label.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_instance_pool_metrics() {
        let metrics = InstancePoolMetrics::new("resnet");

        metrics.record_created();
        metrics.record_evicted(2);
        metrics.record_timeout();
        metrics.record_wait(Duration::from_micros(50));
        metrics.record_inference(Duration::from_millis(3));
        metrics.record_states(1, 2, 0);

        assert_eq!(metrics.model(), "resnet");
    }

    #[test]
    fn test_global_recording_functions() {
        // No recorder installed: all of these are no-ops.
        record_allocation("cpu", 4096);
        record_free("cpu");
        record_memory_usage("cpu", 4096, 0.5);
        record_pool_instances("resnet", 1, 0, 0);
    }
}
