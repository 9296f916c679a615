//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! No exporter or subscriber is installed by the library.
//!
//! Span levels come from [`TracingConfig::level`]. Per-block allocate and free
//! events are opt-in through `MemoryPoolConfig::allocation_events`.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `cistern_memory_allocations` | Counter | Blocks handed out, by pool |
//! | `cistern_memory_frees` | Counter | Blocks returned, by pool |
//! | `cistern_memory_used_bytes` | Gauge | Allocated bytes, by pool |
//! | `cistern_memory_fragmentation` | Gauge | Free / total bytes, by pool |
//! | `cistern_instances_created` | Counter | Instances brought up, by model |
//! | `cistern_instances_evicted` | Counter | Instances torn down, by model |
//! | `cistern_acquire_wait_ns` | Histogram | Time spent in `acquire` |
//! | `cistern_acquire_timeouts` | Counter | `acquire` calls that timed out |
//! | `cistern_inference_time_ns` | Histogram | Engine time per inference |
//! | `cistern_pool_instances` | Gauge | Instances by model and state |
//!
//! ## Example
//!
//! ```rust,ignore
//! use cistern::observability::init_metrics;
//!
//! // Describe metrics once at startup, then install any exporter.
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    InstancePoolMetrics, init_metrics, record_allocation, record_free, record_memory_usage,
    record_pool_instances,
};
pub use tracing_support::{
    TracingConfig, span_instance, span_pool, trace_allocation, trace_eviction, trace_free,
    trace_status_change,
};
