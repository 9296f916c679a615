//! # Cistern
//!
//! Memory pooling and instance lifecycle management for inference serving.
//!
//! Loaded inference engines are expensive: they hold device memory, compiled
//! kernels and model weights. Cistern keeps them around and hands them out
//! to concurrent requests, one caller per instance at a time.
//!
//! ## Features
//!
//! - **Block allocator**: first-fit, best-fit, worst-fit and buddy placement
//!   over heap, memfd-shared, caller-owned or device memory, with splitting,
//!   coalescing and fragmentation statistics
//! - **RAII leases**: reference-counted [`MemoryHandle`](memory::MemoryHandle)s
//!   return their block when the last clone drops
//! - **Instance pools**: bounded, blocking acquisition with timeouts and
//!   round-robin, least-loaded, random, priority or sticky scheduling
//! - **Shared weights**: one load per model path, shared by every instance
//! - **Observability**: `tracing` spans and events, `metrics` counters
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cistern::prelude::*;
//! use std::time::Duration;
//!
//! let manager = InstanceManager::new(ManagerConfig::default())?;
//! let pool = manager.create_pool(
//!     InstancePoolConfig::new("resnet50", "/models/resnet50.onnx")
//!         .with_instances(1, 4)
//!         .with_share_type(ShareType::Weights),
//! )?;
//!
//! let lease = pool.acquire(Some(Duration::from_millis(100)))?;
//! let mut outputs = Vec::new();
//! lease.infer(&[&input], &mut outputs)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod engine;
pub mod error;
pub mod instance;
pub mod memory;
pub mod model;
pub mod observability;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::engine::{BackendRegistry, EngineConfig, EngineFactory, InferenceEngine, ModelSource};
    pub use crate::error::{Error, Result};
    pub use crate::instance::{
        InstanceLease, InstanceManager, InstancePool, InstancePoolConfig, InstanceStatus, ManagerConfig,
        SchedulingStrategy, ShareType,
    };
    pub use crate::memory::{AllocationStrategy, MemoryHandle, MemoryPool, MemoryPoolConfig, MemoryType};
}

pub use error::{Error, Result};
