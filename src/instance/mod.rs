//! Pooled inference instances.
//!
//! An [`Instance`] is one engine with its model loaded, plus the memory it
//! runs with. Instances of one model live in an [`InstancePool`], which
//! creates them on demand between `min_instances` and `max_instances` and
//! leases them out one caller at a time. The [`InstanceManager`] owns the
//! memory pools, the backend registry and one pool per model.
//!
//! # Lock order
//!
//! Instance pool lock, then an instance's own lock, then the memory pool
//! lock. Inference runs under the instance's engine lock only, never the
//! pool lock.
//!
//! # Sharing
//!
//! | [`ShareType`] | Weights | Scratch |
//! |---------------|---------|---------|
//! | `None` | loaded per instance | private block per instance |
//! | `Weights` | one [`SharedWeights`] lease | private block per instance |
//! | `Memory` | loaded per instance | one pool-wide workspace |
//! | `Full` | one [`SharedWeights`] lease | one pool-wide workspace |

#[allow(clippy::module_inception)]
mod instance;
mod manager;
mod pool;
mod scheduler;
mod weights;

pub use instance::{Instance, InstanceInfo, InstanceStatus};
pub use manager::{InstanceManager, ManagerConfig};
pub use pool::{
    InstanceLease, InstancePool, InstancePoolConfig, PoolResources, PoolStats, ShareType, WarmupReport,
};
pub use scheduler::SchedulingStrategy;
pub use weights::{SharedWeights, SharedWeightsTable};
