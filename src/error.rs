//! Error types for Cistern.

use crate::engine::EngineError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using Cistern's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cistern operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No free block can satisfy the request, even after growing the pool.
    #[error("memory pool exhausted: requested {requested} bytes, largest free block is {largest_free} bytes")]
    PoolExhausted {
        /// Requested size after alignment rounding.
        requested: usize,
        /// Largest free block at the time of the request.
        largest_free: usize,
    },

    /// Backing memory could not be obtained.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Alignment is not a power of two.
    #[error("invalid alignment: {0} is not a power of two")]
    InvalidAlignment(usize),

    /// The handle no longer refers to a live block (double free, stale lease).
    #[error("invalid memory handle: {0}")]
    InvalidHandle(String),

    /// The handle was issued by a different pool.
    #[error("handle belongs to memory pool {handle_pool}, not pool {pool}")]
    ForeignHandle {
        /// Pool that issued the handle.
        handle_pool: u64,
        /// Pool the handle was presented to.
        pool: u64,
    },

    /// Block bookkeeping no longer partitions the backing region.
    #[error("memory pool integrity violation: {0}")]
    IntegrityViolation(String),

    /// No instance became available before the deadline.
    #[error("no instance of '{model_id}' available after {waited:?}")]
    AcquireTimeout {
        /// Model whose pool was asked.
        model_id: String,
        /// Time spent waiting.
        waited: Duration,
    },

    /// A new instance could not be brought up.
    #[error("failed to create instance of '{model_id}': {reason}")]
    InstanceCreation {
        /// Model whose instance failed.
        model_id: String,
        /// Underlying cause.
        reason: String,
    },

    /// Error reported by an inference backend.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Model bytes could not be read.
    #[error("failed to load model {path}: {reason}")]
    ModelLoad {
        /// Model path that was requested.
        path: PathBuf,
        /// Underlying cause.
        reason: String,
    },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An instance pool for this model already exists.
    #[error("instance pool for '{0}' already exists")]
    PoolExists(String),

    /// No instance pool is registered for this model.
    #[error("no instance pool for '{0}'")]
    PoolNotFound(String),

    /// The instance pool has been shut down.
    #[error("instance pool for '{0}' is shut down")]
    PoolClosed(String),

    /// No backend is registered under this name.
    #[error("no backend registered as '{0}'")]
    BackendNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether the caller can reasonably retry (grow, evict, or wait) and succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. } | Error::AcquireTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let exhausted = Error::PoolExhausted {
            requested: 64,
            largest_free: 32,
        };
        assert!(exhausted.is_recoverable());

        let timeout = Error::AcquireTimeout {
            model_id: "m".into(),
            waited: Duration::from_millis(5),
        };
        assert!(timeout.is_recoverable());

        assert!(!Error::InvalidHandle("double free".into()).is_recoverable());
        assert!(!Error::IntegrityViolation("gap".into()).is_recoverable());
    }

    #[test]
    fn test_engine_error_converts() {
        let err: Error = EngineError::Inference("bad input".into()).into();
        assert!(matches!(err, Error::Engine(_)));
        assert!(err.to_string().contains("bad input"));
    }
}
