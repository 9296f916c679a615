//! Inference backend abstraction.
//!
//! Backends plug into the instance layer through two traits:
//!
//! - [`EngineFactory`]: creates engines from an [`EngineConfig`]. Factories
//!   are registered by name in a [`BackendRegistry`].
//! - [`InferenceEngine`]: one loaded execution context. Dropping the engine
//!   destroys it.
//!
//! Cistern never interprets model bytes or tensors; both are opaque to it.

mod echo;
mod registry;

pub use echo::{EchoBackend, EchoEngine, EchoModel};
pub use registry::{BackendId, BackendRegistry};

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors reported by inference backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be created.
    #[error("engine creation failed: {0}")]
    Create(String),

    /// The model could not be loaded into the engine.
    #[error("model load failed: {0}")]
    Load(String),

    /// `infer` was called before a model was loaded.
    #[error("no model loaded")]
    NotLoaded,

    /// The engine rejected or failed an inference.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The backend cannot consume this kind of model source.
    #[error("unsupported model source: {0}")]
    UnsupportedSource(&'static str),
}

/// Where an engine should load its model from.
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    /// A model file the engine reads itself.
    Path(&'a Path),
    /// Model bytes in host memory (for example shared weights).
    Buffer(&'a [u8]),
    /// Model bytes already resident in device memory.
    Device {
        /// Device address of the first byte.
        address: usize,
        /// Length in bytes.
        len: usize,
    },
}

impl ModelSource<'_> {
    /// Short name of the variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ModelSource::Path(_) => "path",
            ModelSource::Buffer(_) => "buffer",
            ModelSource::Device { .. } => "device",
        }
    }
}

/// Backend-independent engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Device ordinal for accelerator backends.
    pub device_id: u32,
    /// Worker threads the engine may use (0 lets the backend decide).
    pub num_threads: usize,
    /// Backend-specific options.
    pub options: HashMap<String, String>,
}

impl EngineConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device ordinal.
    pub fn with_device(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }

    /// Set the thread count.
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set a backend-specific option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up a backend-specific option.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// One loaded execution context.
///
/// Engines are used by one thread at a time; the instance layer serializes
/// calls with a per-instance lock.
pub trait InferenceEngine: Send {
    /// Load (or replace) the model.
    fn load_model(&mut self, source: ModelSource<'_>) -> Result<(), EngineError>;

    /// Run one inference. `outputs` is cleared and refilled by the engine.
    fn infer(&mut self, inputs: &[&[u8]], outputs: &mut Vec<Vec<u8>>) -> Result<(), EngineError>;

    /// Run a synthetic inference to trigger lazy backend initialization.
    fn warmup(&mut self) -> Result<(), EngineError> {
        let mut outputs = Vec::new();
        self.infer(&[], &mut outputs)
    }
}

/// Creates engines for one backend.
pub trait EngineFactory: Send + Sync {
    /// Name the backend is registered under.
    fn name(&self) -> &str;

    /// Create an engine with no model loaded.
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn InferenceEngine>, EngineError>;
}
