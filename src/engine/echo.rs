//! In-process reference backend.
//!
//! The echo engine copies its inputs to its outputs. It is what tests,
//! benches and examples run against, and a template for real backends.

use super::{EngineConfig, EngineError, EngineFactory, InferenceEngine, ModelSource};
use std::time::Duration;

/// Factory for [`EchoEngine`]s, registered as `"echo"`.
///
/// Recognized [`EngineConfig`] options:
///
/// - `latency_us`: sleep this many microseconds in every inference.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    latency: Option<Duration>,
}

impl EchoBackend {
    /// Backend name.
    pub const NAME: &'static str = "echo";

    /// Create the factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed latency to every inference of every engine.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl EngineFactory for EchoBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create(&self, config: &EngineConfig) -> Result<Box<dyn InferenceEngine>, EngineError> {
        let latency = match config.option("latency_us") {
            Some(value) => {
                let micros: u64 = value
                    .parse()
                    .map_err(|_| EngineError::Create(format!("invalid latency_us '{}'", value)))?;
                Some(Duration::from_micros(micros))
            }
            None => self.latency,
        };
        Ok(Box::new(EchoEngine {
            model: None,
            latency,
        }))
    }
}

/// Model fingerprint kept by a loaded echo engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoModel {
    /// Model size in bytes.
    pub len: usize,
    /// Sum of all model bytes (0 for path and device sources).
    pub checksum: u64,
}

/// Engine that echoes inputs back as outputs.
#[derive(Debug)]
pub struct EchoEngine {
    model: Option<EchoModel>,
    latency: Option<Duration>,
}

impl EchoEngine {
    /// The loaded model, if any.
    pub fn model(&self) -> Option<EchoModel> {
        self.model
    }
}

impl InferenceEngine for EchoEngine {
    fn load_model(&mut self, source: ModelSource<'_>) -> Result<(), EngineError> {
        let model = match source {
            ModelSource::Path(path) => {
                let len = std::fs::metadata(path)
                    .map_err(|e| EngineError::Load(format!("{}: {}", path.display(), e)))?
                    .len() as usize;
                EchoModel { len, checksum: 0 }
            }
            ModelSource::Buffer(bytes) => EchoModel {
                len: bytes.len(),
                checksum: bytes.iter().map(|&b| u64::from(b)).sum(),
            },
            ModelSource::Device { len, .. } => EchoModel { len, checksum: 0 },
        };
        self.model = Some(model);
        Ok(())
    }

    fn infer(&mut self, inputs: &[&[u8]], outputs: &mut Vec<Vec<u8>>) -> Result<(), EngineError> {
        if self.model.is_none() {
            return Err(EngineError::NotLoaded);
        }
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        outputs.clear();
        outputs.extend(inputs.iter().map(|input| input.to_vec()));
        Ok(())
    }
}
