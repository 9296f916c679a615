//! Registry of inference backends.

use super::{EngineConfig, EngineFactory, InferenceEngine};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Generational id of a registered backend.
///
/// Unregistering a backend bumps its slot's generation, so ids handed out
/// earlier stop resolving even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    factory: Option<Arc<dyn EngineFactory>>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    by_name: HashMap<String, BackendId>,
}

/// Registry of engine factories, keyed by backend name.
///
/// The registry is an ordinary value owned by the application (usually
/// through an [`InstanceManager`](crate::instance::InstanceManager)) and
/// shared with the pools that create engines.
pub struct BackendRegistry {
    inner: RwLock<Inner>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Create a registry with the built-in [`EchoBackend`](super::EchoBackend).
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(super::EchoBackend::new()));
        registry
    }

    /// Register a factory under its name.
    ///
    /// A factory already registered under the same name is replaced and its
    /// id invalidated.
    pub fn register(&self, factory: Arc<dyn EngineFactory>) -> BackendId {
        let name = factory.name().to_string();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(old) = inner.by_name.remove(&name) {
            Self::vacate(&mut inner, old);
        }

        let id = match inner.vacant.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.factory = Some(factory);
                BackendId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot {
                    generation: 0,
                    factory: Some(factory),
                });
                BackendId {
                    index,
                    generation: 0,
                }
            }
        };
        inner.by_name.insert(name.clone(), id);
        tracing::debug!(backend = %name, "backend registered");
        id
    }

    fn vacate(inner: &mut Inner, id: BackendId) {
        if let Some(slot) = inner.slots.get_mut(id.index as usize) {
            if slot.generation == id.generation {
                slot.factory = None;
                slot.generation = slot.generation.wrapping_add(1);
                inner.vacant.push(id.index);
            }
        }
    }

    /// Remove a backend by name.
    ///
    /// Returns true if the backend was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.by_name.remove(name) {
            Some(id) => {
                Self::vacate(&mut inner, id);
                true
            }
            None => false,
        }
    }

    /// Id of the backend registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<BackendId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_name.get(name).copied()
    }

    /// Factory for `id`, if the id is still current.
    pub fn get(&self, id: BackendId) -> Option<Arc<dyn EngineFactory>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.factory.clone())
    }

    /// Factory registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn EngineFactory>> {
        self.lookup(name)
            .and_then(|id| self.get(id))
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    /// Create an engine from the backend registered under `name`.
    pub fn create_engine(&self, name: &str, config: &EngineConfig) -> Result<Box<dyn InferenceEngine>> {
        let factory = self.resolve(name)?;
        Ok(factory.create(config)?)
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Names of all registered backends, sorted.
    pub fn list_backends(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = inner.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list_backends())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EchoBackend, EngineError};

    struct Named(&'static str);

    impl EngineFactory for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn create(&self, _config: &EngineConfig) -> std::result::Result<Box<dyn InferenceEngine>, EngineError> {
            Err(EngineError::Create(format!("{} cannot create engines", self.0)))
        }
    }

    #[test]
    fn test_registry_creation() {
        let registry = BackendRegistry::new();
        assert!(registry.list_backends().is_empty());
        assert!(!registry.has_backend("echo"));
    }

    #[test]
    fn test_with_defaults_has_echo() {
        let registry = BackendRegistry::with_defaults();
        assert_eq!(registry.list_backends(), vec!["echo".to_string()]);
        assert!(registry.create_engine("echo", &EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_resolve_not_found() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.resolve("tensorrt"),
            Err(Error::BackendNotFound(_))
        ));
    }

    #[test]
    fn test_stale_id_after_unregister() {
        let registry = BackendRegistry::new();
        let id = registry.register(Arc::new(Named("a")));
        assert!(registry.get(id).is_some());

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get(id).is_none());

        // Slot reuse must not revive the old id.
        let new_id = registry.register(Arc::new(Named("b")));
        assert_ne!(id, new_id);
        assert!(registry.get(id).is_none());
        assert_eq!(registry.get(new_id).unwrap().name(), "b");
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = BackendRegistry::new();
        let first = registry.register(Arc::new(EchoBackend::new()));
        let second = registry.register(Arc::new(EchoBackend::new()));
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.lookup("echo"), Some(second));
        assert_eq!(registry.list_backends().len(), 1);
    }

    #[test]
    fn test_factory_error_converts() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(Named("broken")));
        let err = registry
            .create_engine("broken", &EngineConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Engine(EngineError::Create(_))));
    }
}
