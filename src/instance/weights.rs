//! De-duplicated model weights.
//!
//! The first request for a model path loads the file into a memory pool;
//! later requests get another reference to the same block. The table only
//! keeps [`WeakHandle`]s, so the weights are freed when the last lease
//! drops, and the entry removes itself from the release callback.

use crate::error::{Error, Result};
use crate::memory::{MemoryHandle, MemoryPool, WeakHandle};
use crate::model::ModelLoader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A lease on one model's weights.
///
/// Cloning adds a reference to the same block.
#[derive(Debug, Clone)]
pub struct SharedWeights {
    handle: MemoryHandle,
    len: usize,
    path: Arc<Path>,
}

impl SharedWeights {
    /// The underlying memory lease.
    pub fn handle(&self) -> &MemoryHandle {
        &self.handle
    }

    /// Address of the first weight byte.
    pub fn address(&self) -> usize {
        self.handle.address()
    }

    /// Model size in bytes (the block may be larger).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length model.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The weights, if they live in host memory.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.handle.as_slice().map(|bytes| &bytes[..self.len])
    }

    /// Model path the weights were loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live references to the weights block.
    pub fn ref_count(&self) -> u32 {
        self.handle.ref_count()
    }

    pub(crate) fn into_handle(self) -> MemoryHandle {
        self.handle
    }
}

struct Entry {
    weak: WeakHandle,
    len: usize,
    path: Arc<Path>,
}

type Entries = Arc<Mutex<HashMap<PathBuf, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table of loaded weights, keyed by model path.
pub struct SharedWeightsTable {
    memory: MemoryPool,
    loader: Arc<dyn ModelLoader>,
    entries: Entries,
    loads: AtomicU64,
}

impl SharedWeightsTable {
    /// Create a table that loads with `loader` into `memory`.
    pub fn new(memory: MemoryPool, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            memory,
            loader,
            entries: Arc::new(Mutex::new(HashMap::new())),
            loads: AtomicU64::new(0),
        }
    }

    /// Lease the weights of `path`, loading them on first use.
    ///
    /// The table lock is held across the load so concurrent first requests
    /// for a path load it once.
    pub fn acquire(&self, path: &Path) -> Result<SharedWeights> {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(path).and_then(|entry| {
            entry.weak.upgrade().map(|handle| SharedWeights {
                handle,
                len: entry.len,
                path: Arc::clone(&entry.path),
            })
        }) {
            tracing::debug!(path = %path.display(), refs = existing.ref_count(), "shared weights reused");
            return Ok(existing);
        }

        if !self.memory.memory_type().is_cpu_accessible() {
            return Err(Error::InvalidConfig(format!(
                "cannot load weights into {} memory",
                self.memory.memory_type()
            )));
        }

        let bytes = self.loader.load(path)?;
        let tag = format!("weights:{}", path.display());
        let mut handle = self.memory.allocate(bytes.len(), None, Some(&tag))?;
        handle.write(0, bytes.as_slice())?;

        let path: Arc<Path> = Arc::from(path);
        let weak = handle.downgrade();
        let block = weak.block();
        let table = Arc::downgrade(&self.entries);
        let key = path.to_path_buf();
        handle.on_release(move || {
            if let Some(table) = table.upgrade() {
                let mut entries = lock(&table);
                // A reload may already have replaced the entry.
                if entries.get(&key).is_some_and(|entry| entry.weak.block() == block) {
                    entries.remove(&key);
                }
            }
        });

        entries.insert(
            path.to_path_buf(),
            Entry {
                weak,
                len: bytes.len(),
                path: Arc::clone(&path),
            },
        );
        drop(entries);

        self.loads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            path = %path.display(),
            bytes = bytes.len(),
            address = handle.address(),
            "shared weights loaded"
        );
        Ok(SharedWeights {
            handle,
            len: bytes.len(),
            path,
        })
    }

    /// Drop one lease. Returns true if that freed the weights.
    pub fn release(&self, weights: SharedWeights) -> Result<bool> {
        self.memory.free(weights.into_handle())
    }

    /// Another lease on already loaded weights, without loading.
    pub fn get(&self, path: &Path) -> Option<SharedWeights> {
        let entries = lock(&self.entries);
        let entry = entries.get(path)?;
        let handle = entry.weak.upgrade()?;
        Some(SharedWeights {
            handle,
            len: entry.len,
            path: Arc::clone(&entry.path),
        })
    }

    /// Whether weights for `path` are loaded.
    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.entries)
            .get(path)
            .is_some_and(|entry| entry.weak.is_live())
    }

    /// Number of loaded models.
    pub fn len(&self) -> usize {
        lock(&self.entries).values().filter(|entry| entry.weak.is_live()).count()
    }

    /// Returns true if no weights are loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total loads performed (reuses not counted).
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Memory pool the weights live in.
    pub fn memory(&self) -> &MemoryPool {
        &self.memory
    }
}

impl std::fmt::Debug for SharedWeightsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWeightsTable")
            .field("memory_pool", &self.memory.id())
            .field("loaded", &self.len())
            .field("loads", &self.load_count())
            .finish()
    }
}
