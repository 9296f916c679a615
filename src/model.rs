//! Model byte loading.
//!
//! A [`ModelLoader`] turns a model path into raw bytes for the shared-weights
//! table. Loaders do not parse formats; engines interpret the bytes.
//!
//! # Example
//!
//! ```rust,ignore
//! use cistern::model::{FileModelLoader, ModelLoader};
//!
//! let bytes = FileModelLoader::new().load("/models/resnet50.onnx".as_ref())?;
//! println!("{} bytes, mapped: {}", bytes.len(), bytes.is_mapped());
//! ```

use crate::error::{Error, Result};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Source of raw model bytes.
pub trait ModelLoader: Send + Sync {
    /// Read the model at `path`.
    fn load(&self, path: &Path) -> Result<ModelBytes>;
}

enum Repr {
    Mapped { ptr: NonNull<u8>, len: usize },
    Owned(Vec<u8>),
}

/// Raw bytes of one model, either mapped read-only from disk or owned.
pub struct ModelBytes {
    repr: Repr,
    path: PathBuf,
}

impl ModelBytes {
    /// Wrap bytes already in memory.
    pub fn from_vec(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            repr: Repr::Owned(bytes),
            path: path.into(),
        }
    }

    /// The model bytes.
    pub fn as_slice(&self) -> &[u8] {
        match &self.repr {
            // SAFETY: the mapping is read-only, covers len bytes and lives
            // until drop.
            Repr::Mapped { ptr, len } => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) },
            Repr::Owned(bytes) => bytes,
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if there are no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bytes are a file mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self.repr, Repr::Mapped { .. })
    }

    /// Path the bytes were loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ModelBytes {
    fn drop(&mut self) {
        if let Repr::Mapped { ptr, len } = self.repr {
            // SAFETY: created by mmap with this length, not used after drop.
            unsafe {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), len);
            }
        }
    }
}

// SAFETY: the mapping is read-only and private to this value.
unsafe impl Send for ModelBytes {}
unsafe impl Sync for ModelBytes {}

impl std::fmt::Debug for ModelBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBytes")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Loads models from the filesystem with a read-only `mmap`.
#[derive(Debug, Clone, Default)]
pub struct FileModelLoader {
    max_size: Option<usize>,
}

impl FileModelLoader {
    /// Create a loader with no size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse files larger than `bytes`.
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    fn map(&self, path: &Path) -> Result<ModelBytes> {
        let fd = rustix::fs::open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())?;
        let stat = rustix::fs::fstat(&fd)?;
        let len = stat.st_size as usize;

        if len == 0 {
            return Err(Error::ModelLoad {
                path: path.to_path_buf(),
                reason: "file is empty".into(),
            });
        }
        if let Some(max) = self.max_size.filter(|&max| len > max) {
            return Err(Error::ModelLoad {
                path: path.to_path_buf(),
                reason: format!("{} bytes exceeds limit of {} bytes", len, max),
            });
        }

        // SAFETY: fresh read-only private mapping of a file we just opened.
        let raw = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::PRIVATE,
                &fd,
                0,
            )?
        };
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // The mapping stays valid after the fd is closed.
        Ok(ModelBytes {
            repr: Repr::Mapped { ptr, len },
            path: path.to_path_buf(),
        })
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self, path: &Path) -> Result<ModelBytes> {
        self.map(path).map_err(|e| match e {
            Error::ModelLoad { .. } => e,
            other => Error::ModelLoad {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })
    }
}
