//! Durable JSON document storage
//!
//! Every persisted piece of state (plugin registry, reference counter,
//! lifecycle flags) is a single JSON document on disk. Documents are never
//! cached: each operation loads the current file, mutates an in-memory copy
//! and writes the whole document back.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so a reader never observes a partially written document.
//! Load-mutate-save cycles additionally hold an exclusive advisory lock on a
//! sidecar `<file>.lock` so two overlapping handler processes cannot
//! interleave.

mod counter;
mod flags;
mod registry;

pub use counter::{Decrement, ReferenceCount, ReferenceCounter};
pub use flags::{ConfiguredSource, FlagStore, LifecycleFlags, StatusState, WorkloadStatus};
pub use registry::{PluginDirection, PluginDocument, PluginRegistry, DEFAULT_REGISTRY_SEED};

use crate::error::StorageError;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A typed JSON document at a fixed path
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    _document: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a store for the document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _document: PhantomData,
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file exists
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the document, failing if it is missing, unreadable or malformed
    pub fn load(&self) -> Result<T, StorageError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::Missing(self.path.clone()))
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the document, treating a missing file as the default document.
    /// A malformed file is still an error.
    pub fn load_or_default(&self) -> Result<T, StorageError>
    where
        T: Default,
    {
        match self.load() {
            Err(StorageError::Missing(_)) => Ok(T::default()),
            other => other,
        }
    }

    /// Overwrite the document atomically
    pub fn save(&self, document: &T) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        document
            .serialize(&mut serializer)
            .map_err(|source| StorageError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        buf.push(b'\n');

        write_atomic(&self.path, &buf)
    }

    /// Load, mutate and save the document as one locked unit.
    ///
    /// The document is only rewritten when the closure actually changed it.
    pub fn update<R, F>(&self, mutate: F) -> Result<R, StorageError>
    where
        T: Clone + PartialEq,
        F: FnOnce(&mut T) -> R,
    {
        let _lock = self.lock()?;

        let mut document = self.load()?;
        let before = document.clone();
        let result = mutate(&mut document);

        if document != before {
            self.save(&document)?;
        } else {
            debug!("{} unchanged, skipping write", self.path.display());
        }

        Ok(result)
    }

    /// Delete the document and its lock file; a missing file is not an error
    pub fn remove(&self) -> Result<(), StorageError> {
        for path in [self.path.clone(), self.lock_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::Write { path, source }),
            }
        }
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take an exclusive advisory lock, released when the file is dropped
    fn lock(&self) -> Result<File, StorageError> {
        let lock_path = self.lock_path();
        ensure_parent(&lock_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| StorageError::Lock {
                path: lock_path.clone(),
                source,
            })?;

        file.lock_exclusive().map_err(|source| StorageError::Lock {
            path: lock_path,
            source,
        })?;

        Ok(file)
    }
}

/// Replace `path` with `contents` without ever exposing a partial file
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let parent = ensure_parent(path)?;
    let write_err = |source| StorageError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut temp = tempfile::NamedTempFile::new_in(&parent).map_err(write_err)?;
    temp.write_all(contents).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}

fn ensure_parent(path: &Path) -> Result<PathBuf, StorageError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    fs::create_dir_all(&parent).map_err(|source| StorageError::Write {
        path: parent.clone(),
        source,
    })?;

    Ok(parent)
}
