//! Reference counter for the shared Telegraf installation
//!
//! Every unit that relies on the host-local agent holds one reference. The
//! installation may only be torn down once the count reaches zero.

use super::JsonStore;
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk shape of the counter: `{"count": n}`.
///
/// The count is unsigned, so a negative value on disk fails to load as a
/// malformed document instead of being silently accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCount {
    pub count: u64,
}

/// Result of a decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decrement {
    /// Count after the decrement
    pub count: u64,
    /// True when the count was already zero and stayed there
    pub clamped: bool,
}

/// Durable consumer count
#[derive(Debug, Clone)]
pub struct ReferenceCounter {
    store: JsonStore<ReferenceCount>,
}

impl ReferenceCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn exists(&self) -> bool {
        self.store.exists()
    }

    /// Current count
    pub fn get(&self) -> Result<u64, StorageError> {
        Ok(self.store.load()?.count)
    }

    /// Current count, or None when no counter document exists yet
    pub fn try_get(&self) -> Result<Option<u64>, StorageError> {
        match self.store.load() {
            Ok(doc) => Ok(Some(doc.count)),
            Err(StorageError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrite the count, creating the document if needed
    pub fn seed(&self, count: u64) -> Result<(), StorageError> {
        self.store.save(&ReferenceCount { count })?;
        debug!("Seeded reference count to {}", count);
        Ok(())
    }

    /// Add one reference and return the new count
    pub fn increment(&self) -> Result<u64, StorageError> {
        let count = self.store.update(|doc| {
            doc.count += 1;
            doc.count
        })?;
        debug!("Reference count incremented to {}", count);
        Ok(count)
    }

    /// Drop one reference.
    ///
    /// The count never goes below zero: decrementing at zero leaves it at zero,
    /// logs a warning and reports `clamped`.
    pub fn decrement(&self) -> Result<Decrement, StorageError> {
        let outcome = self.store.update(|doc| match doc.count.checked_sub(1) {
            Some(count) => {
                doc.count = count;
                Decrement {
                    count,
                    clamped: false,
                }
            }
            None => Decrement {
                count: 0,
                clamped: true,
            },
        })?;

        if outcome.clamped {
            warn!(
                "Reference count in {} is already zero; ignoring decrement",
                self.path().display()
            );
        } else {
            debug!("Reference count decremented to {}", outcome.count);
        }

        Ok(outcome)
    }

    /// Delete the counter document (installation teardown only)
    pub fn destroy(&self) -> Result<(), StorageError> {
        self.store.remove()
    }
}
