//! Plugin registry
//!
//! Holds the rendered configuration fragment of every input and output plugin,
//! keyed by logical source name, plus the ordered list of consumer tags.
//!
//! ```json
//! {
//!     "input": {"mongodb": "[[inputs.mongodb]]\n  servers = [\"mongodb://10.0.0.4:27017\"]"},
//!     "output": {"influxdb": "[[outputs.influxdb]]\n  urls = [\"http://10.0.0.7:8086\"]"},
//!     "tags": ["app-1", "app-2"]
//! }
//! ```

use super::JsonStore;
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registry document installed when no registry exists yet
pub const DEFAULT_REGISTRY_SEED: &str = include_str!("../../files/plugins.json");

/// Which collection of the registry a plugin belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginDirection {
    Input,
    Output,
}

impl fmt::Display for PluginDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginDirection::Input => write!(f, "input"),
            PluginDirection::Output => write!(f, "output"),
        }
    }
}

/// On-disk shape of the registry.
///
/// Fragments are kept in sorted maps so iteration order is lexicographic by
/// name. Tags keep insertion order. Documents written before tags existed have
/// no `tags` key and load with an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDocument {
    pub input: BTreeMap<String, String>,
    pub output: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PluginDocument {
    /// Fragments of one direction
    pub fn collection(&self, direction: PluginDirection) -> &BTreeMap<String, String> {
        match direction {
            PluginDirection::Input => &self.input,
            PluginDirection::Output => &self.output,
        }
    }

    fn collection_mut(&mut self, direction: PluginDirection) -> &mut BTreeMap<String, String> {
        match direction {
            PluginDirection::Input => &mut self.input,
            PluginDirection::Output => &mut self.output,
        }
    }
}

/// Durable registry of plugin configuration fragments
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    store: JsonStore<PluginDocument>,
}

impl PluginRegistry {
    /// Create a registry backed by the document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    /// Path of the registry document
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Whether the registry document exists
    pub fn exists(&self) -> bool {
        self.store.exists()
    }

    /// Create the registry from the packaged seed if it does not exist yet.
    ///
    /// Returns true when a new document was written.
    pub fn initialize(&self) -> Result<bool, StorageError> {
        if self.store.exists() {
            debug!("Plugin registry already present at {}", self.path().display());
            return Ok(false);
        }

        let seed: PluginDocument =
            serde_json::from_str(DEFAULT_REGISTRY_SEED).map_err(|source| {
                StorageError::Malformed {
                    path: PathBuf::from("files/plugins.json"),
                    source,
                }
            })?;
        self.store.save(&seed)?;
        info!("Created plugin registry at {}", self.path().display());
        Ok(true)
    }

    /// Load the whole registry in one read
    pub fn snapshot(&self) -> Result<PluginDocument, StorageError> {
        self.store.load()
    }

    /// Insert or replace a fragment; the last write wins
    pub fn add(
        &self,
        direction: PluginDirection,
        name: &str,
        fragment: &str,
    ) -> Result<(), StorageError> {
        self.store.update(|doc| {
            doc.collection_mut(direction)
                .insert(name.to_string(), fragment.to_string());
        })?;
        debug!("Registered {} plugin {}", direction, name);
        Ok(())
    }

    /// Remove a fragment. Removing an absent name is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, direction: PluginDirection, name: &str) -> Result<bool, StorageError> {
        let removed = self
            .store
            .update(|doc| doc.collection_mut(direction).remove(name).is_some())?;
        if removed {
            debug!("Removed {} plugin {}", direction, name);
        } else {
            debug!("No {} plugin named {} to remove", direction, name);
        }
        Ok(removed)
    }

    pub fn add_input(&self, name: &str, fragment: &str) -> Result<(), StorageError> {
        self.add(PluginDirection::Input, name, fragment)
    }

    pub fn add_output(&self, name: &str, fragment: &str) -> Result<(), StorageError> {
        self.add(PluginDirection::Output, name, fragment)
    }

    pub fn remove_input(&self, name: &str) -> Result<bool, StorageError> {
        self.remove(PluginDirection::Input, name)
    }

    pub fn remove_output(&self, name: &str) -> Result<bool, StorageError> {
        self.remove(PluginDirection::Output, name)
    }

    /// Append a tag unless it is already present.
    ///
    /// Returns whether the tag was added.
    pub fn add_tag(&self, name: &str) -> Result<bool, StorageError> {
        self.store.update(|doc| {
            if doc.tags.iter().any(|tag| tag == name) {
                false
            } else {
                doc.tags.push(name.to_string());
                true
            }
        })
    }

    /// Remove a tag, preserving the order of the others.
    ///
    /// Returns whether the tag was present.
    pub fn remove_tag(&self, name: &str) -> Result<bool, StorageError> {
        self.store.update(|doc| {
            let before = doc.tags.len();
            doc.tags.retain(|tag| tag != name);
            doc.tags.len() != before
        })
    }

    pub fn inputs(&self) -> Result<BTreeMap<String, String>, StorageError> {
        Ok(self.store.load()?.input)
    }

    pub fn outputs(&self) -> Result<BTreeMap<String, String>, StorageError> {
        Ok(self.store.load()?.output)
    }

    pub fn tags(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.store.load()?.tags)
    }

    /// Delete the registry document (installation teardown only)
    pub fn destroy(&self) -> Result<(), StorageError> {
        self.store.remove()
    }
}
