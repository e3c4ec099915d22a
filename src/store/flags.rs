//! Persisted lifecycle flags
//!
//! Each handler invocation is a fresh process, so every flag the coordinator
//! relies on between events lives here rather than in memory.

use super::JsonStore;
use crate::error::StorageError;
use crate::sources::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Operator-facing status of the unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    #[default]
    Unknown,
    /// Installation or removal in progress
    Maintenance,
    /// Agent configured and running
    Active,
    /// A collaborator failed; operator attention or a retry is needed
    Blocked,
    /// Waiting on an event before anything can happen
    Waiting,
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusState::Unknown => "unknown",
            StatusState::Maintenance => "maintenance",
            StatusState::Active => "active",
            StatusState::Blocked => "blocked",
            StatusState::Waiting => "waiting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub state: StatusState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkloadStatus {
    pub fn new(state: StatusState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            updated_at: Some(Utc::now()),
        }
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{}: {}", self.state, self.message)
        }
    }
}

/// Guard recording that a source relation has been rendered into the registry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfiguredSource {
    pub kind: SourceKind,
    pub name: String,
}

/// Typed record of every state flag the lifecycle depends on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleFlags {
    /// This unit holds a reference on the shared installation
    pub installed: bool,
    /// The rendered configuration changed since the last successful restart
    pub needs_restart: bool,
    /// A reference was dropped; the count must be checked against zero
    pub check_teardown: bool,
    /// The count reached zero; the installation must be removed
    pub pending_removal: bool,
    /// Sources currently rendered into the registry
    pub configured: BTreeSet<ConfiguredSource>,
    /// Consumers whose tag has been added and not yet released
    pub joined: BTreeSet<String>,
    pub status: WorkloadStatus,
}

impl LifecycleFlags {
    pub fn is_configured(&self, kind: SourceKind, name: &str) -> bool {
        self.configured.iter().any(|c| c.kind == kind && c.name == name)
    }

    pub fn mark_configured(&mut self, kind: SourceKind, name: &str) {
        self.configured.insert(ConfiguredSource {
            kind,
            name: name.to_string(),
        });
    }

    pub fn clear_configured(&mut self, kind: SourceKind, name: &str) {
        self.configured.retain(|c| !(c.kind == kind && c.name == name));
    }
}

/// Durable store for [`LifecycleFlags`]. A missing document means no event
/// has been handled yet.
#[derive(Debug, Clone)]
pub struct FlagStore {
    store: JsonStore<LifecycleFlags>,
}

impl FlagStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn load(&self) -> Result<LifecycleFlags, StorageError> {
        self.store.load_or_default()
    }

    pub fn save(&self, flags: &LifecycleFlags) -> Result<(), StorageError> {
        self.store.save(flags)
    }

    /// Record a new workload status without touching the other flags
    pub fn set_status(&self, status: WorkloadStatus) -> Result<(), StorageError> {
        if !self.store.exists() {
            self.store.save(&LifecycleFlags::default())?;
        }
        self.store.update(|flags| flags.status = status)
    }
}
