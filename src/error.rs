//! Error types for telegraf-steward
//!
//! Storage, rendering and collaborator failures are kept apart so the
//! lifecycle coordinator can decide how each one affects the persisted flags.

pub use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// A persisted document could not be loaded or saved
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document {0} does not exist")]
    Missing(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A template or its context was invalid
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {name} not found")]
    TemplateNotFound { name: String },

    #[error("failed to render template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("failed to read template directory {path}: {source}")]
    TemplateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not resolve the local hostname: {0}")]
    Hostname(String),

    #[error("{kind} relation did not provide {parameter}")]
    MissingParameter {
        kind: String,
        parameter: &'static str,
    },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// The package manager or service supervisor reported a failure
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed with exit code {code}")]
    Command { command: String, code: i32 },

    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to store package at {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no supported service manager found on this host")]
    NoServiceManager,

    #[error("service {0} is not running after restart")]
    NotRunning(String),
}

/// Any failure surfaced by the lifecycle coordinator
#[derive(Debug, Error)]
pub enum StewardError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = StewardError> = std::result::Result<T, E>;
