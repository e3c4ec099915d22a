//! Telegraf Steward - manages one Telegraf installation shared by many consumers
//!
//! Several applications on a host each ask for metrics collection, but only a
//! single Telegraf agent runs. This crate keeps the shared state on disk (the
//! plugin registry, a reference count and per-unit lifecycle flags), renders
//! `telegraf.conf` from it, and installs or removes the agent as consumers come
//! and go.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod render;
pub mod sources;
pub mod store;

pub use config::StewardConfig;
pub use error::{Result, StewardError};
pub use lifecycle::{LifecycleCoordinator, LifecycleEvent, Outcome};
