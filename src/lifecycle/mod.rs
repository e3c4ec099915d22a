//! Lifecycle coordinator
//!
//! Turns framework events into transitions over the shared installation.
//! Each invocation loads the flags, plans with [`plan::plan_event`], runs
//! the actions, and only then persists the resulting flags. Afterwards it
//! settles the flag-driven transitions (check teardown, remove, restart)
//! until none applies.
//!
//! A collaborator failure marks the unit blocked and leaves the flags as
//! they were, so the same transition is attempted again on the next pass.

pub mod plan;

pub use plan::{Action, LifecycleEvent, Observed, Transition};

use crate::collaborators::{
    DpkgPackageManager, PackageManager, PackageSource, ServiceSupervisor, SystemServiceSupervisor,
};
use crate::config::StewardConfig;
use crate::error::{CollaboratorError, RenderError, Result, StewardError};
use crate::render::templating::TemplateRenderer;
use crate::render::ConfigSynchronizer;
use crate::store::{
    FlagStore, LifecycleFlags, PluginRegistry, ReferenceCounter, StatusState, WorkloadStatus,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Consumer and source names end up as TOML keys, so they must be bare keys
static NAME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").ok());

/// Reject names that cannot be written into the configuration unquoted
pub fn validate_name(name: &str) -> Result<(), RenderError> {
    if name.is_empty() {
        return Err(RenderError::InvalidName {
            name: name.to_string(),
            reason: "name is empty",
        });
    }
    if !NAME_PATTERN
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
    {
        return Err(RenderError::InvalidName {
            name: name.to_string(),
            reason: "only ASCII letters, digits, '-' and '_' are allowed",
        });
    }
    Ok(())
}

fn validate_event(event: &LifecycleEvent) -> Result<(), RenderError> {
    match event {
        LifecycleEvent::ConsumerJoined { name }
        | LifecycleEvent::ConsumerDeparted { name }
        | LifecycleEvent::SourceAvailable { name, .. }
        | LifecycleEvent::SourceGone { name, .. } => validate_name(name),
        LifecycleEvent::Install | LifecycleEvent::Stop | LifecycleEvent::Reconcile => Ok(()),
    }
}

/// What a single `handle` call did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Names of the transitions that completed, in order
    pub transitions: Vec<&'static str>,
    /// Flags persisted at the end of the call
    pub flags: LifecycleFlags,
}

impl Outcome {
    pub fn applied(&self, name: &str) -> bool {
        self.transitions.iter().any(|t| *t == name)
    }
}

pub struct LifecycleCoordinator {
    registry: PluginRegistry,
    counter: ReferenceCounter,
    flags: FlagStore,
    synchronizer: ConfigSynchronizer,
    renderer: Arc<dyn TemplateRenderer>,
    packages: Arc<dyn PackageManager>,
    services: Arc<dyn ServiceSupervisor>,
    package_source: PackageSource,
    service_name: String,
}

impl LifecycleCoordinator {
    /// Build a coordinator over the paths in `config` with the given collaborators.
    ///
    /// Fails when `config` does not identify the unit whose flags to use.
    pub fn new(
        config: &StewardConfig,
        renderer: Arc<dyn TemplateRenderer>,
        packages: Arc<dyn PackageManager>,
        services: Arc<dyn ServiceSupervisor>,
    ) -> Result<Self> {
        let state_path = config.state_path()?;
        let registry = PluginRegistry::new(&config.registry_file);
        let synchronizer = ConfigSynchronizer::new(
            registry.clone(),
            renderer.clone(),
            config.host_identity(),
            &config.config_file,
        );

        Ok(Self {
            counter: ReferenceCounter::new(&config.counter_file),
            flags: FlagStore::new(state_path),
            registry,
            synchronizer,
            renderer,
            packages,
            services,
            package_source: config.package_source(),
            service_name: config.service_name.clone(),
        })
    }

    /// Build a coordinator using dpkg and the host's init system
    pub fn from_config(config: &StewardConfig) -> Result<Self> {
        let services = match &config.service_manager {
            Some(manager) => SystemServiceSupervisor::new(manager),
            None => SystemServiceSupervisor::detect().unwrap_or_else(|e| {
                warn!("{}; restarts will fail", e);
                SystemServiceSupervisor::new("none")
            }),
        };

        Self::new(
            config,
            Arc::new(config.templates()),
            Arc::new(DpkgPackageManager::new(&config.package.name)),
            Arc::new(services),
        )
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn counter(&self) -> &ReferenceCounter {
        &self.counter
    }

    pub fn flag_store(&self) -> &FlagStore {
        &self.flags
    }

    pub fn synchronizer(&self) -> &ConfigSynchronizer {
        &self.synchronizer
    }

    /// Handle one event and settle the pending transitions it leaves behind
    #[instrument(skip_all, fields(event = %event))]
    pub async fn handle(&self, event: LifecycleEvent) -> Result<Outcome> {
        validate_event(&event)?;

        let mut outcome = Outcome::default();
        let flags = self.flags.load()?;
        let observed = self.observe(&flags, Some(&event)).await?;

        match plan::plan_event(&flags, &observed, &event) {
            Some(transition) => {
                self.execute(transition, &mut outcome).await?;
            }
            None => info!("Nothing to do for {}", event),
        }

        self.settle(&mut outcome).await?;
        outcome.flags = self.flags.load()?;
        Ok(outcome)
    }

    /// Run flag-driven transitions until none applies
    #[instrument(skip_all)]
    async fn settle(&self, outcome: &mut Outcome) -> Result<()> {
        loop {
            let flags = self.flags.load()?;
            let observed = self.observe(&flags, None).await?;

            match plan::plan_pending(&flags, &observed) {
                Some(transition) => self.execute(transition, outcome).await?,
                None => return Ok(()),
            }
        }
    }

    /// Read the host state `plan` needs for these flags and this event
    async fn observe(
        &self,
        flags: &LifecycleFlags,
        event: Option<&LifecycleEvent>,
    ) -> Result<Observed> {
        let mut observed = Observed::default();

        if plan::needs_package_state(flags, event) {
            observed.package_installed = self
                .packages
                .is_installed()
                .await
                .or_else(|e| self.blocked(e))?;
        }
        if plan::needs_reference_count(flags, event) {
            observed.reference_count = self.counter.try_get()?;
        }
        if plan::needs_registry(flags, event) && self.registry.exists() {
            observed.registry = Some(self.registry.snapshot()?);
        }

        debug!("Observed {:?}", observed);
        Ok(observed)
    }

    /// Apply every action, then persist the resulting flags
    async fn execute(&self, transition: Transition, outcome: &mut Outcome) -> Result<()> {
        info!("Running transition {}", transition.name);
        let mut flags = transition.flags;

        for action in &transition.actions {
            debug!("Applying {:?}", action);
            let changed = self.perform(action).await?;
            if changed && flags.installed {
                flags.needs_restart = true;
            }
        }

        self.flags.save(&flags)?;
        outcome.transitions.push(transition.name);
        Ok(())
    }

    /// Run one action. Returns true when the rendered configuration changed.
    async fn perform(&self, action: &Action) -> Result<bool> {
        match action {
            Action::SetStatus(state, message) => {
                self.flags
                    .set_status(WorkloadStatus::new(*state, message.as_str()))?;
            }
            Action::InstallPackage => {
                self.packages
                    .install(&self.package_source)
                    .await
                    .or_else(|e| self.blocked(e))?;
            }
            Action::InitializeRegistry => {
                self.registry.initialize()?;
            }
            Action::SeedCounter(count) => {
                self.counter.seed(*count)?;
            }
            Action::IncrementCounter => {
                let count = self.counter.increment()?;
                info!("Shared installation now has {} references", count);
            }
            Action::DecrementCounter => {
                let decrement = self.counter.decrement()?;
                info!("Shared installation now has {} references", decrement.count);
            }
            Action::AddTag(name) => {
                self.registry.add_tag(name)?;
            }
            Action::RemoveTag(name) => {
                self.registry.remove_tag(name)?;
            }
            Action::AddPlugin { kind, name, params } => {
                let context = kind.context(params)?;
                let fragment = self.renderer.render(kind.template(), &context)?;
                self.registry.add(kind.direction(), name, &fragment)?;
                info!("Configured {} plugin {} ({})", kind.direction(), name, kind);
            }
            Action::RemovePlugin { kind, name } => {
                if self.registry.remove(kind.direction(), name)? {
                    info!("Removed {} plugin {} ({})", kind.direction(), name, kind);
                }
            }
            Action::Synchronize => {
                return Ok(self.synchronizer.synchronize()?.changed());
            }
            Action::RemovePackage => {
                self.packages
                    .remove(&self.package_source)
                    .await
                    .or_else(|e| self.blocked(e))?;
            }
            Action::DestroyState => {
                self.registry.destroy()?;
                self.counter.destroy()?;
                self.synchronizer.remove_artifact()?;
                info!("Removed shared Telegraf state");
            }
            Action::RestartService => {
                self.restart_service().await?;
            }
        }
        Ok(false)
    }

    async fn restart_service(&self) -> Result<()> {
        self.services
            .restart(&self.service_name)
            .await
            .or_else(|e| self.blocked(e))?;

        let running = self
            .services
            .is_running(&self.service_name)
            .await
            .or_else(|e| self.blocked(e))?;

        if running {
            info!("Telegraf is running");
            Ok(())
        } else {
            self.blocked(CollaboratorError::NotRunning(self.service_name.clone()))
        }
    }

    /// Record a collaborator failure as the blocked status and hand it back
    fn blocked<T>(&self, err: CollaboratorError) -> Result<T> {
        let message = match &err {
            CollaboratorError::NotRunning(_) => "Telegraf failed.".to_string(),
            other => other.to_string(),
        };
        error!("{}", err);

        if let Err(e) = self
            .flags
            .set_status(WorkloadStatus::new(StatusState::Blocked, message))
        {
            error!("Could not record blocked status: {}", e);
        }
        Err(StewardError::Collaborator(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("app-1").is_ok());
        assert!(validate_name("mongo_db").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("quote\"d").is_err());
        assert!(validate_name("a.b").is_err());
    }

    #[test]
    fn test_validate_event() {
        assert!(validate_event(&LifecycleEvent::Install).is_ok());
        let event = LifecycleEvent::ConsumerJoined {
            name: "x = 1\n[inputs]".to_string(),
        };
        assert!(matches!(
            validate_event(&event),
            Err(RenderError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_outcome_applied() {
        let outcome = Outcome {
            transitions: vec!["install", "restart"],
            flags: LifecycleFlags::default(),
        };
        assert!(outcome.applied("restart"));
        assert!(!outcome.applied("remove"));
    }
}
