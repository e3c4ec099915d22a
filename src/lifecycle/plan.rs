//! Lifecycle state machine
//!
//! `plan_event` and `plan_pending` are pure: given the persisted flags, what
//! was observed about the host and (for events) the incoming event, they
//! return the actions to run and the flags that hold once every action has
//! succeeded. Nothing is executed here.

use crate::sources::{SourceKind, SourceParams};
use crate::store::{ConfiguredSource, LifecycleFlags, PluginDocument, StatusState, WorkloadStatus};
use std::fmt;

/// Lifecycle events delivered by the surrounding framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// This unit wants the shared agent installed
    Install,
    /// A consumer joined over the host relation
    ConsumerJoined { name: String },
    /// A consumer left the host relation
    ConsumerDeparted { name: String },
    /// A source or destination relation published its connection parameters
    SourceAvailable {
        kind: SourceKind,
        name: String,
        params: SourceParams,
    },
    /// A source or destination relation went away
    SourceGone { kind: SourceKind, name: String },
    /// This unit is being stopped for good and releases its reference
    Stop,
    /// No new event; only settle pending flags and catch the artifact up
    Reconcile,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Install => write!(f, "install"),
            LifecycleEvent::ConsumerJoined { name } => write!(f, "consumer-joined({})", name),
            LifecycleEvent::ConsumerDeparted { name } => write!(f, "consumer-departed({})", name),
            LifecycleEvent::SourceAvailable { kind, name, .. } => {
                write!(f, "source-available({}/{})", kind, name)
            }
            LifecycleEvent::SourceGone { kind, name } => {
                write!(f, "source-gone({}/{})", kind, name)
            }
            LifecycleEvent::Stop => write!(f, "stop"),
            LifecycleEvent::Reconcile => write!(f, "reconcile"),
        }
    }
}

/// Host state read before planning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observed {
    /// The agent package is present on the host
    pub package_installed: bool,
    /// Current reference count, None when no counter document exists
    pub reference_count: Option<u64>,
    /// Registry contents, read only when reconciling
    pub registry: Option<PluginDocument>,
}

/// A single step of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Persist an intermediate status right away
    SetStatus(StatusState, String),
    InstallPackage,
    InitializeRegistry,
    SeedCounter(u64),
    IncrementCounter,
    DecrementCounter,
    AddTag(String),
    RemoveTag(String),
    /// Render the relation's fragment and store it in the registry
    AddPlugin {
        kind: SourceKind,
        name: String,
        params: SourceParams,
    },
    RemovePlugin {
        kind: SourceKind,
        name: String,
    },
    Synchronize,
    RemovePackage,
    /// Delete the registry, the counter and the rendered configuration
    DestroyState,
    /// Restart the agent and require it to be running afterwards
    RestartService,
}

/// Planned actions and the flags that result if all of them succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub name: &'static str,
    pub actions: Vec<Action>,
    pub flags: LifecycleFlags,
}

impl Transition {
    fn new(name: &'static str, actions: Vec<Action>, flags: LifecycleFlags) -> Self {
        Self {
            name,
            actions,
            flags,
        }
    }
}

/// Whether planning `event` needs to know if the package is installed
pub fn needs_package_state(flags: &LifecycleFlags, event: Option<&LifecycleEvent>) -> bool {
    flags.pending_removal || (!flags.installed && matches!(event, Some(LifecycleEvent::Install)))
}

/// Whether planning needs the current reference count
pub fn needs_reference_count(flags: &LifecycleFlags, event: Option<&LifecycleEvent>) -> bool {
    flags.check_teardown || (!flags.installed && matches!(event, Some(LifecycleEvent::Install)))
}

/// Whether planning needs the registry contents
pub fn needs_registry(flags: &LifecycleFlags, event: Option<&LifecycleEvent>) -> bool {
    flags.installed && matches!(event, Some(LifecycleEvent::Reconcile))
}

/// Plan the transition for an incoming event.
///
/// Returns None when the event's precondition does not hold, which includes
/// re-delivery of an event that was already applied.
pub fn plan_event(
    flags: &LifecycleFlags,
    observed: &Observed,
    event: &LifecycleEvent,
) -> Option<Transition> {
    let mut next = flags.clone();

    match event {
        LifecycleEvent::Install => {
            if flags.installed {
                return None;
            }
            next.installed = true;

            if observed.package_installed {
                // Another unit already installed the shared agent
                let actions = match observed.reference_count {
                    Some(_) => vec![Action::IncrementCounter, Action::InitializeRegistry],
                    None => vec![Action::InitializeRegistry, Action::SeedCounter(1)],
                };
                next.status =
                    WorkloadStatus::new(StatusState::Active, "Using shared Telegraf installation.");
                Some(Transition::new("join-shared-installation", actions, next))
            } else {
                next.needs_restart = true;
                next.status = WorkloadStatus::new(StatusState::Maintenance, "Telegraf installed.");
                Some(Transition::new(
                    "install",
                    vec![
                        Action::SetStatus(StatusState::Maintenance, "Installing Telegraf...".into()),
                        Action::InstallPackage,
                        Action::InitializeRegistry,
                        Action::SeedCounter(1),
                    ],
                    next,
                ))
            }
        }

        LifecycleEvent::ConsumerJoined { name } => {
            if !flags.installed || flags.joined.contains(name) {
                return None;
            }
            next.joined.insert(name.clone());
            next.needs_restart = true;
            Some(Transition::new(
                "consumer-joined",
                vec![Action::AddTag(name.clone()), Action::Synchronize],
                next,
            ))
        }

        LifecycleEvent::ConsumerDeparted { name } => {
            if !flags.installed || !flags.joined.contains(name) {
                return None;
            }
            next.joined.remove(name);
            next.check_teardown = true;
            Some(Transition::new(
                "consumer-departed",
                vec![
                    Action::RemoveTag(name.clone()),
                    Action::Synchronize,
                    Action::DecrementCounter,
                ],
                next,
            ))
        }

        LifecycleEvent::SourceAvailable { kind, name, params } => {
            if !flags.installed || flags.is_configured(*kind, name) {
                return None;
            }
            next.mark_configured(*kind, name);
            next.needs_restart = true;
            Some(Transition::new(
                "source-available",
                vec![
                    Action::AddPlugin {
                        kind: *kind,
                        name: name.clone(),
                        params: params.clone(),
                    },
                    Action::Synchronize,
                ],
                next,
            ))
        }

        LifecycleEvent::SourceGone { kind, name } => {
            if !flags.is_configured(*kind, name) {
                return None;
            }
            next.clear_configured(*kind, name);
            next.check_teardown = true;
            Some(Transition::new(
                "source-gone",
                vec![
                    Action::RemovePlugin {
                        kind: *kind,
                        name: name.clone(),
                    },
                    Action::Synchronize,
                    Action::DecrementCounter,
                ],
                next,
            ))
        }

        LifecycleEvent::Stop => {
            if !flags.installed {
                return None;
            }
            next.installed = false;
            next.needs_restart = false;
            next.check_teardown = true;
            next.status = WorkloadStatus::new(StatusState::Maintenance, "Unit stopping.");
            Some(Transition::new(
                "stop",
                vec![Action::DecrementCounter],
                next,
            ))
        }

        LifecycleEvent::Reconcile => {
            if !flags.installed {
                return None;
            }

            // A departure or source loss that failed after its registry edit
            // left the guard set; finish releasing those references.
            let (stale_consumers, stale_sources) = match &observed.registry {
                Some(registry) => stale_guards(flags, registry),
                None => (Vec::new(), Vec::new()),
            };
            if stale_consumers.is_empty() && stale_sources.is_empty() {
                return Some(Transition::new(
                    "resynchronize",
                    vec![Action::Synchronize],
                    next,
                ));
            }

            let mut actions = vec![Action::Synchronize];
            for name in &stale_consumers {
                next.joined.remove(name);
                actions.push(Action::DecrementCounter);
            }
            for source in &stale_sources {
                next.clear_configured(source.kind, &source.name);
                actions.push(Action::DecrementCounter);
            }
            next.check_teardown = true;
            Some(Transition::new("release-stale", actions, next))
        }
    }
}

/// Guards naming consumers or sources the registry no longer holds
fn stale_guards(
    flags: &LifecycleFlags,
    registry: &PluginDocument,
) -> (Vec<String>, Vec<ConfiguredSource>) {
    let consumers = flags
        .joined
        .iter()
        .filter(|name| !registry.tags.contains(name))
        .cloned()
        .collect();
    let sources = flags
        .configured
        .iter()
        .filter(|source| {
            !registry
                .collection(source.kind.direction())
                .contains_key(&source.name)
        })
        .cloned()
        .collect();
    (consumers, sources)
}

/// Plan the next flag-driven transition, checked in the order
/// check-teardown, remove, restart
pub fn plan_pending(flags: &LifecycleFlags, observed: &Observed) -> Option<Transition> {
    let mut next = flags.clone();

    if flags.check_teardown {
        next.check_teardown = false;
        let name = if observed.reference_count == Some(0) {
            next.pending_removal = true;
            "schedule-removal"
        } else {
            "keep-installation"
        };
        return Some(Transition::new(name, Vec::new(), next));
    }

    if flags.pending_removal {
        let mut actions = vec![Action::SetStatus(
            StatusState::Maintenance,
            "Removing Telegraf...".into(),
        )];
        if observed.package_installed {
            actions.push(Action::RemovePackage);
        }
        actions.push(Action::DestroyState);

        let cleared = LifecycleFlags {
            status: WorkloadStatus::new(StatusState::Waiting, "Telegraf removed."),
            ..Default::default()
        };
        return Some(Transition::new("remove", actions, cleared));
    }

    if flags.installed && flags.needs_restart {
        next.needs_restart = false;
        next.status = WorkloadStatus::new(StatusState::Active, "Telegraf is running.");
        return Some(Transition::new(
            "restart",
            vec![Action::RestartService],
            next,
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> LifecycleFlags {
        LifecycleFlags {
            installed: true,
            ..Default::default()
        }
    }

    fn available(name: &str) -> LifecycleEvent {
        LifecycleEvent::SourceAvailable {
            kind: SourceKind::MongodbInput,
            name: name.to_string(),
            params: SourceParams::new("h", 27017),
        }
    }

    #[test]
    fn test_fresh_install() {
        let observed = Observed::default();
        let transition =
            plan_event(&LifecycleFlags::default(), &observed, &LifecycleEvent::Install).unwrap();

        assert_eq!(transition.name, "install");
        assert!(transition.actions.contains(&Action::InstallPackage));
        assert!(transition.actions.contains(&Action::SeedCounter(1)));
        assert!(!transition.actions.contains(&Action::IncrementCounter));
        assert!(transition.flags.installed);
        assert!(transition.flags.needs_restart);
    }

    #[test]
    fn test_install_reuses_shared_installation() {
        let observed = Observed {
            package_installed: true,
            reference_count: Some(2),
            ..Default::default()
        };
        let transition =
            plan_event(&LifecycleFlags::default(), &observed, &LifecycleEvent::Install).unwrap();

        assert_eq!(
            transition.actions,
            vec![Action::IncrementCounter, Action::InitializeRegistry]
        );
        assert!(transition.flags.installed);
        assert!(!transition.flags.needs_restart);
    }

    #[test]
    fn test_install_adopts_package_without_counter() {
        let observed = Observed {
            package_installed: true,
            reference_count: None,
            ..Default::default()
        };
        let transition =
            plan_event(&LifecycleFlags::default(), &observed, &LifecycleEvent::Install).unwrap();

        assert_eq!(
            transition.actions,
            vec![Action::InitializeRegistry, Action::SeedCounter(1)]
        );
    }

    #[test]
    fn test_install_is_idempotent() {
        assert!(plan_event(&installed(), &Observed::default(), &LifecycleEvent::Install).is_none());
    }

    #[test]
    fn test_join_requires_installation() {
        let event = LifecycleEvent::ConsumerJoined {
            name: "app-1".to_string(),
        };
        assert!(plan_event(&LifecycleFlags::default(), &Observed::default(), &event).is_none());

        let transition = plan_event(&installed(), &Observed::default(), &event).unwrap();
        assert_eq!(
            transition.actions,
            vec![Action::AddTag("app-1".to_string()), Action::Synchronize]
        );
        assert!(transition.flags.needs_restart);
        assert!(transition.flags.joined.contains("app-1"));

        // Re-delivery after the join was applied
        assert!(plan_event(&transition.flags, &Observed::default(), &event).is_none());
    }

    #[test]
    fn test_depart_decrements_last_and_checks_teardown() {
        let mut flags = installed();
        flags.joined.insert("app-1".to_string());
        let event = LifecycleEvent::ConsumerDeparted {
            name: "app-1".to_string(),
        };

        let transition = plan_event(&flags, &Observed::default(), &event).unwrap();
        assert_eq!(
            transition.actions,
            vec![
                Action::RemoveTag("app-1".to_string()),
                Action::Synchronize,
                Action::DecrementCounter
            ]
        );
        assert!(transition.flags.check_teardown);
        assert!(transition.flags.joined.is_empty());

        assert!(plan_event(&transition.flags, &Observed::default(), &event).is_none());
    }

    #[test]
    fn test_depart_without_join_is_noop() {
        let event = LifecycleEvent::ConsumerDeparted {
            name: "ghost".to_string(),
        };
        assert!(plan_event(&installed(), &Observed::default(), &event).is_none());
    }

    #[test]
    fn test_source_available_guarded_per_source() {
        let transition = plan_event(&installed(), &Observed::default(), &available("mongodb"))
            .unwrap();
        assert!(transition.flags.is_configured(SourceKind::MongodbInput, "mongodb"));
        assert!(transition.flags.needs_restart);

        let flags = transition.flags;
        assert!(plan_event(&flags, &Observed::default(), &available("mongodb")).is_none());
        assert!(plan_event(&flags, &Observed::default(), &available("mongodb-2")).is_some());
    }

    #[test]
    fn test_source_gone_clears_guard() {
        let mut flags = installed();
        flags.mark_configured(SourceKind::MongodbInput, "mongodb");
        let gone = LifecycleEvent::SourceGone {
            kind: SourceKind::MongodbInput,
            name: "mongodb".to_string(),
        };

        let transition = plan_event(&flags, &Observed::default(), &gone).unwrap();
        assert_eq!(transition.actions.last(), Some(&Action::DecrementCounter));
        assert!(transition.flags.configured.is_empty());
        assert!(transition.flags.check_teardown);

        // The source can be configured again once it reappears
        assert!(plan_event(&transition.flags, &Observed::default(), &available("mongodb")).is_some());
        // And a second "gone" is a no-op
        assert!(plan_event(&transition.flags, &Observed::default(), &gone).is_none());
    }

    #[test]
    fn test_check_teardown_at_zero_schedules_removal() {
        let mut flags = installed();
        flags.check_teardown = true;
        let observed = Observed {
            package_installed: true,
            reference_count: Some(0),
            ..Default::default()
        };

        let transition = plan_pending(&flags, &observed).unwrap();
        assert_eq!(transition.name, "schedule-removal");
        assert!(transition.flags.pending_removal);
        assert!(!transition.flags.check_teardown);
    }

    #[test]
    fn test_check_teardown_at_one_keeps_installation() {
        let mut flags = installed();
        flags.check_teardown = true;
        let observed = Observed {
            package_installed: true,
            reference_count: Some(1),
            ..Default::default()
        };

        let transition = plan_pending(&flags, &observed).unwrap();
        assert_eq!(transition.name, "keep-installation");
        assert!(!transition.flags.pending_removal);
        assert!(!transition.flags.check_teardown);
    }

    #[test]
    fn test_removal_clears_all_flags() {
        let mut flags = installed();
        flags.pending_removal = true;
        flags.needs_restart = true;
        flags.mark_configured(SourceKind::InfluxdbOutput, "influxdb");
        let observed = Observed {
            package_installed: true,
            reference_count: Some(0),
            ..Default::default()
        };

        let transition = plan_pending(&flags, &observed).unwrap();
        assert!(transition.actions.contains(&Action::RemovePackage));
        assert_eq!(transition.actions.last(), Some(&Action::DestroyState));
        assert!(!transition.flags.installed);
        assert!(!transition.flags.pending_removal);
        assert!(!transition.flags.needs_restart);
        assert!(transition.flags.configured.is_empty());
    }

    #[test]
    fn test_removal_skips_absent_package() {
        let flags = LifecycleFlags {
            pending_removal: true,
            ..Default::default()
        };
        let transition = plan_pending(&flags, &Observed::default()).unwrap();
        assert!(!transition.actions.contains(&Action::RemovePackage));
    }

    #[test]
    fn test_restart_only_when_installed() {
        let mut flags = LifecycleFlags {
            needs_restart: true,
            ..Default::default()
        };
        assert!(plan_pending(&flags, &Observed::default()).is_none());

        flags.installed = true;
        let transition = plan_pending(&flags, &Observed::default()).unwrap();
        assert_eq!(transition.actions, vec![Action::RestartService]);
        assert!(!transition.flags.needs_restart);
        assert_eq!(transition.flags.status.state, StatusState::Active);
    }

    #[test]
    fn test_nothing_pending() {
        assert!(plan_pending(&installed(), &Observed::default()).is_none());
    }

    #[test]
    fn test_stop_releases_reference() {
        let transition = plan_event(&installed(), &Observed::default(), &LifecycleEvent::Stop)
            .unwrap();
        assert_eq!(transition.actions, vec![Action::DecrementCounter]);
        assert!(!transition.flags.installed);
        assert!(transition.flags.check_teardown);

        assert!(plan_event(&transition.flags, &Observed::default(), &LifecycleEvent::Stop).is_none());
    }

    #[test]
    fn test_observation_needs() {
        let flags = LifecycleFlags::default();
        assert!(needs_package_state(&flags, Some(&LifecycleEvent::Install)));
        assert!(!needs_package_state(&flags, Some(&LifecycleEvent::Reconcile)));
        assert!(!needs_reference_count(&installed(), None));

        let flags = LifecycleFlags {
            check_teardown: true,
            ..Default::default()
        };
        assert!(needs_reference_count(&flags, None));
    }

    #[test]
    fn test_reconcile_resynchronizes_consistent_state() {
        let mut flags = installed();
        flags.joined.insert("app-1".to_string());
        let mut registry = PluginDocument::default();
        registry.tags.push("app-1".to_string());
        let observed = Observed {
            registry: Some(registry),
            ..Default::default()
        };

        let transition = plan_event(&flags, &observed, &LifecycleEvent::Reconcile).unwrap();
        assert_eq!(transition.name, "resynchronize");
        assert_eq!(transition.actions, vec![Action::Synchronize]);
        assert_eq!(transition.flags, flags);
    }

    #[test]
    fn test_reconcile_releases_guards_missing_from_registry() {
        // Departure of app-1 and loss of mongodb both stopped after the
        // registry edit, before the flags were saved
        let mut flags = installed();
        flags.joined.insert("app-1".to_string());
        flags.joined.insert("app-2".to_string());
        flags.mark_configured(SourceKind::MongodbInput, "mongodb");
        flags.mark_configured(SourceKind::InfluxdbOutput, "influxdb");

        let mut registry = PluginDocument::default();
        registry.tags.push("app-2".to_string());
        registry
            .output
            .insert("influxdb".to_string(), "[[outputs.influxdb]]".to_string());
        let observed = Observed {
            registry: Some(registry),
            ..Default::default()
        };

        let transition = plan_event(&flags, &observed, &LifecycleEvent::Reconcile).unwrap();
        assert_eq!(transition.name, "release-stale");
        assert_eq!(
            transition.actions,
            vec![
                Action::Synchronize,
                Action::DecrementCounter,
                Action::DecrementCounter
            ]
        );
        assert!(transition.flags.check_teardown);
        assert!(!transition.flags.joined.contains("app-1"));
        assert!(transition.flags.joined.contains("app-2"));
        assert!(!transition.flags.is_configured(SourceKind::MongodbInput, "mongodb"));
        assert!(transition.flags.is_configured(SourceKind::InfluxdbOutput, "influxdb"));

        // Once released, the same registry no longer yields stale guards
        let observed = Observed {
            registry: observed.registry,
            ..Default::default()
        };
        let again = plan_event(&transition.flags, &observed, &LifecycleEvent::Reconcile).unwrap();
        assert_eq!(again.name, "resynchronize");
    }

    #[test]
    fn test_reconcile_without_registry_only_resynchronizes() {
        let mut flags = installed();
        flags.joined.insert("app-1".to_string());
        let transition =
            plan_event(&flags, &Observed::default(), &LifecycleEvent::Reconcile).unwrap();
        assert_eq!(transition.name, "resynchronize");
        assert!(!needs_registry(&LifecycleFlags::default(), Some(&LifecycleEvent::Reconcile)));
        assert!(needs_registry(&flags, Some(&LifecycleEvent::Reconcile)));
        assert!(!needs_registry(&flags, None));
    }
}
