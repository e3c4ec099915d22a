//! Service supervisor adapter
//!
//! Restarts the agent and checks whether it is running using whichever init
//! system is available on the host.

use super::{command_succeeds, run_command, ServiceSupervisor};
use crate::error::CollaboratorError;
use std::process::Command;
use tracing::info;

/// Init-system backed supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemServiceSupervisor {
    manager: String,
}

impl SystemServiceSupervisor {
    /// Use an explicit service manager (`systemd`, `sysvinit`, `openrc`, `runit`)
    pub fn new(manager: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
        }
    }

    /// Use the service manager detected on this host
    pub fn detect() -> Result<Self, CollaboratorError> {
        detect_service_manager()
            .map(Self::new)
            .ok_or(CollaboratorError::NoServiceManager)
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }
}

/// Detect the service manager available on the system
fn detect_service_manager() -> Option<String> {
    let managers = [
        ("systemctl", "systemd"),
        ("rc-service", "openrc"),
        ("sv", "runit"),
        ("service", "sysvinit"),
    ];

    for (cmd, name) in managers {
        if Command::new("which")
            .arg(cmd)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
        {
            return Some(name.to_string());
        }
    }

    None
}

/// Get the restart command for a service manager
fn get_restart_command(service: &str, manager: &str) -> Vec<String> {
    match manager {
        "systemd" => vec![
            "systemctl".to_string(),
            "restart".to_string(),
            service.to_string(),
        ],
        "sysvinit" => vec![
            "service".to_string(),
            service.to_string(),
            "restart".to_string(),
        ],
        "openrc" => vec![
            "rc-service".to_string(),
            service.to_string(),
            "restart".to_string(),
        ],
        "runit" => vec![
            "sv".to_string(),
            "restart".to_string(),
            service.to_string(),
        ],
        _ => vec![],
    }
}

/// Get the status command for a service manager
fn get_status_command(service: &str, manager: &str) -> Vec<String> {
    match manager {
        "systemd" => vec![
            "systemctl".to_string(),
            "is-active".to_string(),
            "--quiet".to_string(),
            service.to_string(),
        ],
        "sysvinit" => vec![
            "service".to_string(),
            service.to_string(),
            "status".to_string(),
        ],
        "openrc" => vec![
            "rc-service".to_string(),
            service.to_string(),
            "status".to_string(),
        ],
        "runit" => vec!["sv".to_string(), "status".to_string(), service.to_string()],
        _ => vec![],
    }
}

#[async_trait::async_trait]
impl ServiceSupervisor for SystemServiceSupervisor {
    async fn restart(&self, service: &str) -> Result<(), CollaboratorError> {
        let cmd = get_restart_command(service, &self.manager);
        if cmd.is_empty() {
            return Err(CollaboratorError::NoServiceManager);
        }

        run_command(&cmd).await?;
        info!("Restarted service: {}", service);
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool, CollaboratorError> {
        let cmd = get_status_command(service, &self.manager);
        if cmd.is_empty() {
            return Err(CollaboratorError::NoServiceManager);
        }

        command_succeeds(&cmd).await
    }
}
