//! External collaborators
//!
//! The lifecycle coordinator only sees these traits. The concrete adapters
//! shell out to the host's package manager and init system.

pub mod package;
pub mod service;

pub use package::{DpkgPackageManager, PackageSource};
pub use service::SystemServiceSupervisor;

use crate::error::CollaboratorError;
use tokio::process::Command;
use tracing::debug;

/// Installs and removes the shared agent package
#[async_trait::async_trait]
pub trait PackageManager: Send + Sync {
    /// Whether the agent package is present on the host
    async fn is_installed(&self) -> Result<bool, CollaboratorError>;

    /// Install the agent from `source`
    async fn install(&self, source: &PackageSource) -> Result<(), CollaboratorError>;

    /// Purge the agent and the downloaded package
    async fn remove(&self, source: &PackageSource) -> Result<(), CollaboratorError>;
}

/// Restarts and inspects the agent service
#[async_trait::async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn restart(&self, service: &str) -> Result<(), CollaboratorError>;

    async fn is_running(&self, service: &str) -> Result<bool, CollaboratorError>;
}

/// Run a command and fail on a non-zero exit status
pub(crate) async fn run_command(cmd: &[String]) -> Result<(), CollaboratorError> {
    if cmd.is_empty() {
        return Ok(());
    }

    let command = cmd.join(" ");
    debug!("Running {}", command);

    let status = Command::new(&cmd[0])
        .args(&cmd[1..])
        .status()
        .await
        .map_err(|source| CollaboratorError::Spawn {
            command: command.clone(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(CollaboratorError::Command {
            command,
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Run a command and report whether it exited successfully
pub(crate) async fn command_succeeds(cmd: &[String]) -> Result<bool, CollaboratorError> {
    if cmd.is_empty() {
        return Ok(false);
    }

    let output = Command::new(&cmd[0])
        .args(&cmd[1..])
        .output()
        .await
        .map_err(|source| CollaboratorError::Spawn {
            command: cmd.join(" "),
            source,
        })?;

    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_command_success() {
        assert!(run_command(&cmd(&["true"])).await.is_ok());
        assert!(run_command(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_command_failure_reports_exit_code() {
        let err = run_command(&cmd(&["sh", "-c", "exit 3"])).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Command { code: 3, .. }));
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let err = run_command(&cmd(&["definitely-not-a-real-binary-xyz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_command_succeeds() {
        assert!(command_succeeds(&cmd(&["true"])).await.unwrap());
        assert!(!command_succeeds(&cmd(&["false"])).await.unwrap());
    }
}
