//! Debian package adapter
//!
//! Downloads the pinned Telegraf `.deb` into the install directory and hands
//! it to `dpkg`. Removal purges the package and deletes the download.

use super::{command_succeeds, run_command, PackageManager};
use crate::error::CollaboratorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Where the agent package comes from and where it is cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSource {
    /// Package name known to dpkg
    pub name: String,
    /// Download URL of the package archive
    pub url: String,
    /// Local path the archive is downloaded to
    pub local_path: PathBuf,
}

/// `dpkg`-backed package manager
#[derive(Debug, Clone)]
pub struct DpkgPackageManager {
    package: String,
    client: reqwest::Client,
}

impl DpkgPackageManager {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Download the archive unless it is already cached
    async fn fetch(&self, source: &PackageSource) -> Result<(), CollaboratorError> {
        if source.local_path.is_file() {
            info!("Using cached package {}", source.local_path.display());
            return Ok(());
        }

        let download_err = |source_err| CollaboratorError::Download {
            url: source.url.clone(),
            source: source_err,
        };

        info!("Downloading {}", source.url);
        let bytes = self
            .client
            .get(&source.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(download_err)?
            .bytes()
            .await
            .map_err(download_err)?;

        write_download(&source.local_path, &bytes).await
    }
}

async fn write_download(path: &Path, bytes: &[u8]) -> Result<(), CollaboratorError> {
    let artifact_err = |source| CollaboratorError::Artifact {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(artifact_err)?;
    }

    // Never leave a truncated archive at the final path
    let partial = path.with_extension("part");
    tokio::fs::write(&partial, bytes)
        .await
        .map_err(artifact_err)?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(artifact_err)?;

    Ok(())
}

/// Command checking whether a package is installed
fn get_check_command(package: &str) -> Vec<String> {
    vec!["dpkg".to_string(), "-s".to_string(), package.to_string()]
}

/// Command installing a local archive, keeping existing config files
fn get_install_command(archive: &Path) -> Vec<String> {
    vec![
        "dpkg".to_string(),
        "--force-confdef".to_string(),
        "-i".to_string(),
        archive.display().to_string(),
    ]
}

/// Command purging a package
fn get_purge_command(package: &str) -> Vec<String> {
    vec!["dpkg".to_string(), "-P".to_string(), package.to_string()]
}

#[async_trait::async_trait]
impl PackageManager for DpkgPackageManager {
    async fn is_installed(&self) -> Result<bool, CollaboratorError> {
        command_succeeds(&get_check_command(&self.package)).await
    }

    async fn install(&self, source: &PackageSource) -> Result<(), CollaboratorError> {
        self.fetch(source).await?;
        run_command(&get_install_command(&source.local_path)).await?;
        info!("Installed package {}", source.name);
        Ok(())
    }

    async fn remove(&self, source: &PackageSource) -> Result<(), CollaboratorError> {
        run_command(&get_purge_command(&self.package)).await?;

        match tokio::fs::remove_file(&source.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CollaboratorError::Artifact {
                    path: source.local_path.clone(),
                    source: e,
                })
            }
        }

        info!("Removed package {}", self.package);
        Ok(())
    }
}
