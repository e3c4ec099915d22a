//! Configuration synchronizer
//!
//! Rebuilds `telegraf.conf` from the plugin registry. Rendering is a pure
//! function of the registry contents and the host identity:
//!
//! - output fragments, ordered by name, separated by one blank line
//! - input fragments, same ordering and separator
//! - one `<tag> = "<tag>_cpu"` line per tag, in join order
//!
//! The artifact is only rewritten when the rendered text differs from what is
//! on disk, so an unchanged registry never causes a needless agent restart.

pub mod templating;

use crate::error::{RenderError, Result, StorageError};
use crate::store::{write_atomic, PluginDocument, PluginRegistry};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use templating::TemplateRenderer;
use tracing::{debug, info};

/// Template the whole agent configuration is rendered from
pub const CONFIG_TEMPLATE: &str = "telegraf.conf";

/// Separator between consecutive fragments of one block
pub const FRAGMENT_SEPARATOR: &str = "\n\n";

/// Where the hostname written into the configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostIdentity {
    /// Ask the operating system
    System,
    /// Use a fixed name
    Fixed(String),
}

impl HostIdentity {
    pub fn resolve(&self) -> Result<String, RenderError> {
        match self {
            HostIdentity::Fixed(name) => Ok(name.clone()),
            HostIdentity::System => hostname::get()
                .map_err(|e| RenderError::Hostname(e.to_string()))?
                .into_string()
                .map_err(|raw| RenderError::Hostname(format!("{:?} is not valid UTF-8", raw))),
        }
    }
}

/// The values substituted into the configuration template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedConfiguration {
    pub hostname: String,
    pub output_block: String,
    pub input_block: String,
    pub tag_block: String,
}

impl RenderedConfiguration {
    /// Assemble the blocks for `registry`
    pub fn from_registry(registry: &PluginDocument, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            output_block: join_fragments(registry.output.values()),
            input_block: join_fragments(registry.input.values()),
            tag_block: registry
                .tags
                .iter()
                .map(|tag| tag_line(tag))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Join fragments in iteration order, dropping trailing whitespace of each
/// and skipping empty ones
pub fn join_fragments<'a>(fragments: impl IntoIterator<Item = &'a String>) -> String {
    fragments
        .into_iter()
        .map(|fragment| fragment.trim_end())
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join(FRAGMENT_SEPARATOR)
}

/// Configuration line assigning a consumer tag to its group
pub fn tag_line(tag: &str) -> String {
    format!("{} = \"{}_cpu\"", tag, tag)
}

/// Result of a synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The artifact already matched the registry
    Unchanged,
    /// The artifact was rewritten; the agent needs a restart
    Updated,
}

impl SyncOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, SyncOutcome::Updated)
    }
}

/// Renders the registry into the configuration artifact
#[derive(Clone)]
pub struct ConfigSynchronizer {
    registry: PluginRegistry,
    renderer: Arc<dyn TemplateRenderer>,
    host: HostIdentity,
    target: PathBuf,
}

impl ConfigSynchronizer {
    pub fn new(
        registry: PluginRegistry,
        renderer: Arc<dyn TemplateRenderer>,
        host: HostIdentity,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            renderer,
            host,
            target: target.into(),
        }
    }

    /// Path of the rendered configuration
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Render the configuration text without touching the artifact
    pub fn render(&self) -> Result<String> {
        let registry = self.registry.snapshot()?;
        let hostname = self.host.resolve()?;
        let configuration = RenderedConfiguration::from_registry(&registry, hostname);

        let context = serde_json::to_value(&configuration).map_err(|source| {
            StorageError::Serialize {
                path: self.target.clone(),
                source,
            }
        })?;

        Ok(self.renderer.render(CONFIG_TEMPLATE, &context)?)
    }

    /// Render and write the artifact if its content changed.
    ///
    /// On a render failure the existing artifact is left untouched.
    pub fn synchronize(&self) -> Result<SyncOutcome> {
        let rendered = self.render()?;

        let current = match fs::read_to_string(&self.target) {
            Ok(current) => Some(current),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                debug!("Could not read {}: {}", self.target.display(), e);
                None
            }
        };

        if current.as_deref() == Some(rendered.as_str()) {
            debug!("{} is up to date", self.target.display());
            return Ok(SyncOutcome::Unchanged);
        }

        write_atomic(&self.target, rendered.as_bytes())?;
        info!("Rendered configuration to {}", self.target.display());
        Ok(SyncOutcome::Updated)
    }

    /// Delete the artifact (installation teardown only)
    pub fn remove_artifact(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Write {
                path: self.target.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::templating::TemplateSet;
    use super::*;
    use crate::error::StewardError;
    use tempfile::TempDir;

    struct FailingRenderer;

    impl TemplateRenderer for FailingRenderer {
        fn render(&self, name: &str, _context: &serde_json::Value) -> Result<String, RenderError> {
            Err(RenderError::TemplateNotFound {
                name: name.to_string(),
            })
        }
    }

    fn setup(temp_dir: &TempDir) -> (PluginRegistry, ConfigSynchronizer) {
        let registry = PluginRegistry::new(temp_dir.path().join("plugins.json"));
        registry.initialize().unwrap();
        let synchronizer = ConfigSynchronizer::new(
            registry.clone(),
            Arc::new(TemplateSet::builtin()),
            HostIdentity::Fixed("node-1".to_string()),
            temp_dir.path().join("telegraf.conf"),
        );
        (registry, synchronizer)
    }

    #[test]
    fn test_join_fragments() {
        let fragments = vec!["A\n".to_string(), "".to_string(), "B".to_string()];
        assert_eq!(join_fragments(&fragments), "A\n\nB");
        assert_eq!(join_fragments(&Vec::<String>::new()), "");
    }

    #[test]
    fn test_tag_line() {
        assert_eq!(tag_line("app-1"), r#"app-1 = "app-1_cpu""#);
    }

    #[test]
    fn test_blocks_are_lexicographic_for_fragments() {
        let mut doc = PluginDocument::default();
        doc.output.insert("b".to_string(), "B".to_string());
        doc.output.insert("a".to_string(), "A".to_string());
        doc.tags = vec!["z".to_string(), "a".to_string()];

        let configuration = RenderedConfiguration::from_registry(&doc, "h");
        assert_eq!(configuration.output_block, "A\n\nB");
        assert_eq!(configuration.input_block, "");
        assert_eq!(configuration.tag_block, "z = \"z_cpu\"\na = \"a_cpu\"");
    }

    #[test]
    fn test_render_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, synchronizer) = setup(&temp_dir);
        registry.add_output("b", "B").unwrap();
        registry.add_output("a", "A").unwrap();

        let first = synchronizer.render().unwrap();
        let second = synchronizer.render().unwrap();

        assert_eq!(first, second);
        let a = first.find("\nA\n").unwrap();
        let b = first.find("\nB\n").unwrap();
        assert!(a < b);
        assert!(first.contains(r#"hostname = "node-1""#));
    }

    #[test]
    fn test_synchronize_writes_only_on_change() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, synchronizer) = setup(&temp_dir);

        assert_eq!(synchronizer.synchronize().unwrap(), SyncOutcome::Updated);
        assert_eq!(synchronizer.synchronize().unwrap(), SyncOutcome::Unchanged);

        registry.add_tag("app-1").unwrap();
        assert_eq!(synchronizer.synchronize().unwrap(), SyncOutcome::Updated);

        let content = fs::read_to_string(synchronizer.target()).unwrap();
        assert!(content.contains("[global_tags]\napp-1 = \"app-1_cpu\""));
    }

    #[test]
    fn test_hand_edits_are_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        let (_registry, synchronizer) = setup(&temp_dir);
        synchronizer.synchronize().unwrap();
        let rendered = fs::read_to_string(synchronizer.target()).unwrap();

        fs::write(synchronizer.target(), "# edited by hand\n").unwrap();

        assert_eq!(synchronizer.synchronize().unwrap(), SyncOutcome::Updated);
        assert_eq!(fs::read_to_string(synchronizer.target()).unwrap(), rendered);
    }

    #[test]
    fn test_render_failure_leaves_artifact_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let (registry, _) = setup(&temp_dir);
        let target = temp_dir.path().join("telegraf.conf");
        fs::write(&target, "previous\n").unwrap();

        let synchronizer = ConfigSynchronizer::new(
            registry,
            Arc::new(FailingRenderer),
            HostIdentity::Fixed("h".to_string()),
            &target,
        );

        let result = synchronizer.synchronize();
        assert!(matches!(result, Err(StewardError::Render(_))));
        assert_eq!(fs::read_to_string(&target).unwrap(), "previous\n");
    }

    #[test]
    fn test_missing_registry_is_a_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let synchronizer = ConfigSynchronizer::new(
            PluginRegistry::new(temp_dir.path().join("absent.json")),
            Arc::new(TemplateSet::builtin()),
            HostIdentity::Fixed("h".to_string()),
            temp_dir.path().join("telegraf.conf"),
        );

        assert!(matches!(
            synchronizer.synchronize(),
            Err(StewardError::Storage(StorageError::Missing(_)))
        ));
        assert!(!synchronizer.target().exists());
    }

    #[test]
    fn test_system_hostname_resolves() {
        let name = HostIdentity::System.resolve().unwrap();
        assert!(!name.is_empty());
    }
}
