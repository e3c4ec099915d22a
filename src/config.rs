//! Steward configuration
//!
//! Every field has a default matching the stock Telegraf layout, so running
//! without any configuration file manages `/opt/telegraf` and
//! `/etc/telegraf/telegraf.conf`.

use crate::collaborators::PackageSource;
use crate::render::templating::TemplateSet;
use crate::render::HostIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// System-wide configuration file, used when present
pub const SYSTEM_CONFIG_FILE: &str = "/etc/telegraf-steward/steward.yml";

/// Telegraf release installed when nothing else is configured
pub const DEFAULT_PACKAGE_URL: &str =
    "https://dl.influxdata.com/telegraf/releases/telegraf_1.4.5-1_amd64.deb";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unsupported config file format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("no unit name configured; pass --unit or set `unit` in the configuration")]
    MissingUnit,

    #[error("invalid unit name {0:?}")]
    InvalidUnit(String),
}

/// Package to install for the shared agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub name: String,
    pub url: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: "telegraf".to_string(),
            url: DEFAULT_PACKAGE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    /// Directory holding the shared state and the downloaded package
    pub install_dir: PathBuf,
    pub registry_file: PathBuf,
    pub counter_file: PathBuf,
    /// Unit this steward acts for; each unit keeps its own lifecycle flags
    pub unit: Option<String>,
    /// Lifecycle flags of this unit (default: `<install_dir>/units/<unit>.json`)
    pub state_file: Option<PathBuf>,
    /// Rendered Telegraf configuration
    pub config_file: PathBuf,
    /// Directory whose templates override the built-in ones
    pub template_dir: Option<PathBuf>,
    /// Hostname written into the configuration instead of the system one
    pub hostname: Option<String>,
    pub service_name: String,
    /// Service manager to use; detected when unset
    pub service_manager: Option<String>,
    pub package: PackageConfig,
}

impl Default for StewardConfig {
    fn default() -> Self {
        let install_dir = PathBuf::from("/opt/telegraf");
        Self {
            registry_file: install_dir.join("plugins.json"),
            counter_file: install_dir.join("count.json"),
            install_dir,
            unit: None,
            state_file: None,
            config_file: PathBuf::from("/etc/telegraf/telegraf.conf"),
            template_dir: None,
            hostname: None,
            service_name: "telegraf".to_string(),
            service_manager: None,
            package: PackageConfig::default(),
        }
    }
}

impl StewardConfig {
    /// Package source with the archive cached in the install directory
    pub fn package_source(&self) -> PackageSource {
        let file_name = self
            .package
            .url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.deb", self.package.name));

        PackageSource {
            name: self.package.name.clone(),
            url: self.package.url.clone(),
            local_path: self.install_dir.join(file_name),
        }
    }

    /// Path of this unit's lifecycle flags.
    ///
    /// Units sharing an installation must never share flags, so without an
    /// explicit `state_file` a unit name is required.
    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.state_file {
            return Ok(path.clone());
        }

        let unit = self.unit.as_deref().ok_or(ConfigError::MissingUnit)?;
        // Framework unit names look like `telegraf/0`
        let file_stem = unit.replace('/', "-");
        let valid = !file_stem.is_empty()
            && file_stem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !file_stem.starts_with('.');
        if !valid {
            return Err(ConfigError::InvalidUnit(unit.to_string()));
        }

        Ok(self
            .install_dir
            .join("units")
            .join(format!("{}.json", file_stem)))
    }

    pub fn host_identity(&self) -> HostIdentity {
        match &self.hostname {
            Some(name) => HostIdentity::Fixed(name.clone()),
            None => HostIdentity::System,
        }
    }

    pub fn templates(&self) -> TemplateSet {
        match &self.template_dir {
            Some(dir) => TemplateSet::with_dir(dir),
            None => TemplateSet::builtin(),
        }
    }
}

/// Default configuration file location.
///
/// Precedence:
/// 1. System-wide config (`/etc/telegraf-steward/steward.yml`) if it exists
/// 2. User config (`~/.config/telegraf-steward/steward.yml`)
pub fn default_config_path() -> PathBuf {
    let system_config = PathBuf::from(SYSTEM_CONFIG_FILE);
    if system_config.exists() {
        system_config
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("telegraf-steward")
            .join("steward.yml")
    }
}

/// Load the configuration from `path`, or the defaults when the file does
/// not exist. The format follows the file extension.
pub fn load_config(path: &Path) -> Result<StewardConfig, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StewardConfig::default())
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string())),
        Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))
        }
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = StewardConfig::default();
        assert_eq!(config.registry_file, PathBuf::from("/opt/telegraf/plugins.json"));
        assert_eq!(config.counter_file, PathBuf::from("/opt/telegraf/count.json"));
        assert_eq!(config.config_file, PathBuf::from("/etc/telegraf/telegraf.conf"));
        assert_eq!(config.service_name, "telegraf");
        assert_eq!(config.package.url, DEFAULT_PACKAGE_URL);
        assert_eq!(config.host_identity(), HostIdentity::System);
        assert!(matches!(config.state_path(), Err(ConfigError::MissingUnit)));
    }

    #[test]
    fn test_state_path_is_per_unit() {
        let first = StewardConfig {
            unit: Some("telegraf/0".to_string()),
            ..Default::default()
        };
        let second = StewardConfig {
            unit: Some("telegraf/1".to_string()),
            ..Default::default()
        };

        assert_eq!(
            first.state_path().unwrap(),
            PathBuf::from("/opt/telegraf/units/telegraf-0.json")
        );
        assert_ne!(first.state_path().unwrap(), second.state_path().unwrap());
    }

    #[test]
    fn test_state_path_rejects_traversal() {
        for unit in ["", "..", "../etc", "a b"] {
            let config = StewardConfig {
                unit: Some(unit.to_string()),
                ..Default::default()
            };
            assert!(
                matches!(config.state_path(), Err(ConfigError::InvalidUnit(_))),
                "{:?} should be rejected",
                unit
            );
        }
    }

    #[test]
    fn test_explicit_state_file_wins() {
        let config = StewardConfig {
            unit: Some("telegraf/0".to_string()),
            state_file: Some(PathBuf::from("/var/lib/steward/flags.json")),
            ..Default::default()
        };
        assert_eq!(
            config.state_path().unwrap(),
            PathBuf::from("/var/lib/steward/flags.json")
        );
    }

    #[test]
    fn test_package_source_caches_in_install_dir() {
        let source = StewardConfig::default().package_source();
        assert_eq!(source.name, "telegraf");
        assert_eq!(
            source.local_path,
            PathBuf::from("/opt/telegraf/telegraf_1.4.5-1_amd64.deb")
        );
    }

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("steward.yml");

        let yaml_content = r#"
install_dir: /srv/telegraf
registry_file: /srv/telegraf/plugins.json
hostname: node-7
unit: telegraf/3
package:
  url: https://example.com/telegraf_1.5.0_amd64.deb
"#;
        fs::write(&config_path, yaml_content).unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.install_dir, PathBuf::from("/srv/telegraf"));
        assert_eq!(config.registry_file, PathBuf::from("/srv/telegraf/plugins.json"));
        // Unset fields keep their defaults
        assert_eq!(config.counter_file, PathBuf::from("/opt/telegraf/count.json"));
        assert_eq!(config.package.name, "telegraf");
        assert_eq!(
            config.host_identity(),
            HostIdentity::Fixed("node-7".to_string())
        );
        assert_eq!(
            config.package_source().local_path,
            PathBuf::from("/srv/telegraf/telegraf_1.5.0_amd64.deb")
        );
        assert_eq!(
            config.state_path().unwrap(),
            PathBuf::from("/srv/telegraf/units/telegraf-3.json")
        );
    }

    #[test]
    fn test_load_json_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("steward.json");
        fs::write(
            &config_path,
            r#"{"service_name": "telegraf-agent", "service_manager": "systemd"}"#,
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.service_name, "telegraf-agent");
        assert_eq!(config.service_manager.as_deref(), Some("systemd"));
    }

    #[test]
    fn test_load_toml_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("steward.toml");
        fs::write(
            &config_path,
            "config_file = \"/tmp/telegraf.conf\"\n\n[package]\nname = \"telegraf-nightly\"\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.config_file, PathBuf::from("/tmp/telegraf.conf"));
        assert_eq!(config.package.name, "telegraf-nightly");
        assert_eq!(config.package.url, DEFAULT_PACKAGE_URL);
    }

    #[test]
    fn test_load_missing_config_returns_default() {
        let temp_dir = tempdir().unwrap();
        let config = load_config(&temp_dir.path().join("steward.yml")).unwrap();
        assert_eq!(config, StewardConfig::default());
    }

    #[test]
    fn test_invalid_and_unsupported_config() {
        let temp_dir = tempdir().unwrap();

        let bad = temp_dir.path().join("steward.json");
        fs::write(&bad, "{not json").unwrap();
        assert!(matches!(load_config(&bad), Err(ConfigError::Parse { .. })));

        let ini = temp_dir.path().join("steward.ini");
        fs::write(&ini, "a=b").unwrap();
        assert!(matches!(
            load_config(&ini),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_templates_follow_template_dir() {
        let config = StewardConfig {
            template_dir: Some(PathBuf::from("/etc/telegraf-steward/templates")),
            ..Default::default()
        };
        // Built-in templates still resolve through an override directory
        let context = serde_json::json!({"servers": ["mongodb://h:1"]});
        use crate::render::templating::TemplateRenderer;
        assert!(config.templates().render("input-mongodb.conf", &context).is_ok());
    }
}
