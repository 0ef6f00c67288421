use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::loader::layers::{ConfigLayerEntry, ConfigLayerSource, ConfigLayerStack};
use crate::root::ProcwardenConfig;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "PROCWARDEN_CONFIG_PATH";

/// System-wide configuration file, applied beneath any explicit file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/procwarden/procwarden.toml";

/// Loads, merges and validates configuration layers.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ProcwardenConfig,
    config_path: Option<PathBuf>,
    layer_stack: ConfigLayerStack,
}

impl ConfigManager {
    /// Load configuration from the default locations.
    ///
    /// `PROCWARDEN_CONFIG_PATH` (when set and non-blank) must point at an
    /// existing file; the system file is optional.
    pub fn load() -> Result<Self> {
        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            let trimmed = config_path.trim();
            if !trimmed.is_empty() {
                return Self::load_from_file(trimmed).with_context(|| {
                    format!("Failed to load configuration from {CONFIG_PATH_ENV}={trimmed}")
                });
            }
        }

        Self::load_from_paths(Some(Path::new(SYSTEM_CONFIG_PATH)), None)
    }

    /// Load the system layer plus a specific file on top of it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from_paths(Some(Path::new(SYSTEM_CONFIG_PATH)), Some(path.as_ref()))
    }

    /// Load from explicit locations. A missing `system` file is skipped; a
    /// missing `file` is an error.
    pub fn load_from_paths(system: Option<&Path>, file: Option<&Path>) -> Result<Self> {
        let mut layer_stack = ConfigLayerStack::default();

        if let Some(system) = system
            && system.exists()
        {
            match Self::load_toml_from_file(system) {
                Ok(toml) => layer_stack.push(ConfigLayerEntry::new(
                    ConfigLayerSource::System {
                        file: system.to_path_buf(),
                    },
                    toml,
                )),
                Err(err) => {
                    tracing::warn!(path = %system.display(), error = %err, "ignoring unreadable system configuration");
                }
            }
        }

        if let Some(file) = file {
            if !file.exists() {
                bail!("Configuration file not found: {}", file.display());
            }
            let toml = Self::load_toml_from_file(file)?;
            layer_stack.push(ConfigLayerEntry::new(
                ConfigLayerSource::File {
                    file: file.to_path_buf(),
                },
                toml,
            ));
        }

        if layer_stack.is_empty() {
            let config = ProcwardenConfig::default();
            config
                .validate()
                .context("Default configuration failed validation")?;
            return Ok(Self {
                config,
                config_path: None,
                layer_stack,
            });
        }

        let config: ProcwardenConfig = layer_stack
            .effective_config()
            .try_into()
            .context("Failed to deserialize effective configuration")?;

        config
            .validate()
            .context("Configuration failed validation")?;

        let config_path = layer_stack
            .layers()
            .last()
            .map(|layer| layer.source.file().clone());

        tracing::debug!(layers = layer_stack.layers().len(), "configuration loaded");

        Ok(Self {
            config,
            config_path,
            layer_stack,
        })
    }

    fn load_toml_from_file(path: &Path) -> Result<toml::Value> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(value)
    }

    pub fn config(&self) -> &ProcwardenConfig {
        &self.config
    }

    pub fn into_config(self) -> ProcwardenConfig {
        self.config
    }

    /// Highest-precedence file that contributed to the configuration.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn layer_stack(&self) -> &ConfigLayerStack {
        &self.layer_stack
    }
}
