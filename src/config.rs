//! Console configuration
//!
//! Configuration for the `crucible` console host: plugin directories to
//! scan, the capability types the host declares, and line-editor
//! history. Loaded from `~/.crucible/config.yaml` by default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Persist line-editor history between sessions
    #[serde(default = "default_true")]
    pub history: bool,

    /// History file location; defaults to `~/.crucible/history`
    #[serde(default)]
    pub history_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directories scanned for `*.lua` plugin modules at startup
    #[serde(default)]
    pub dirs: Vec<PathBuf>,

    /// Capability types registered before any plugin loads
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<CapabilityDecl>,
}

/// One host capability type declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            history: true,
            history_file: None,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            capabilities: default_capabilities(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_capabilities() -> Vec<CapabilityDecl> {
    vec![CapabilityDecl {
        name: "Activatable".to_string(),
        parent: None,
    }]
}

impl Config {
    /// Load configuration from the default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .context("Failed to get home directory")?;

        Ok(home.join(".crucible").join("config.yaml"))
    }

    /// History file location, honoring the configured override
    pub fn history_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.console.history_file {
            return Ok(path.clone());
        }

        let home = dirs::home_dir()
            .context("Failed to get home directory")?;
        Ok(home.join(".crucible").join("history"))
    }
}
