//! Server configuration file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thinclone_common::{ThincloneError, ThincloneResult, ThinclonePaths};
use thinclone_pool::{PoolConfig, RefreshConfig};
use thinclone_provision::ProvisionConfig;

/// Contents of `server.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    /// Pool discovery.
    pub pool_manager: PoolConfig,
    /// Session provisioning.
    pub provision: ProvisionConfig,
    /// Full refresh of idle pools.
    pub refresh: RefreshConfig,
}

impl AppConfig {
    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        ThinclonePaths::new().server_config()
    }

    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed YAML.
    pub fn from_yaml(content: &str) -> ThincloneResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> ThincloneResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ThincloneError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns the first section's configuration error.
    pub fn validate(&self) -> ThincloneResult<()> {
        self.pool_manager.validate()?;
        self.provision.validate()
    }
}
