//! Provisioner configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thinclone_common::{ThincloneError, ThincloneResult};

/// Range of host ports handed out to sessions, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPoolConfig {
    /// First port of the range.
    pub from: u16,
    /// Last port of the range.
    pub to: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            from: 6000,
            to: 6099,
        }
    }
}

impl PortPoolConfig {
    /// Number of ports in the range.
    #[must_use]
    pub const fn size(&self) -> usize {
        (self.to - self.from) as usize + 1
    }
}

/// Readiness polling of a freshly started instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Seconds between two readiness probes.
    pub interval_secs: u64,
    /// Probes before the instance is declared failed.
    pub max_retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_retries: 200,
        }
    }
}

/// Settings of the session provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisionConfig {
    /// Ports available to sessions.
    pub port_pool: PortPoolConfig,
    /// Database image instances are started from.
    pub image: String,
    /// Extra runtime options, passed as `--<key>=<value>`.
    pub container_config: BTreeMap<String, String>,
    /// Leave passwords of pre-existing login roles untouched.
    pub keep_user_passwords: bool,
    /// Readiness polling.
    pub health_check: HealthCheckConfig,
    /// Role used to prepare the database.
    pub admin_user: String,
    /// Database the admin role connects to.
    pub database: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            port_pool: PortPoolConfig::default(),
            image: "postgres:16-alpine".to_string(),
            container_config: BTreeMap::new(),
            keep_user_passwords: false,
            health_check: HealthCheckConfig::default(),
            admin_user: "postgres".to_string(),
            database: "postgres".to_string(),
        }
    }
}

impl ProvisionConfig {
    /// Use the given port range.
    #[must_use]
    pub const fn with_port_range(mut self, from: u16, to: u16) -> Self {
        self.port_pool = PortPoolConfig { from, to };
        self
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::Config`] describing the first invalid field.
    pub fn validate(&self) -> ThincloneResult<()> {
        let invalid = |message: String| Err(ThincloneError::Config { message });

        if self.port_pool.from == 0 {
            return invalid("portPool.from must be a non-zero port".to_string());
        }
        if self.port_pool.from > self.port_pool.to {
            return invalid(format!(
                "portPool.from ({}) is greater than portPool.to ({})",
                self.port_pool.from, self.port_pool.to
            ));
        }
        if self.image.trim().is_empty() {
            return invalid("image must not be empty".to_string());
        }
        if self.admin_user.is_empty() || self.database.is_empty() {
            return invalid("adminUser and database must not be empty".to_string());
        }
        if self.health_check.max_retries == 0 {
            return invalid("healthCheck.maxRetries must be at least 1".to_string());
        }
        Ok(())
    }
}
