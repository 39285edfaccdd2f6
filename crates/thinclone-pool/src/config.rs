//! Pool registry and refresh configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thinclone_common::paths::THINCLONE_MOUNT_DIR;
use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::{ManagerConfig, Pool, PoolMode};

/// LVM volume settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LvmConfig {
    /// Volume group holding the pool volume.
    pub volume_group: Option<String>,
    /// Logical volume holding the pool data.
    pub logical_volume: Option<String>,
}

/// Pool discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Directory scanned for pools.
    pub mount_dir: PathBuf,
    /// Data directory inside each pool.
    pub data_sub_dir: String,
    /// Clone mount directory inside each pool.
    pub clone_sub_dir: String,
    /// Socket directory inside each pool.
    pub socket_sub_dir: String,
    /// Backend technology of the pools.
    pub mode: PoolMode,
    /// Restrict discovery to one pool directory.
    pub selected_pool: Option<String>,
    /// Suffix marking pre-snapshots.
    pub pre_snapshot_suffix: String,
    /// Run backend commands through `sudo`.
    pub use_sudo: bool,
    /// LVM settings, required for `lvm` mode.
    pub lvm: LvmConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mount_dir: THINCLONE_MOUNT_DIR.clone(),
            data_sub_dir: "data".to_string(),
            clone_sub_dir: "clones".to_string(),
            socket_sub_dir: "sockets".to_string(),
            mode: PoolMode::Zfs,
            selected_pool: None,
            pre_snapshot_suffix: "_pre".to_string(),
            use_sudo: false,
            lvm: LvmConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Set the mount directory.
    #[must_use]
    pub fn with_mount_dir(mut self, mount_dir: impl Into<PathBuf>) -> Self {
        self.mount_dir = mount_dir.into();
        self
    }

    /// Restrict discovery to one pool directory.
    #[must_use]
    pub fn with_selected_pool(mut self, dir_name: impl Into<String>) -> Self {
        self.selected_pool = Some(dir_name.into());
        self
    }

    /// Build the pool record for a discovered directory.
    #[must_use]
    pub fn pool(&self, name: impl Into<String>, dir_name: impl Into<String>) -> Pool {
        Pool::new(name, self.mode, &self.mount_dir, dir_name).with_layout(
            &self.data_sub_dir,
            &self.clone_sub_dir,
            &self.socket_sub_dir,
        )
    }

    /// Backend options derived from this configuration.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            pre_snapshot_suffix: self.pre_snapshot_suffix.clone(),
            volume_group: self.lvm.volume_group.clone(),
            logical_volume: self.lvm.logical_volume.clone(),
        }
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::Config`] describing the first problem found.
    pub fn validate(&self) -> ThincloneResult<()> {
        if self.mount_dir.as_os_str().is_empty() {
            return Err(ThincloneError::Config {
                message: "pool mount directory must not be empty".to_string(),
            });
        }

        for (key, value) in [
            ("dataSubDir", &self.data_sub_dir),
            ("cloneSubDir", &self.clone_sub_dir),
            ("socketSubDir", &self.socket_sub_dir),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(ThincloneError::Config {
                    message: format!("{key} must be a single directory name, got {value:?}"),
                });
            }
        }

        if self.mode == PoolMode::Lvm
            && (self.lvm.volume_group.is_none() || self.lvm.logical_volume.is_none())
        {
            return Err(ThincloneError::Config {
                message: "lvm mode requires lvm.volumeGroup and lvm.logicalVolume".to_string(),
            });
        }

        Ok(())
    }
}

/// Full-refresh configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
    /// Number of data snapshots kept per pool.
    pub retention_limit: usize,
    /// Suffix appended to snapshots cut after a refresh.
    pub snapshot_suffix: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            retention_limit: 10,
            snapshot_suffix: String::new(),
        }
    }
}
