//! Standard host paths for thinclone.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory under which copy-on-write pools are mounted.
pub static THINCLONE_MOUNT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("THINCLONE_MOUNT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/thinclone"))
});

/// Default configuration directory.
pub static THINCLONE_CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("THINCLONE_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/thinclone"))
});

/// Directory inside a pool's data directory holding thinclone metadata.
pub const METADATA_DIR: &str = ".thinclone";

/// Data marker file name inside [`METADATA_DIR`].
pub const DATA_MARKER_FILE: &str = "dbmarker";

/// Standard host paths.
#[derive(Debug, Clone)]
pub struct ThinclonePaths {
    /// Directory under which pools are mounted (default: /var/lib/thinclone).
    pub mount_dir: PathBuf,
    /// Configuration directory (default: /etc/thinclone).
    pub config_dir: PathBuf,
}

impl ThinclonePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom mount directory.
    #[must_use]
    pub fn with_mount_dir(mount_dir: impl Into<PathBuf>) -> Self {
        Self {
            mount_dir: mount_dir.into(),
            config_dir: THINCLONE_CONFIG_DIR.clone(),
        }
    }

    /// Default server configuration file.
    #[must_use]
    pub fn server_config(&self) -> PathBuf {
        self.config_dir.join("server.yml")
    }

    /// Mount directory of a pool.
    #[must_use]
    pub fn pool(&self, pool_dir: &str) -> PathBuf {
        self.mount_dir.join(pool_dir)
    }
}

impl Default for ThinclonePaths {
    fn default() -> Self {
        Self {
            mount_dir: THINCLONE_MOUNT_DIR.clone(),
            config_dir: THINCLONE_CONFIG_DIR.clone(),
        }
    }
}
