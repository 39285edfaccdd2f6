//! Storage pools.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thinclone_common::ThincloneError;

/// Dataset component under which branch clones live.
pub const BRANCH_DATASET: &str = "branch";

/// Backend technology of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// ZFS datasets and snapshots.
    Zfs,
    /// LVM thin snapshots.
    Lvm,
}

impl PoolMode {
    /// Get the mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Zfs => "zfs",
            Self::Lvm => "lvm",
        }
    }

    /// Whether a mounted filesystem type can back a pool of this mode.
    #[must_use]
    pub fn accepts_fs_type(&self, fs_type: &str) -> bool {
        match self {
            Self::Zfs => fs_type == "zfs",
            Self::Lvm => matches!(fs_type, "ext4" | "xfs"),
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolMode {
    type Err = ThincloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zfs" => Ok(Self::Zfs),
            "lvm" => Ok(Self::Lvm),
            other => Err(ThincloneError::Config {
                message: format!("unknown pool mode: {other}"),
            }),
        }
    }
}

/// Serving status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// No usable data, or not the serving pool.
    #[default]
    Empty,
    /// The pool new sessions are provisioned from.
    Active,
    /// Being filled by a full refresh.
    Refreshing,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Active => write!(f, "active"),
            Self::Refreshing => write!(f, "refreshing"),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    status: PoolStatus,
    data_state_at: Option<DateTime<Utc>>,
}

/// A copy-on-write storage pool mounted on the host.
///
/// Identity and layout are fixed at discovery; status and data state are
/// mutated by the registry and the refresh job through `&self`.
#[derive(Debug)]
pub struct Pool {
    /// Logical pool name (the ZFS dataset or LVM volume group).
    pub name: String,
    /// Backend technology.
    pub mode: PoolMode,
    /// Directory under which the pool is mounted.
    pub mount_dir: PathBuf,
    /// Name of the pool directory inside `mount_dir`.
    pub dir_name: String,
    /// Data directory relative to the pool directory.
    pub data_sub_dir: String,
    /// Clone mount directory relative to the pool directory.
    pub clone_sub_dir: String,
    /// Unix socket directory relative to the pool directory.
    pub socket_sub_dir: String,
    state: RwLock<PoolState>,
}

impl Pool {
    /// Create a pool with the default sub-directory layout.
    pub fn new(
        name: impl Into<String>,
        mode: PoolMode,
        mount_dir: impl Into<PathBuf>,
        dir_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            mount_dir: mount_dir.into(),
            dir_name: dir_name.into(),
            data_sub_dir: "data".to_string(),
            clone_sub_dir: "clones".to_string(),
            socket_sub_dir: "sockets".to_string(),
            state: RwLock::new(PoolState::default()),
        }
    }

    /// Override the sub-directory layout.
    #[must_use]
    pub fn with_layout(
        mut self,
        data_sub_dir: impl Into<String>,
        clone_sub_dir: impl Into<String>,
        socket_sub_dir: impl Into<String>,
    ) -> Self {
        self.data_sub_dir = data_sub_dir.into();
        self.clone_sub_dir = clone_sub_dir.into();
        self.socket_sub_dir = socket_sub_dir.into();
        self
    }

    /// Whether `other` describes the same pool at the same paths.
    #[must_use]
    pub fn same_layout(&self, other: &Self) -> bool {
        self.name == other.name
            && self.mode == other.mode
            && self.pool_dir() == other.pool_dir()
            && self.data_sub_dir == other.data_sub_dir
            && self.clone_sub_dir == other.clone_sub_dir
            && self.socket_sub_dir == other.socket_sub_dir
    }

    /// Pool mount point.
    #[must_use]
    pub fn pool_dir(&self) -> PathBuf {
        self.mount_dir.join(&self.dir_name)
    }

    /// Directory holding the pool's database files.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.pool_dir().join(&self.data_sub_dir)
    }

    /// Directory under which clones are mounted.
    #[must_use]
    pub fn clones_dir(&self) -> PathBuf {
        self.pool_dir().join(&self.clone_sub_dir)
    }

    /// Directory holding per-session unix sockets.
    #[must_use]
    pub fn socket_dir(&self) -> PathBuf {
        self.pool_dir().join(&self.socket_sub_dir)
    }

    /// Socket directory of one clone.
    #[must_use]
    pub fn clone_socket_dir(&self, clone: &str) -> PathBuf {
        self.socket_dir().join(clone)
    }

    /// Mount point of one clone revision.
    #[must_use]
    pub fn clone_mountpoint(&self, branch: &str, clone: &str, revision: u32) -> PathBuf {
        self.clones_dir()
            .join(branch)
            .join(clone)
            .join(format!("r{revision}"))
    }

    /// Database directory inside a clone revision.
    #[must_use]
    pub fn clone_data_dir(&self, branch: &str, clone: &str, revision: u32) -> PathBuf {
        self.clone_mountpoint(branch, clone, revision)
            .join(&self.data_sub_dir)
    }

    /// Dataset holding every revision of a clone.
    #[must_use]
    pub fn clone_base_dataset(&self, branch: &str, clone: &str) -> String {
        format!("{}/{BRANCH_DATASET}/{branch}/{clone}", self.name)
    }

    /// Dataset of one clone revision.
    #[must_use]
    pub fn clone_dataset(&self, branch: &str, clone: &str, revision: u32) -> String {
        format!("{}/r{revision}", self.clone_base_dataset(branch, clone))
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.state.read().status
    }

    /// Update the status.
    pub fn set_status(&self, status: PoolStatus) {
        let mut state = self.state.write();
        if state.status != status {
            tracing::debug!(pool = %self.name, from = %state.status, to = %status, "Pool status changed");
        }
        state.status = status;
    }

    /// Timestamp of the data the pool currently holds.
    #[must_use]
    pub fn data_state_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().data_state_at
    }

    /// Record the timestamp of the data the pool holds.
    pub fn set_data_state_at(&self, dsa: Option<DateTime<Utc>>) {
        self.state.write().data_state_at = dsa;
    }
}

/// Parse a dataset name of the form `<pool>/branch/<branch>/<clone>/r<revision>`.
///
/// Returns `None` for anything that is not a clone revision of `pool`.
#[must_use]
pub fn parse_clone_dataset(pool: &str, dataset: &str) -> Option<(String, String, u32)> {
    let rest = dataset.strip_prefix(pool)?.strip_prefix('/')?;
    let rest = rest.strip_prefix(BRANCH_DATASET)?.strip_prefix('/')?;

    let mut parts = rest.split('/');
    let branch = parts.next()?;
    let clone = parts.next()?;
    let revision = parts.next()?.strip_prefix('r')?.parse().ok()?;

    if parts.next().is_some() || branch.is_empty() || clone.is_empty() {
        return None;
    }

    Some((branch.to_string(), clone.to_string(), revision))
}
