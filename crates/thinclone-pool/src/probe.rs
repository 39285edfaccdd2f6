//! Detection of the filesystem backing a pool directory.

use std::fmt::Debug;
use std::fs;
use std::path::Path;

use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::PoolMode;

/// `statfs` magic numbers of the filesystems pools are built on.
const ZFS_MAGIC: u64 = 0x2fc1_2fc1;
const EXT4_MAGIC: u64 = 0xef53;
const XFS_MAGIC: u64 = 0x5846_5342;

const MOUNTS_FILE: &str = "/proc/self/mounts";

/// Inspects pool directories.
pub trait PoolProbe: Debug + Send + Sync {
    /// Filesystem type mounted at `path` (e.g. `zfs`, `ext4`).
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be inspected.
    fn fs_type(&self, path: &Path) -> ThincloneResult<String>;

    /// Logical name of the pool mounted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be determined.
    fn pool_name(&self, path: &Path, mode: PoolMode) -> ThincloneResult<String>;
}

/// Probe based on `statfs(2)` and the kernel mount table.
#[derive(Debug, Clone, Default)]
pub struct StatfsProbe;

impl StatfsProbe {
    /// Create a probe.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Name of a filesystem magic number.
#[must_use]
pub fn fs_type_name(magic: u64) -> String {
    match magic {
        ZFS_MAGIC => "zfs".to_string(),
        EXT4_MAGIC => "ext4".to_string(),
        XFS_MAGIC => "xfs".to_string(),
        other => format!("unknown({other:#x})"),
    }
}

/// Find the source device of the mount at `path` in a mount table.
#[must_use]
pub fn mount_source(mounts: &str, path: &Path) -> Option<String> {
    let target = path.to_str()?.trim_end_matches('/');
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let mountpoint = fields.next()?;
        (mountpoint.trim_end_matches('/') == target).then(|| source.to_string())
    })
}

impl PoolProbe for StatfsProbe {
    fn fs_type(&self, path: &Path) -> ThincloneResult<String> {
        let stat = rustix::fs::statfs(path).map_err(std::io::Error::from)?;
        #[allow(clippy::cast_sign_loss, clippy::unnecessary_cast)]
        let magic = stat.f_type as u64;
        Ok(fs_type_name(magic))
    }

    fn pool_name(&self, path: &Path, mode: PoolMode) -> ThincloneResult<String> {
        match mode {
            PoolMode::Zfs => {
                let mounts = fs::read_to_string(MOUNTS_FILE)?;
                mount_source(&mounts, path).ok_or_else(|| ThincloneError::PoolNotFound {
                    name: path.display().to_string(),
                })
            }
            PoolMode::Lvm => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
                .ok_or_else(|| ThincloneError::PoolNotFound {
                    name: path.display().to_string(),
                }),
        }
    }
}
