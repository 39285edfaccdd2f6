//! Construction of filesystem managers by pool mode.

use std::fmt::Debug;
use std::sync::Arc;

use thinclone_common::ThincloneResult;
use thinclone_fs::{
    CommandRunner, FsManager, HostRunner, LvmManager, ManagerConfig, Pool, PoolMode, ZfsManager,
};

/// Builds the filesystem manager of a discovered pool.
pub trait ManagerFactory: Debug + Send + Sync {
    /// Build a manager for `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be configured for the pool.
    fn build(&self, pool: Arc<Pool>) -> ThincloneResult<Arc<dyn FsManager>>;
}

/// Factory resolving `mode` to the ZFS or LVM backend.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    runner: Arc<dyn CommandRunner>,
    config: ManagerConfig,
}

impl BackendFactory {
    /// Create a factory running backend commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, config: ManagerConfig) -> Self {
        Self { runner, config }
    }

    /// Create a factory running commands on the host.
    #[must_use]
    pub fn host(config: ManagerConfig, use_sudo: bool) -> Self {
        let runner = if use_sudo {
            HostRunner::new().with_sudo()
        } else {
            HostRunner::new()
        };
        Self::new(Arc::new(runner), config)
    }
}

impl ManagerFactory for BackendFactory {
    fn build(&self, pool: Arc<Pool>) -> ThincloneResult<Arc<dyn FsManager>> {
        tracing::debug!(pool = %pool.name, mode = %pool.mode, "Building filesystem manager");

        let manager: Arc<dyn FsManager> = match pool.mode {
            PoolMode::Zfs => Arc::new(ZfsManager::new(
                pool,
                Arc::clone(&self.runner),
                self.config.clone(),
            )),
            PoolMode::Lvm => Arc::new(LvmManager::new(
                pool,
                Arc::clone(&self.runner),
                &self.config,
            )?),
        };
        Ok(manager)
    }
}
