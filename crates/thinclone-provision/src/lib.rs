//! # thinclone-provision
//!
//! Turns a snapshot into a running, addressable database instance.
//!
//! The [`Provisioner`] allocates a port from the [`PortPool`], creates a thin
//! clone through the pool's filesystem manager, starts a database instance
//! through an [`InstanceRuntime`] and prepares the database for the session
//! user. Every multi-step operation records compensating actions on a
//! [`Rollback`] stack that runs in reverse if a later step fails.

#![warn(missing_docs)]

pub mod config;
pub mod database;
pub mod events;
pub mod ports;
pub mod provisioner;
pub mod rollback;
pub mod runtime;
pub mod session;

pub use config::{HealthCheckConfig, PortPoolConfig, ProvisionConfig};
pub use events::{EventBus, ProvisionEvent};
pub use ports::{PortPool, PortProber, PortRevision, TcpProber};
pub use provisioner::Provisioner;
pub use rollback::Rollback;
pub use runtime::{DockerCli, InstanceInfo, InstanceRuntime, InstanceSpec};
pub use session::{CloneRef, EphemeralUser, Session};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use thinclone_common::{ThincloneError, ThincloneResult};
    use thinclone_fs::{FsManager, MemoryManager, Pool, PoolMode};
    use thinclone_pool::{ManagerFactory, PoolProbe};

    /// Every directory is a ZFS pool named after the directory.
    #[derive(Debug, Default)]
    pub(crate) struct DirProbe;

    impl PoolProbe for DirProbe {
        fn fs_type(&self, _path: &Path) -> ThincloneResult<String> {
            Ok("zfs".to_string())
        }

        fn pool_name(&self, path: &Path, _mode: PoolMode) -> ThincloneResult<String> {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(ToString::to_string)
                .ok_or_else(|| ThincloneError::PoolNotFound {
                    name: path.display().to_string(),
                })
        }
    }

    /// Factory building in-memory managers and keeping a handle to each.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryFactory {
        managers: Mutex<HashMap<String, Arc<MemoryManager>>>,
    }

    impl MemoryFactory {
        pub(crate) fn manager(&self, pool: &str) -> Arc<MemoryManager> {
            Arc::clone(&self.managers.lock()[pool])
        }
    }

    impl ManagerFactory for MemoryFactory {
        fn build(&self, pool: Arc<Pool>) -> ThincloneResult<Arc<dyn FsManager>> {
            let manager = Arc::new(MemoryManager::new(Arc::clone(&pool)));
            self.managers
                .lock()
                .insert(pool.name.clone(), Arc::clone(&manager));
            Ok(manager)
        }
    }
}
