//! The pool registry.
//!
//! Holds one filesystem manager per discovered pool and the ranking of the
//! pools. All mutations go through registry methods; callers only ever get
//! `Arc` handles to managers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::{DataMarker, FsManager, PoolStatus};
use tokio::fs;

use crate::config::PoolConfig;
use crate::factory::ManagerFactory;
use crate::probe::PoolProbe;

#[derive(Debug, Default)]
struct Pools {
    /// Pool names, front is the Active pool.
    order: VecDeque<String>,
    managers: HashMap<String, Arc<dyn FsManager>>,
}

impl Pools {
    fn ordered(&self) -> Vec<Arc<dyn FsManager>> {
        self.order
            .iter()
            .filter_map(|name| self.managers.get(name).cloned())
            .collect()
    }
}

/// Registry of the pools mounted on the host.
#[derive(Debug)]
pub struct PoolRegistry {
    config: RwLock<PoolConfig>,
    probe: Arc<dyn PoolProbe>,
    factory: Arc<dyn ManagerFactory>,
    pools: RwLock<Pools>,
}

impl PoolRegistry {
    /// Create an empty registry; call [`PoolRegistry::discover`] to fill it.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        probe: Arc<dyn PoolProbe>,
        factory: Arc<dyn ManagerFactory>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            probe,
            factory,
            pools: RwLock::new(Pools::default()),
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.config.read().clone()
    }

    /// Scan the mount directory and rebuild the pool order.
    ///
    /// Managers of pools that were already known are reused as long as the
    /// pool keeps its directory and layout; otherwise a new manager is built.
    /// Entries that cannot be probed or built are skipped; a pool whose data
    /// marker cannot be read is kept with `Empty` status.
    ///
    /// # Errors
    ///
    /// Fails if the mount directory cannot be read or no usable pool is found.
    pub async fn discover(&self) -> ThincloneResult<()> {
        let config = self.config();
        let existing = self.pools.read().managers.clone();

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&config.mount_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if fs::metadata(entry.path()).await.is_ok_and(|m| m.is_dir()) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(fs::DirEntry::file_name);

        let mut pools = Pools::default();
        for entry in entries {
            let path = entry.path();
            let Some(dir_name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };

            if config
                .selected_pool
                .as_ref()
                .is_some_and(|selected| *selected != dir_name)
            {
                tracing::debug!(dir = %dir_name, "Skipping pool, not selected");
                continue;
            }

            let fs_type = match self.probe.fs_type(&path) {
                Ok(fs_type) => fs_type,
                Err(e) => {
                    tracing::warn!(dir = %dir_name, error = %e, "Failed to probe pool directory");
                    continue;
                }
            };
            if !config.mode.accepts_fs_type(&fs_type) {
                tracing::debug!(dir = %dir_name, fs_type = %fs_type, mode = %config.mode, "Skipping unsupported filesystem");
                continue;
            }

            let name = match self.probe.pool_name(&path, config.mode) {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(dir = %dir_name, error = %e, "Failed to resolve pool name");
                    continue;
                }
            };
            if pools.managers.contains_key(&name) {
                tracing::warn!(pool = %name, dir = %dir_name, "Pool already discovered, skipping duplicate");
                continue;
            }

            let layout = config.pool(&name, &dir_name);
            let manager = match existing.get(&name) {
                Some(manager) if manager.pool().same_layout(&layout) => Arc::clone(manager),
                known => {
                    if known.is_some() {
                        tracing::warn!(pool = %name, dir = %dir_name, "Pool layout changed, rebuilding filesystem manager");
                    }
                    match self.factory.build(Arc::new(layout)) {
                        Ok(manager) => manager,
                        Err(e) => {
                            tracing::warn!(pool = %name, error = %e, "Failed to build filesystem manager");
                            continue;
                        }
                    }
                }
            };

            let pool = manager.pool();
            let dsa = match DataMarker::load(&pool.data_dir()).and_then(|m| m.data_state_at()) {
                Ok(dsa) => Some(dsa),
                Err(e) => {
                    tracing::warn!(pool = %name, error = %e, "Failed to read data marker, pool is empty");
                    None
                }
            };
            pool.set_data_state_at(dsa);
            if dsa.is_none() && pool.status() != PoolStatus::Refreshing {
                pool.set_status(PoolStatus::Empty);
            }

            if let Err(e) = manager.refresh_snapshot_list().await {
                tracing::warn!(pool = %name, error = %e, "Failed to load snapshot list");
            }

            let front_dsa = pools
                .order
                .front()
                .and_then(|front| pools.managers.get(front))
                .and_then(|m| m.pool().data_state_at());
            match (dsa, front_dsa) {
                (Some(dsa), Some(front)) if dsa > front => pools.order.push_front(name.clone()),
                (Some(_), None) => pools.order.push_front(name.clone()),
                _ => pools.order.push_back(name.clone()),
            }

            tracing::info!(pool = %name, mode = %config.mode, dsa = ?dsa, "Discovered pool");
            pools.managers.insert(name, manager);
        }

        if pools.order.is_empty() {
            return Err(ThincloneError::Config {
                message: format!(
                    "no available pools in {} for mode {}",
                    config.mount_dir.display(),
                    config.mode
                ),
            });
        }

        Self::assign_statuses(&pools);
        *self.pools.write() = pools;
        Ok(())
    }

    /// The front pool becomes Active if it holds data; any other Active pool
    /// is demoted.
    fn assign_statuses(pools: &Pools) {
        for (i, manager) in pools.ordered().iter().enumerate() {
            let pool = manager.pool();
            if i == 0 && pool.data_state_at().is_some() {
                if pool.status() != PoolStatus::Refreshing {
                    pool.set_status(PoolStatus::Active);
                }
            } else if pool.status() == PoolStatus::Active {
                pool.set_status(PoolStatus::Empty);
            }
        }
    }

    /// Re-run discovery with a new configuration.
    ///
    /// Managers of pools still present at the same paths are reused so live
    /// clones are not disturbed. Changing the mount directory or the pool
    /// sub-directories rebuilds the affected managers.
    ///
    /// # Errors
    ///
    /// Same as [`PoolRegistry::discover`]; on error the previous pools stay
    /// in place.
    pub async fn reload(&self, config: PoolConfig) -> ThincloneResult<()> {
        config.validate()?;
        let previous = std::mem::replace(&mut *self.config.write(), config);

        if let Err(e) = self.discover().await {
            *self.config.write() = previous;
            return Err(e);
        }

        tracing::info!(pools = self.pools.read().order.len(), "Reloaded pools");
        Ok(())
    }

    /// Manager of the Active pool.
    #[must_use]
    pub fn first(&self) -> Option<Arc<dyn FsManager>> {
        let pools = self.pools.read();
        pools
            .order
            .front()
            .and_then(|name| pools.managers.get(name))
            .cloned()
    }

    /// Move a pool to the front and mark it Active.
    ///
    /// Only call once the pool holds fresh, complete data. The previously
    /// Active pool becomes Empty.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::PoolNotFound`] for unknown pools.
    pub fn make_active(&self, name: &str) -> ThincloneResult<()> {
        let mut pools = self.pools.write();
        let index = pools
            .order
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ThincloneError::PoolNotFound {
                name: name.to_string(),
            })?;

        if let Some(entry) = pools.order.remove(index) {
            pools.order.push_front(entry);
        }

        for (pool_name, manager) in &pools.managers {
            let pool = manager.pool();
            if pool_name == name {
                pool.set_status(PoolStatus::Active);
            } else if pool.status() == PoolStatus::Active {
                pool.set_status(PoolStatus::Empty);
            }
        }

        tracing::info!(pool = name, "Pool is now active");
        Ok(())
    }

    /// Best pool for a background full refresh.
    ///
    /// Scans from the back of the order and returns the first pool without
    /// clones. The Active pool is only considered when it is the only pool.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::NoRoom`] when every candidate still has
    /// clones.
    pub async fn get_pool_to_update(&self) -> ThincloneResult<Arc<dyn FsManager>> {
        let ordered = self.get_fs_manager_ordered_list();
        let single = ordered.len() == 1;

        for manager in ordered.into_iter().rev() {
            let pool = manager.pool();
            if pool.status() == PoolStatus::Active && !single {
                continue;
            }

            match manager.list_clones_names().await {
                Ok(clones) if clones.is_empty() => {
                    tracing::debug!(pool = %pool.name, "Selected pool to refresh");
                    return Ok(manager);
                }
                Ok(clones) => {
                    tracing::debug!(pool = %pool.name, clones = clones.len(), "Pool has clones, not a refresh candidate");
                }
                Err(e) => {
                    tracing::warn!(pool = %pool.name, error = %e, "Failed to list clones");
                }
            }
        }

        Err(ThincloneError::NoRoom {
            resource: "pool to refresh".to_string(),
        })
    }

    /// Manager of a pool by name.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::PoolNotFound`] for unknown pools.
    pub fn get_fs_manager(&self, name: &str) -> ThincloneResult<Arc<dyn FsManager>> {
        self.pools
            .read()
            .managers
            .get(name)
            .cloned()
            .ok_or_else(|| ThincloneError::PoolNotFound {
                name: name.to_string(),
            })
    }

    /// Every manager, sorted by pool name.
    #[must_use]
    pub fn get_fs_manager_list(&self) -> Vec<Arc<dyn FsManager>> {
        let pools = self.pools.read();
        let mut names: Vec<&String> = pools.managers.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| pools.managers.get(name).cloned())
            .collect()
    }

    /// Every manager in rank order, Active pool first.
    #[must_use]
    pub fn get_fs_manager_ordered_list(&self) -> Vec<Arc<dyn FsManager>> {
        self.pools.read().ordered()
    }
}
