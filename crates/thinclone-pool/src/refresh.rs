//! Full refresh: load fresh data into an idle pool and rotate it in.

use std::sync::Arc;

use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::snapshot::format_dsa;
use thinclone_fs::{DEFAULT_BRANCH, DataMarker, FsManager, PoolStatus, SnapshotKind};
use tokio::sync::Mutex;

use crate::config::RefreshConfig;
use crate::registry::PoolRegistry;
use crate::retrieval::{JobOptions, JobRunner};

/// Background full refresh of the pool rotation.
#[derive(Debug)]
pub struct FullRefresh {
    registry: Arc<PoolRegistry>,
    jobs: Vec<Arc<dyn JobRunner>>,
    config: RefreshConfig,
    settings: serde_yaml::Value,
    running: Mutex<()>,
}

impl FullRefresh {
    /// Create a refresh running `jobs` in order against the selected pool.
    #[must_use]
    pub fn new(
        registry: Arc<PoolRegistry>,
        jobs: Vec<Arc<dyn JobRunner>>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            config,
            settings: serde_yaml::Value::Null,
            running: Mutex::new(()),
        }
    }

    /// Settings passed to every job on reload.
    #[must_use]
    pub fn with_job_settings(mut self, settings: serde_yaml::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Refresh the best idle pool and make it Active.
    ///
    /// Returns the manager of the refreshed pool. On failure the pool gets
    /// its previous status back and the Active pool is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::NoRoom`] when no pool can be rotated, a
    /// runtime error if a refresh is already running, and any job or backend
    /// failure with the failing step attached.
    pub async fn run(&self) -> ThincloneResult<Arc<dyn FsManager>> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(ThincloneError::Runtime {
                operation: "full refresh".to_string(),
                message: "a refresh is already running".to_string(),
            });
        };

        let target = self.registry.get_pool_to_update().await?;
        let pool = target.pool();
        let previous = pool.status();

        tracing::info!(pool = %pool.name, "Starting full refresh");
        pool.set_status(PoolStatus::Refreshing);

        if let Err(e) = self.refresh(target.as_ref()).await {
            tracing::error!(pool = %pool.name, error = %e, "Full refresh failed");
            pool.set_status(previous);
            return Err(e);
        }

        self.registry.make_active(&pool.name)?;
        tracing::info!(pool = %pool.name, dsa = ?pool.data_state_at(), "Full refresh completed");
        Ok(target)
    }

    async fn refresh(&self, fsm: &dyn FsManager) -> ThincloneResult<()> {
        let pool = fsm.pool();

        for job in &self.jobs {
            let options = JobOptions::new(Arc::clone(&pool)).with_settings(self.settings.clone());
            job.reload(options)
                .await
                .map_err(|e| ThincloneError::step(format!("reload job {}", job.name()), e))?;

            tracing::info!(pool = %pool.name, job = job.name(), "Running retrieval job");
            job.run()
                .await
                .map_err(|e| ThincloneError::step(format!("run job {}", job.name()), e))?;
        }

        let dsa = DataMarker::load(&pool.data_dir())
            .and_then(|marker| marker.data_state_at())
            .map_err(|e| ThincloneError::step("read data marker", e))?;

        let snapshot = match fsm
            .create_snapshot(&self.config.snapshot_suffix, &format_dsa(dsa))
            .await
        {
            Ok(name) => name,
            Err(ThincloneError::SnapshotExists { name }) => {
                tracing::info!(pool = %pool.name, snapshot = %name, "Snapshot already exists, skipping");
                name
            }
            Err(e) => return Err(ThincloneError::step("create snapshot", e)),
        };
        pool.set_data_state_at(Some(dsa));
        fsm.refresh_snapshot_list()
            .await
            .map_err(|e| ThincloneError::step("refresh snapshot list", e))?;

        if let Err(e) = advance_default_branch(fsm, &snapshot).await {
            tracing::warn!(pool = %pool.name, snapshot = %snapshot, error = %e, "Failed to advance default branch");
        }

        match fsm
            .cleanup_snapshots(self.config.retention_limit, SnapshotKind::Data)
            .await
        {
            Ok(destroyed) if !destroyed.is_empty() => {
                tracing::info!(pool = %pool.name, destroyed = destroyed.len(), "Applied snapshot retention");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(pool = %pool.name, error = %e, "Failed to apply snapshot retention");
            }
        }

        Ok(())
    }
}

/// Make `snapshot` the head of the default branch, linked to the old head.
async fn advance_default_branch(fsm: &dyn FsManager, snapshot: &str) -> ThincloneResult<()> {
    let branches = fsm.list_branches().await?;
    let Some(head) = branches.get(DEFAULT_BRANCH) else {
        return fsm.init_branching().await;
    };
    if head == snapshot {
        return Ok(());
    }

    fsm.set_relation(head, snapshot).await?;
    fsm.delete_branch_prop(DEFAULT_BRANCH, head).await?;
    fsm.add_branch_prop(DEFAULT_BRANCH, snapshot).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex as SyncMutex;
    use tempfile::TempDir;
    use thinclone_fs::marker::LOGICAL_DATA_TYPE;
    use thinclone_fs::snapshot::parse_dsa;
    use thinclone_fs::{Branching, Cloner, Pool, Snapshot, Snapshotter};

    use crate::config::PoolConfig;
    use crate::retrieval::Activity;
    use crate::testing::{MemoryFactory, StaticProbe};

    fn now() -> DateTime<Utc> {
        parse_dsa("20240601120000").unwrap()
    }

    /// Writes a data marker into the pool it is reloaded with.
    #[derive(Debug, Default)]
    struct MarkerJob {
        pool: SyncMutex<Option<Arc<Pool>>>,
        fail: bool,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for MarkerJob {
        fn name(&self) -> &str {
            "marker"
        }

        async fn reload(&self, options: JobOptions) -> ThincloneResult<()> {
            *self.pool.lock() = Some(options.pool);
            Ok(())
        }

        async fn run(&self) -> ThincloneResult<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(ThincloneError::Runtime {
                    operation: "restore".to_string(),
                    message: "source unreachable".to_string(),
                });
            }

            let pool = self.pool.lock().clone().ok_or_else(|| ThincloneError::Internal {
                message: "job not reloaded".to_string(),
            })?;
            let hours = 6 * i64::try_from(run).unwrap();
            DataMarker::new(LOGICAL_DATA_TYPE, now() + Duration::hours(hours)).save(&pool.data_dir())
        }

        async fn report_activity(&self) -> ThincloneResult<Activity> {
            Ok(Activity::default())
        }
    }

    async fn setup() -> (TempDir, Arc<PoolRegistry>, Arc<MemoryFactory>) {
        let temp = tempfile::tempdir().unwrap();
        for dir in ["pool_a", "pool_b"] {
            fs::create_dir_all(temp.path().join(dir).join("data")).unwrap();
        }
        DataMarker::new(LOGICAL_DATA_TYPE, now())
            .save(&temp.path().join("pool_a").join("data"))
            .unwrap();

        let factory = Arc::new(MemoryFactory::default());
        let registry = Arc::new(PoolRegistry::new(
            PoolConfig::default().with_mount_dir(temp.path()),
            Arc::new(StaticProbe::zfs()),
            Arc::clone(&factory) as Arc<dyn crate::ManagerFactory>,
        ));
        registry.discover().await.unwrap();

        let active = factory.manager("pool_a");
        active.insert_snapshot(&Snapshot::new("pool_a@snapshot_1", "pool_a", now()).with_data_state_at(now()));
        active
            .create_clone("main", "c1", "pool_a@snapshot_1", 0)
            .await
            .unwrap();

        (temp, registry, factory)
    }

    #[test_log::test(tokio::test)]
    async fn idle_pool_is_refreshed_and_activated() {
        let (_temp, registry, factory) = setup().await;
        let job = Arc::new(MarkerJob::default());
        let refresh = FullRefresh::new(
            Arc::clone(&registry),
            vec![Arc::clone(&job) as Arc<dyn JobRunner>],
            RefreshConfig::default(),
        );

        let refreshed = refresh.run().await.unwrap();
        assert_eq!(refreshed.pool().name, "pool_b");
        assert_eq!(registry.first().unwrap().pool().name, "pool_b");
        assert_eq!(refreshed.pool().status(), PoolStatus::Active);
        assert_eq!(refreshed.pool().data_state_at(), Some(now() + Duration::hours(6)));
        assert_eq!(
            registry.get_fs_manager("pool_a").unwrap().pool().status(),
            PoolStatus::Empty
        );

        let snapshots = factory.manager("pool_b").snapshot_list();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "pool_b@snapshot_20240601180000");

        let branches = refreshed.list_branches().await.unwrap();
        assert_eq!(branches[DEFAULT_BRANCH], snapshots[0].id);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_job_restores_status() {
        let (_temp, registry, _factory) = setup().await;
        let job = Arc::new(MarkerJob {
            fail: true,
            ..MarkerJob::default()
        });
        let refresh = FullRefresh::new(
            Arc::clone(&registry),
            vec![job as Arc<dyn JobRunner>],
            RefreshConfig::default(),
        );

        let err = refresh.run().await.unwrap_err();
        assert!(matches!(err, ThincloneError::Step { .. }));
        assert!(err.to_string().contains("run job marker"));

        assert_eq!(registry.first().unwrap().pool().name, "pool_a");
        assert_eq!(
            registry.get_fs_manager("pool_b").unwrap().pool().status(),
            PoolStatus::Empty
        );
    }

    #[test_log::test(tokio::test)]
    async fn retention_bounds_snapshots_across_refreshes() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("pool_a").join("data")).unwrap();
        let factory = Arc::new(MemoryFactory::default());
        let registry = Arc::new(PoolRegistry::new(
            PoolConfig::default().with_mount_dir(temp.path()),
            Arc::new(StaticProbe::zfs()),
            Arc::clone(&factory) as Arc<dyn crate::ManagerFactory>,
        ));
        registry.discover().await.unwrap();

        let refresh = FullRefresh::new(
            Arc::clone(&registry),
            vec![Arc::new(MarkerJob::default()) as Arc<dyn JobRunner>],
            RefreshConfig {
                retention_limit: 1,
                ..RefreshConfig::default()
            },
        );
        for _ in 0..4 {
            refresh.run().await.unwrap();
        }

        let manager = factory.manager("pool_a");
        let snapshots = manager.snapshot_list();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "pool_a@snapshot_20240602120000");

        let repo = manager.get_repo().await.unwrap();
        assert_eq!(repo.branches[DEFAULT_BRANCH], snapshots[0].id);
        assert_eq!(repo.snapshots[&snapshots[0].id].roots, [DEFAULT_BRANCH]);
    }

    #[tokio::test]
    async fn busy_pools_cannot_be_rotated() {
        let (_temp, registry, factory) = setup().await;
        let idle = factory.manager("pool_b");
        idle.insert_snapshot(&Snapshot::new("pool_b@snapshot_0", "pool_b", now()));
        idle.create_clone("main", "c2", "pool_b@snapshot_0", 0)
            .await
            .unwrap();

        let refresh = FullRefresh::new(registry, Vec::new(), RefreshConfig::default());
        assert!(refresh.run().await.unwrap_err().is_capacity());
    }
}
