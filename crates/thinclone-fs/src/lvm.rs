//! LVM backend.
//!
//! Clones are LVM snapshots of the pool's logical volume, one per revision,
//! named `tc.<branch>.<clone>.r<revision>`. LVM keeps no snapshot history of
//! its own: the pool exposes a single snapshot standing for its current data
//! and branching is limited to the default branch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use thinclone_common::id::validate_name;
use thinclone_common::{ThincloneError, ThincloneResult};

use crate::branching::{
    BranchEntity, CloneDataset, DEFAULT_BRANCH, DEFAULT_REVISION, DestroyOptions, Repo,
    ResetOptions, SnapshotDetails,
};
use crate::exec::{CommandRunner, args};
use crate::manager::{Branching, Cloner, ManagerConfig, Pooler, Snapshotter, StateReporter};
use crate::pool::Pool;
use crate::snapshot::{
    FilesystemState, SNAPSHOT_PREFIX, SessionState, Snapshot, SnapshotKind, format_dsa,
};

/// Prefix of logical volumes created for clones.
const CLONE_LV_PREFIX: &str = "tc";

/// Share of the origin volume reserved for a clone's changes.
const CLONE_EXTENTS: &str = "10%ORIGIN";

fn clone_lv_name(branch: &str, clone: &str, revision: u32) -> String {
    format!("{CLONE_LV_PREFIX}.{branch}.{clone}.r{revision}")
}

fn parse_clone_lv(name: &str) -> Option<CloneDataset> {
    let mut parts = name.trim().split('.');
    if parts.next()? != CLONE_LV_PREFIX {
        return None;
    }
    let branch = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    let revision = parts.next()?.strip_prefix('r')?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(CloneDataset {
        branch,
        name,
        revision,
    })
}

fn unsupported(feature: &str) -> ThincloneError {
    ThincloneError::Unsupported {
        feature: format!("{feature} on LVM pools"),
    }
}

/// LVM filesystem manager.
#[derive(Debug)]
pub struct LvmManager {
    pool: Arc<Pool>,
    volume_group: String,
    logical_volume: String,
    runner: Arc<dyn CommandRunner>,
    snapshots: RwLock<Vec<Snapshot>>,
}

impl LvmManager {
    /// Create a manager for `pool`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless both the volume group and the
    /// logical volume are configured.
    pub fn new(
        pool: Arc<Pool>,
        runner: Arc<dyn CommandRunner>,
        config: &ManagerConfig,
    ) -> ThincloneResult<Self> {
        let (Some(volume_group), Some(logical_volume)) =
            (config.volume_group.clone(), config.logical_volume.clone())
        else {
            return Err(ThincloneError::Config {
                message: format!(
                    "pool {} uses lvm but no volume group and logical volume are configured",
                    pool.name
                ),
            });
        };

        Ok(Self {
            pool,
            volume_group,
            logical_volume,
            runner,
            snapshots: RwLock::new(Vec::new()),
        })
    }

    fn lv_path(&self, lv: &str) -> String {
        format!("{}/{lv}", self.volume_group)
    }

    /// Name of the snapshot standing for the pool's current data.
    fn data_snapshot(&self) -> Option<Snapshot> {
        let dsa = self.pool.data_state_at()?;
        let id = format!("{}@{SNAPSHOT_PREFIX}{}", self.pool.name, format_dsa(dsa));
        Some(Snapshot::new(id, self.pool.name.clone(), dsa).with_data_state_at(dsa))
    }

    async fn remove_revision(&self, clone: &CloneDataset) -> ThincloneResult<()> {
        let mountpoint = self
            .pool
            .clone_mountpoint(&clone.branch, &clone.name, clone.revision);
        if let Err(e) = self
            .runner
            .run("umount", &args([mountpoint.display().to_string()]))
            .await
        {
            tracing::debug!(mountpoint = %mountpoint.display(), error = %e, "Clone was not mounted");
        }

        let lv = clone_lv_name(&clone.branch, &clone.name, clone.revision);
        self.runner
            .run("lvremove", &args(["-y".to_string(), self.lv_path(&lv)]))
            .await?;
        Ok(())
    }
}

impl Pooler for LvmManager {
    fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }
}

#[async_trait]
impl Cloner for LvmManager {
    async fn create_clone(
        &self,
        branch: &str,
        name: &str,
        snapshot_id: &str,
        revision: u32,
    ) -> ThincloneResult<()> {
        validate_name(branch)?;
        validate_name(name)?;

        if self.data_snapshot().is_none_or(|s| s.id != snapshot_id) {
            return Err(ThincloneError::SnapshotNotFound {
                id: snapshot_id.to_string(),
            });
        }

        let lv = clone_lv_name(branch, name, revision);
        self.runner
            .run(
                "lvcreate",
                &args([
                    "--snapshot".to_string(),
                    "--extents".to_string(),
                    CLONE_EXTENTS.to_string(),
                    "--name".to_string(),
                    lv.clone(),
                    self.lv_path(&self.logical_volume),
                ]),
            )
            .await?;

        let mountpoint = self.pool.clone_mountpoint(branch, name, revision);
        let mount = async {
            self.runner
                .run("mkdir", &args(["-p".to_string(), mountpoint.display().to_string()]))
                .await?;
            self.runner
                .run(
                    "mount",
                    &args([
                        format!("/dev/{}", self.lv_path(&lv)),
                        mountpoint.display().to_string(),
                    ]),
                )
                .await
        };
        if let Err(e) = mount.await {
            if let Err(cleanup) = self
                .runner
                .run("lvremove", &args(["-y".to_string(), self.lv_path(&lv)]))
                .await
            {
                tracing::warn!(pool = %self.pool.name, volume = %lv, error = %cleanup, "Failed to remove unmounted clone volume");
            }
            return Err(e);
        }

        tracing::info!(pool = %self.pool.name, volume = %lv, "Created clone");
        self.refresh_snapshot_list().await
    }

    async fn destroy_clone(&self, branch: &str, name: &str, revision: u32) -> ThincloneResult<()> {
        let targets: Vec<CloneDataset> = self
            .list_clones()
            .await?
            .into_iter()
            .filter(|c| {
                c.branch == branch
                    && c.name == name
                    && (revision == DEFAULT_REVISION || c.revision == revision)
            })
            .collect();

        if targets.is_empty() {
            return Err(ThincloneError::CloneNotFound {
                name: name.to_string(),
            });
        }

        for target in &targets {
            self.remove_revision(target).await?;
        }

        tracing::info!(pool = %self.pool.name, branch, clone = name, revision, "Destroyed clone");
        self.refresh_snapshot_list().await
    }

    async fn list_clones(&self) -> ThincloneResult<Vec<CloneDataset>> {
        let out = self
            .runner
            .run(
                "lvs",
                &args([
                    "--noheadings".to_string(),
                    "-o".to_string(),
                    "lv_name".to_string(),
                    self.volume_group.clone(),
                ]),
            )
            .await?;
        Ok(out.lines().filter_map(parse_clone_lv).collect())
    }
}

#[async_trait]
impl Snapshotter for LvmManager {
    async fn create_snapshot(&self, suffix: &str, data_state_at: &str) -> ThincloneResult<String> {
        let dsa = if data_state_at.is_empty() {
            format_dsa(Utc::now())
        } else {
            data_state_at.to_string()
        };
        tracing::debug!(pool = %self.pool.name, "LVM pools keep no snapshots, skipping");
        Ok(format!("{}@{SNAPSHOT_PREFIX}{dsa}{suffix}", self.pool.name))
    }

    async fn destroy_snapshot(&self, name: &str, _opts: DestroyOptions) -> ThincloneResult<()> {
        tracing::debug!(pool = %self.pool.name, snapshot = name, "LVM pools keep no snapshots, skipping");
        Ok(())
    }

    async fn cleanup_snapshots(
        &self,
        _retention_limit: usize,
        _kind: SnapshotKind,
    ) -> ThincloneResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn snapshot_list(&self) -> Vec<Snapshot> {
        self.snapshots.read().clone()
    }

    async fn refresh_snapshot_list(&self) -> ThincloneResult<()> {
        let Some(mut snapshot) = self.data_snapshot() else {
            self.snapshots.write().clear();
            return Ok(());
        };
        snapshot.num_clones = self.list_clones().await?.len();
        *self.snapshots.write() = vec![snapshot];
        Ok(())
    }
}

#[async_trait]
impl StateReporter for LvmManager {
    async fn get_session_state(&self, branch: &str, clone: &str) -> ThincloneResult<SessionState> {
        let revisions: Vec<CloneDataset> = self
            .list_clones()
            .await?
            .into_iter()
            .filter(|c| c.branch == branch && c.name == clone)
            .collect();
        if revisions.is_empty() {
            return Err(ThincloneError::CloneNotFound {
                name: clone.to_string(),
            });
        }

        let mut state = SessionState::default();
        for revision in revisions {
            let lv = clone_lv_name(branch, clone, revision.revision);
            let out = self
                .runner
                .run(
                    "lvs",
                    &args([
                        "--noheadings".to_string(),
                        "--units".to_string(),
                        "b".to_string(),
                        "--nosuffix".to_string(),
                        "-o".to_string(),
                        "lv_size,data_percent".to_string(),
                        self.lv_path(&lv),
                    ]),
                )
                .await?;

            let mut fields = out.split_whitespace();
            let size: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or_default();
            let percent: f64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or_default();

            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let diff = (size as f64 * percent / 100.0) as u64;
            state.clone_diff_size += diff;
            state.logical_size = state.logical_size.max(size);
        }
        Ok(state)
    }

    async fn get_filesystem_state(&self) -> ThincloneResult<FilesystemState> {
        let stat = rustix::fs::statvfs(self.pool.data_dir()).map_err(std::io::Error::from)?;
        let size = stat.f_blocks * stat.f_frsize;
        let free = stat.f_bavail * stat.f_frsize;
        let used = size.saturating_sub(stat.f_bfree * stat.f_frsize);

        Ok(FilesystemState {
            size,
            free,
            used,
            used_by_snapshots: 0,
            used_by_clones: 0,
            compress_ratio: 1.0,
        })
    }
}

#[async_trait]
impl Branching for LvmManager {
    async fn init_branching(&self) -> ThincloneResult<()> {
        Ok(())
    }

    async fn verify_branch_metadata(&self) -> ThincloneResult<()> {
        Ok(())
    }

    async fn create_branch(&self, _branch: &str, _snapshot_id: &str) -> ThincloneResult<()> {
        Err(unsupported("branch creation"))
    }

    async fn delete_branch(&self, _branch: &str) -> ThincloneResult<()> {
        Err(unsupported("branch deletion"))
    }

    async fn list_branches(&self) -> ThincloneResult<BTreeMap<String, String>> {
        Ok(self
            .snapshot_list()
            .into_iter()
            .map(|s| (DEFAULT_BRANCH.to_string(), s.id))
            .collect())
    }

    async fn list_all_branches(&self) -> ThincloneResult<Vec<BranchEntity>> {
        Ok(self
            .list_branches()
            .await?
            .into_iter()
            .map(|(name, snapshot_id)| BranchEntity { name, snapshot_id })
            .collect())
    }

    async fn get_repo(&self) -> ThincloneResult<Repo> {
        let mut repo = Repo::default();
        for snapshot in self.snapshot_list() {
            repo.branches
                .insert(DEFAULT_BRANCH.to_string(), snapshot.id.clone());
            repo.snapshots.insert(
                snapshot.id.clone(),
                SnapshotDetails {
                    id: snapshot.id,
                    branches: vec![DEFAULT_BRANCH.to_string()],
                    data_state_at: snapshot.data_state_at.map(format_dsa),
                    ..SnapshotDetails::default()
                },
            );
        }
        Ok(repo)
    }

    async fn set_relation(&self, _parent: &str, _child: &str) -> ThincloneResult<()> {
        Err(unsupported("snapshot lineage"))
    }

    async fn snapshot(&self, _snapshot_name: &str) -> ThincloneResult<()> {
        Err(unsupported("named snapshots"))
    }

    async fn move_to(
        &self,
        _base_snapshot: &str,
        _current_snapshot: &str,
        _target: &str,
    ) -> ThincloneResult<()> {
        Err(unsupported("snapshot replication"))
    }

    async fn rename(&self, _old_name: &str, _new_name: &str) -> ThincloneResult<()> {
        Err(unsupported("renaming"))
    }

    async fn set_mountpoint(&self, _path: &Path, _name: &str) -> ThincloneResult<()> {
        Err(unsupported("mount point changes"))
    }

    async fn set_dsa(&self, _dsa: &str, _snapshot_name: &str) -> ThincloneResult<()> {
        Err(unsupported("snapshot properties"))
    }

    async fn set_message(&self, _message: &str, _snapshot_name: &str) -> ThincloneResult<()> {
        Err(unsupported("snapshot properties"))
    }

    async fn reset(&self, _snapshot_id: &str, _opts: ResetOptions) -> ThincloneResult<()> {
        Err(unsupported("reset"))
    }

    async fn has_dependent_entity(&self, snapshot_name: &str) -> ThincloneResult<Vec<String>> {
        if !self.snapshot_list().iter().any(|s| s.id == snapshot_name) {
            return Err(ThincloneError::SnapshotNotFound {
                id: snapshot_name.to_string(),
            });
        }

        Ok(self
            .list_clones()
            .await?
            .into_iter()
            .map(|c| clone_lv_name(&c.branch, &c.name, c.revision))
            .collect())
    }

    async fn clone_dependents(
        &self,
        _branch: &str,
        _name: &str,
        _revision: u32,
    ) -> ThincloneResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn add_branch_prop(&self, _branch: &str, _dataset: &str) -> ThincloneResult<()> {
        Err(unsupported("branch metadata"))
    }

    async fn delete_branch_prop(&self, _branch: &str, _dataset: &str) -> ThincloneResult<()> {
        Err(unsupported("branch metadata"))
    }

    async fn delete_child_prop(&self, _child: &str, _dataset: &str) -> ThincloneResult<()> {
        Err(unsupported("branch metadata"))
    }

    async fn delete_root_prop(&self, _branch: &str, _dataset: &str) -> ThincloneResult<()> {
        Err(unsupported("branch metadata"))
    }

    async fn set_root(&self, _branch: &str, _snapshot: &str) -> ThincloneResult<()> {
        Err(unsupported("branch metadata"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::pool::PoolMode;
    use crate::snapshot::parse_dsa;

    fn manager(runner: ScriptedRunner) -> (LvmManager, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let pool = Pool::new("vg_pool", PoolMode::Lvm, "/var/lib/thinclone", "pool_lvm");
        pool.set_data_state_at(Some(parse_dsa("20240101000000").unwrap()));

        let config = ManagerConfig {
            volume_group: Some("vg_pool".to_string()),
            logical_volume: Some("data".to_string()),
            ..ManagerConfig::default()
        };
        let manager = LvmManager::new(
            Arc::new(pool),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            &config,
        )
        .unwrap();
        (manager, runner)
    }

    #[test]
    fn clone_volume_names() {
        assert_eq!(clone_lv_name("main", "c1", 2), "tc.main.c1.r2");
        assert_eq!(
            parse_clone_lv("  tc.main.c1.r2"),
            Some(CloneDataset {
                branch: "main".to_string(),
                name: "c1".to_string(),
                revision: 2,
            })
        );
        assert_eq!(parse_clone_lv("data"), None);
        assert_eq!(parse_clone_lv("tc.main.c1"), None);
    }

    #[test]
    fn missing_volume_config_is_rejected() {
        let pool = Pool::new("vg_pool", PoolMode::Lvm, "/var/lib/thinclone", "pool_lvm");
        let runner: Arc<dyn CommandRunner> = Arc::new(ScriptedRunner::default());
        let err = LvmManager::new(Arc::new(pool), runner, &ManagerConfig::default()).unwrap_err();
        assert!(matches!(err, ThincloneError::Config { .. }));
    }

    #[tokio::test]
    async fn pool_exposes_one_data_snapshot() {
        let (manager, _) = manager(ScriptedRunner::default().reply("lvs", "  data\n  tc.main.c1.r0\n"));
        manager.refresh_snapshot_list().await.unwrap();

        let list = manager.snapshot_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "vg_pool@snapshot_20240101000000");
        assert_eq!(list[0].num_clones, 1);

        let branches = manager.list_branches().await.unwrap();
        assert_eq!(branches[DEFAULT_BRANCH], list[0].id);
        assert_eq!(
            manager.has_dependent_entity(&list[0].id).await.unwrap(),
            ["tc.main.c1.r0"]
        );
    }

    #[tokio::test]
    async fn clone_is_an_lvm_snapshot() {
        let (manager, runner) = manager(ScriptedRunner::default());
        manager.refresh_snapshot_list().await.unwrap();
        manager
            .create_clone("main", "c1", "vg_pool@snapshot_20240101000000", 0)
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls.contains(
            &"lvcreate --snapshot --extents 10%ORIGIN --name tc.main.c1.r0 vg_pool/data".to_string()
        ));
        assert!(calls.contains(
            &"mount /dev/vg_pool/tc.main.c1.r0 /var/lib/thinclone/pool_lvm/clones/main/c1/r0"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn unknown_snapshot_is_rejected() {
        let (manager, runner) = manager(ScriptedRunner::default());
        let err = manager
            .create_clone("main", "c1", "vg_pool@other", 0)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_mount_removes_the_volume() {
        let (manager, runner) = manager(ScriptedRunner::default().fail("mount", "no such device"));
        let err = manager
            .create_clone("main", "c1", "vg_pool@snapshot_20240101000000", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ThincloneError::Command { .. }));
        assert!(runner
            .calls()
            .contains(&"lvremove -y vg_pool/tc.main.c1.r0".to_string()));
    }

    #[test_log::test(tokio::test)]
    async fn failed_volume_removal_keeps_the_mount_error() {
        let (manager, runner) = manager(
            ScriptedRunner::default()
                .fail("mount", "no such device")
                .fail("lvremove", "logical volume in use"),
        );
        let err = manager
            .create_clone("main", "c1", "vg_pool@snapshot_20240101000000", 0)
            .await
            .unwrap_err();
        match err {
            ThincloneError::Command { program, stderr, .. } => {
                assert_eq!(program, "mount");
                assert_eq!(stderr, "no such device");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(runner.calls().iter().any(|c| c.starts_with("lvremove")));
    }

    #[tokio::test]
    async fn revision_zero_removes_every_revision() {
        let (manager, runner) = manager(
            ScriptedRunner::default().reply("lvs", "tc.main.c1.r0\ntc.main.c1.r1\ntc.main.c2.r0\n"),
        );
        manager.destroy_clone("main", "c1", 0).await.unwrap();

        let removed: Vec<String> = runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("lvremove"))
            .collect();
        assert_eq!(
            removed,
            ["lvremove -y vg_pool/tc.main.c1.r0", "lvremove -y vg_pool/tc.main.c1.r1"]
        );
    }

    #[tokio::test]
    async fn branching_is_limited() {
        let (manager, _) = manager(ScriptedRunner::default());
        assert!(matches!(
            manager.create_branch("dev", "vg_pool@x").await.unwrap_err(),
            ThincloneError::Unsupported { .. }
        ));
        manager.init_branching().await.unwrap();
        assert!(manager.cleanup_snapshots(1, SnapshotKind::Data).await.unwrap().is_empty());
    }
}
