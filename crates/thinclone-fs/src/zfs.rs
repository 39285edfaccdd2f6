//! ZFS backend.
//!
//! Clones are ZFS clones of pool snapshots laid out as
//! `<pool>/branch/<branch>/<clone>/r<revision>`. Branch and lineage metadata
//! is stored in `thinclone:*` user properties on snapshots.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thinclone_common::id::validate_name;
use thinclone_common::{ThincloneError, ThincloneResult};

use crate::branching::{
    self, BRANCH_PROP, BranchEntity, CHILD_PROP, CloneDataset, DEFAULT_BRANCH, DSA_PROP,
    DestroyOptions, MESSAGE_PROP, PARENT_PROP, ROOT_PROP, RelationSource, Repo, ResetOptions,
    SnapshotDetails, SnapshotRelations, add_to_list, parse_list, parse_optional, remove_from_list,
};
use crate::exec::{CommandRunner, args, shell_quote};
use crate::manager::{
    Branching, Cloner, ManagerConfig, Pooler, Snapshotter, StateReporter, init_default_branch,
    retain_latest,
};
use crate::pool::{BRANCH_DATASET, Pool, parse_clone_dataset};
use crate::snapshot::{
    FilesystemState, SNAPSHOT_PREFIX, SessionState, Snapshot, SnapshotKind, format_dsa, parse_dsa,
    sort_newest_first,
};

const ZFS: &str = "zfs";

/// Whether a command failed because the target does not exist.
fn is_missing(err: &ThincloneError) -> bool {
    matches!(err, ThincloneError::Command { stderr, .. } if stderr.contains("does not exist"))
}

fn parse_u64(value: &str) -> u64 {
    value.trim().parse().unwrap_or_default()
}

/// ZFS filesystem manager.
#[derive(Debug)]
pub struct ZfsManager {
    pool: Arc<Pool>,
    config: ManagerConfig,
    runner: Arc<dyn CommandRunner>,
    snapshots: RwLock<Vec<Snapshot>>,
}

impl ZfsManager {
    /// Create a manager for `pool` running `zfs` through `runner`.
    #[must_use]
    pub fn new(pool: Arc<Pool>, runner: Arc<dyn CommandRunner>, config: ManagerConfig) -> Self {
        Self {
            pool,
            config,
            runner,
            snapshots: RwLock::new(Vec::new()),
        }
    }

    async fn zfs<I, S>(&self, items: I) -> ThincloneResult<String>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        self.runner.run(ZFS, &args(items)).await
    }

    async fn get_prop(&self, prop: &str, name: &str) -> ThincloneResult<String> {
        let out = self.zfs(["get", "-H", "-o", "value", prop, name]).await?;
        Ok(out.trim().to_string())
    }

    /// Set a user property, clearing it when `value` is empty.
    async fn set_prop(&self, prop: &str, value: &str, name: &str) -> ThincloneResult<()> {
        if value.is_empty() {
            self.zfs(["inherit", prop, name]).await?;
        } else {
            self.zfs(["set".to_string(), format!("{prop}={value}"), name.to_string()])
                .await?;
        }
        Ok(())
    }

    async fn update_list_prop(
        &self,
        prop: &str,
        name: &str,
        update: impl FnOnce(&str) -> String + Send,
    ) -> ThincloneResult<()> {
        let current = self
            .get_prop(prop, name)
            .await
            .map_err(|e| self.not_found(e, name))?;
        let updated = update(&current);
        self.set_prop(prop, &updated, name).await
    }

    fn not_found(&self, err: ThincloneError, snapshot: &str) -> ThincloneError {
        if is_missing(&err) {
            ThincloneError::SnapshotNotFound {
                id: snapshot.to_string(),
            }
        } else {
            err
        }
    }

    async fn snapshot_exists(&self, name: &str) -> ThincloneResult<bool> {
        match self.zfs(["list", "-H", "-o", "name", "-t", "snapshot", name]).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Snapshot rows of the pool, each split into its tab-separated columns.
    async fn snapshot_rows(&self, columns: &str) -> ThincloneResult<Vec<Vec<String>>> {
        let out = self
            .zfs(["list", "-H", "-p", "-o", columns, "-t", "snapshot", "-r", self.pool.name.as_str()])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split('\t').map(ToString::to_string).collect())
            .collect())
    }

    async fn list_snapshots(&self) -> ThincloneResult<Vec<Snapshot>> {
        let rows = self
            .snapshot_rows("name,creation,used,logicalreferenced,clones,thinclone:dsa,thinclone:message")
            .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let [name, creation, used, logical, clones, dsa, message] = row.as_slice() else {
                tracing::warn!(pool = %self.pool.name, row = ?row, "Skipping malformed snapshot row");
                continue;
            };

            let created_at = creation
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .unwrap_or_default();

            snapshots.push(Snapshot {
                id: name.clone(),
                pool: self.pool.name.clone(),
                created_at,
                data_state_at: parse_optional(dsa).and_then(|v| parse_dsa(&v).ok()),
                num_clones: parse_list(clones).len(),
                physical_size: parse_u64(used),
                logical_size: parse_u64(logical),
                message: parse_optional(message),
            });
        }

        sort_newest_first(&mut snapshots);
        Ok(snapshots)
    }

    fn branch_dataset(&self, branch: &str) -> String {
        format!("{}/{BRANCH_DATASET}/{branch}", self.pool.name)
    }
}

impl Pooler for ZfsManager {
    fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }
}

#[async_trait]
impl RelationSource for ZfsManager {
    async fn relations(&self, snapshot: &str) -> ThincloneResult<SnapshotRelations> {
        let out = self
            .zfs([
                "get",
                "-H",
                "-o",
                "property,value",
                "clones,thinclone:branch,thinclone:root,thinclone:child",
                snapshot,
            ])
            .await
            .map_err(|e| self.not_found(e, snapshot))?;

        let mut relations = SnapshotRelations::default();
        for line in out.lines() {
            let Some((prop, value)) = line.split_once('\t') else {
                continue;
            };
            let values = parse_list(value);
            match prop.trim() {
                "clones" => relations.clones = values,
                BRANCH_PROP => relations.branches = values,
                ROOT_PROP => relations.roots = values,
                CHILD_PROP => relations.children = values,
                _ => {}
            }
        }
        Ok(relations)
    }
}

#[async_trait]
impl Cloner for ZfsManager {
    async fn create_clone(
        &self,
        branch: &str,
        name: &str,
        snapshot_id: &str,
        revision: u32,
    ) -> ThincloneResult<()> {
        validate_name(branch)?;
        validate_name(name)?;

        if !self.snapshot_exists(snapshot_id).await? {
            return Err(ThincloneError::SnapshotNotFound {
                id: snapshot_id.to_string(),
            });
        }

        let dataset = self.pool.clone_dataset(branch, name, revision);
        let mountpoint = self.pool.clone_mountpoint(branch, name, revision);
        self.zfs([
            "clone".to_string(),
            "-p".to_string(),
            "-o".to_string(),
            format!("mountpoint={}", mountpoint.display()),
            snapshot_id.to_string(),
            dataset.clone(),
        ])
        .await?;

        tracing::info!(pool = %self.pool.name, dataset = %dataset, snapshot = snapshot_id, "Created clone");
        self.refresh_snapshot_list().await
    }

    async fn destroy_clone(&self, branch: &str, name: &str, revision: u32) -> ThincloneResult<()> {
        let result = if revision == branching::DEFAULT_REVISION {
            let base = self.pool.clone_base_dataset(branch, name);
            self.zfs(["destroy", "-r", base.as_str()]).await
        } else {
            let dataset = self.pool.clone_dataset(branch, name, revision);
            self.zfs(["destroy", dataset.as_str()]).await
        };

        match result {
            Ok(_) => {}
            Err(e) if is_missing(&e) => {
                return Err(ThincloneError::CloneNotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        tracing::info!(pool = %self.pool.name, branch, clone = name, revision, "Destroyed clone");
        self.refresh_snapshot_list().await
    }

    async fn list_clones(&self) -> ThincloneResult<Vec<CloneDataset>> {
        let out = self
            .zfs(["list", "-H", "-o", "name", "-t", "filesystem", "-r", self.pool.name.as_str()])
            .await?;

        Ok(out
            .lines()
            .filter_map(|line| parse_clone_dataset(&self.pool.name, line.trim()))
            .map(|(branch, name, revision)| CloneDataset {
                branch,
                name,
                revision,
            })
            .collect())
    }
}

#[async_trait]
impl Snapshotter for ZfsManager {
    async fn create_snapshot(&self, suffix: &str, data_state_at: &str) -> ThincloneResult<String> {
        let dsa = if data_state_at.is_empty() {
            format_dsa(Utc::now())
        } else {
            data_state_at.to_string()
        };
        let name = format!("{}@{SNAPSHOT_PREFIX}{dsa}{suffix}", self.pool.name);

        if self.snapshot_exists(&name).await? {
            return Err(ThincloneError::SnapshotExists { name });
        }

        self.zfs(["snapshot", name.as_str()]).await?;
        if !data_state_at.is_empty() {
            self.set_dsa(data_state_at, &name).await?;
        }

        tracing::info!(pool = %self.pool.name, snapshot = %name, "Created snapshot");
        self.refresh_snapshot_list().await?;
        Ok(name)
    }

    async fn destroy_snapshot(&self, name: &str, opts: DestroyOptions) -> ThincloneResult<()> {
        if !opts.force {
            let dependents = self.has_dependent_entity(name).await?;
            if !dependents.is_empty() {
                return Err(ThincloneError::HasDependents {
                    entity: name.to_string(),
                    dependents,
                });
            }
        }

        let parent = parse_optional(&self.get_prop(PARENT_PROP, name).await.map_err(|e| self.not_found(e, name))?);
        let children = parse_list(&self.get_prop(CHILD_PROP, name).await?);

        if opts.force {
            self.zfs(["destroy", "-R", name]).await?;
        } else {
            self.zfs(["destroy", name]).await?;
        }

        if let Some(parent) = parent {
            if let Err(e) = self.delete_child_prop(name, &parent).await {
                tracing::warn!(snapshot = name, parent = %parent, error = %e, "Failed to unlink snapshot from parent");
            }
        }
        for child in children {
            if let Err(e) = self.set_prop(PARENT_PROP, "", &child).await {
                tracing::warn!(snapshot = name, child = %child, error = %e, "Failed to unlink child snapshot");
            }
        }

        tracing::info!(pool = %self.pool.name, snapshot = name, "Destroyed snapshot");
        self.refresh_snapshot_list().await
    }

    async fn cleanup_snapshots(
        &self,
        retention_limit: usize,
        kind: SnapshotKind,
    ) -> ThincloneResult<Vec<String>> {
        retain_latest(self, &self.config.pre_snapshot_suffix, retention_limit, kind).await
    }

    fn snapshot_list(&self) -> Vec<Snapshot> {
        self.snapshots.read().clone()
    }

    async fn refresh_snapshot_list(&self) -> ThincloneResult<()> {
        let snapshots = self.list_snapshots().await?;
        tracing::debug!(pool = %self.pool.name, count = snapshots.len(), "Refreshed snapshot list");
        *self.snapshots.write() = snapshots;
        Ok(())
    }
}

#[async_trait]
impl StateReporter for ZfsManager {
    async fn get_session_state(&self, branch: &str, clone: &str) -> ThincloneResult<SessionState> {
        let base = self.pool.clone_base_dataset(branch, clone);
        let out = match self
            .zfs(["get", "-H", "-p", "-o", "value", "used,logicalreferenced", base.as_str()])
            .await
        {
            Ok(out) => out,
            Err(e) if is_missing(&e) => {
                return Err(ThincloneError::CloneNotFound {
                    name: clone.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let values: Vec<u64> = out.lines().map(parse_u64).collect();
        Ok(SessionState {
            clone_diff_size: values.first().copied().unwrap_or_default(),
            logical_size: values.get(1).copied().unwrap_or_default(),
        })
    }

    async fn get_filesystem_state(&self) -> ThincloneResult<FilesystemState> {
        let out = self
            .zfs([
                "get",
                "-H",
                "-p",
                "-o",
                "value",
                "used,available,usedbysnapshots,usedbychildren,compressratio",
                self.pool.name.as_str(),
            ])
            .await?;

        let values: Vec<&str> = out.lines().map(str::trim).collect();
        let [used, available, by_snapshots, by_children, ratio] = values.as_slice() else {
            return Err(ThincloneError::Internal {
                message: format!("unexpected zfs get output for {}: {out:?}", self.pool.name),
            });
        };

        let used = parse_u64(used);
        let free = parse_u64(available);
        Ok(FilesystemState {
            size: used + free,
            free,
            used,
            used_by_snapshots: parse_u64(by_snapshots),
            used_by_clones: parse_u64(by_children),
            compress_ratio: ratio.trim_end_matches('x').parse().unwrap_or(1.0),
        })
    }
}

#[async_trait]
impl Branching for ZfsManager {
    async fn init_branching(&self) -> ThincloneResult<()> {
        self.zfs(["create", "-p", self.branch_dataset(DEFAULT_BRANCH).as_str()])
            .await?;
        init_default_branch(self, &self.config.pre_snapshot_suffix).await
    }

    async fn verify_branch_metadata(&self) -> ThincloneResult<()> {
        if self.list_branches().await?.is_empty() {
            tracing::warn!(pool = %self.pool.name, "Branch metadata missing, re-initializing");
            return self.init_branching().await;
        }
        Ok(())
    }

    async fn create_branch(&self, branch: &str, snapshot_id: &str) -> ThincloneResult<()> {
        validate_name(branch)?;
        if self.list_branches().await?.contains_key(branch) {
            return Err(ThincloneError::BranchExists {
                name: branch.to_string(),
            });
        }

        self.zfs(["create", "-p", self.branch_dataset(branch).as_str()]).await?;
        self.add_branch_prop(branch, snapshot_id).await?;
        self.set_root(branch, snapshot_id).await?;

        tracing::info!(pool = %self.pool.name, branch, snapshot = snapshot_id, "Created branch");
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> ThincloneResult<()> {
        if branch == DEFAULT_BRANCH {
            return Err(ThincloneError::Config {
                message: format!("branch {DEFAULT_BRANCH} cannot be deleted"),
            });
        }

        let repo = self.get_repo().await?;
        let head = repo
            .branches
            .get(branch)
            .ok_or_else(|| ThincloneError::BranchNotFound {
                name: branch.to_string(),
            })?;

        let clones: Vec<String> = self
            .list_clones()
            .await?
            .into_iter()
            .filter(|c| c.branch == branch)
            .map(|c| c.name)
            .collect();
        if !clones.is_empty() {
            return Err(ThincloneError::HasDependents {
                entity: format!("branch {branch}"),
                dependents: clones,
            });
        }

        self.delete_branch_prop(branch, head).await?;
        for details in repo.snapshots.values().filter(|s| s.roots.iter().any(|r| r == branch)) {
            self.delete_root_prop(branch, &details.id).await?;
        }

        match self.zfs(["destroy", "-r", self.branch_dataset(branch).as_str()]).await {
            Ok(_) => {}
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(pool = %self.pool.name, branch, "Deleted branch");
        Ok(())
    }

    async fn list_branches(&self) -> ThincloneResult<BTreeMap<String, String>> {
        let mut branches = BTreeMap::new();
        for row in self.snapshot_rows("name,thinclone:branch").await? {
            if let [name, value] = row.as_slice() {
                for branch in parse_list(value) {
                    branches.insert(branch, name.clone());
                }
            }
        }
        Ok(branches)
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
        let rows = self
            .snapshot_rows(
                "name,thinclone:parent,thinclone:child,thinclone:branch,thinclone:root,thinclone:dsa,thinclone:message",
            )
            .await?;

        let mut repo = Repo::default();
        for row in rows {
            let [id, parent, children, branches, roots, dsa, message] = row.as_slice() else {
                continue;
            };

            let details = SnapshotDetails {
                id: id.clone(),
                parent: parse_optional(parent),
                children: parse_list(children),
                branches: parse_list(branches),
                roots: parse_list(roots),
                data_state_at: parse_optional(dsa),
                message: parse_optional(message),
            };
            for branch in &details.branches {
                repo.branches.insert(branch.clone(), id.clone());
            }
            repo.snapshots.insert(id.clone(), details);
        }
        Ok(repo)
    }

    async fn set_relation(&self, parent: &str, child: &str) -> ThincloneResult<()> {
        self.set_prop(PARENT_PROP, parent, child).await?;
        self.update_list_prop(CHILD_PROP, parent, |v| add_to_list(v, child))
            .await
    }

    async fn snapshot(&self, snapshot_name: &str) -> ThincloneResult<()> {
        self.zfs(["snapshot", snapshot_name]).await?;
        Ok(())
    }

    async fn move_to(
        &self,
        base_snapshot: &str,
        current_snapshot: &str,
        target: &str,
    ) -> ThincloneResult<()> {
        let pipeline = format!(
            "zfs send -I {} {} | zfs receive -F {}",
            shell_quote(base_snapshot),
            shell_quote(current_snapshot),
            shell_quote(target)
        );
        self.runner.run("sh", &args(["-c".to_string(), pipeline])).await?;

        tracing::info!(from = base_snapshot, to = current_snapshot, target, "Moved snapshot delta");
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> ThincloneResult<()> {
        self.zfs(["rename", old_name, new_name]).await?;
        Ok(())
    }

    async fn set_mountpoint(&self, path: &Path, name: &str) -> ThincloneResult<()> {
        self.zfs([
            "set".to_string(),
            format!("mountpoint={}", path.display()),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn set_dsa(&self, dsa: &str, snapshot_name: &str) -> ThincloneResult<()> {
        self.set_prop(DSA_PROP, dsa, snapshot_name).await
    }

    async fn set_message(&self, message: &str, snapshot_name: &str) -> ThincloneResult<()> {
        self.set_prop(MESSAGE_PROP, message, snapshot_name).await
    }

    async fn reset(&self, snapshot_id: &str, opts: ResetOptions) -> ThincloneResult<()> {
        if opts.recursive {
            self.zfs(["rollback", "-r", snapshot_id]).await?;
        } else {
            self.zfs(["rollback", snapshot_id]).await?;
        }

        tracing::info!(pool = %self.pool.name, snapshot = snapshot_id, "Reset dataset");
        Ok(())
    }

    async fn has_dependent_entity(&self, snapshot_name: &str) -> ThincloneResult<Vec<String>> {
        branching::dependents_of(self, snapshot_name).await
    }

    async fn clone_dependents(
        &self,
        branch: &str,
        name: &str,
        revision: u32,
    ) -> ThincloneResult<Vec<String>> {
        let dataset = self.pool.clone_dataset(branch, name, revision);
        let out = match self
            .zfs(["list", "-H", "-o", "name", "-t", "snapshot", "-d", "1", dataset.as_str()])
            .await
        {
            Ok(out) => out,
            Err(e) if is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dependents = Vec::new();
        for snapshot in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            dependents.extend(self.has_dependent_entity(snapshot).await?);
        }
        Ok(dependents)
    }

    async fn add_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.update_list_prop(BRANCH_PROP, dataset, |v| add_to_list(v, branch))
            .await
    }

    async fn delete_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.update_list_prop(BRANCH_PROP, dataset, |v| remove_from_list(v, branch))
            .await
    }

    async fn delete_child_prop(&self, child: &str, dataset: &str) -> ThincloneResult<()> {
        self.update_list_prop(CHILD_PROP, dataset, |v| remove_from_list(v, child))
            .await
    }

    async fn delete_root_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.update_list_prop(ROOT_PROP, dataset, |v| remove_from_list(v, branch))
            .await
    }

    async fn set_root(&self, branch: &str, snapshot: &str) -> ThincloneResult<()> {
        self.update_list_prop(ROOT_PROP, snapshot, |v| add_to_list(v, branch))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::pool::PoolMode;

    fn manager(runner: ScriptedRunner) -> (ZfsManager, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let pool = Pool::new("pool_1", PoolMode::Zfs, "/var/lib/thinclone", "pool_1");
        let manager = ZfsManager::new(
            Arc::new(pool),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            ManagerConfig {
                pre_snapshot_suffix: "_pre".to_string(),
                ..ManagerConfig::default()
            },
        );
        (manager, runner)
    }

    #[tokio::test]
    async fn snapshot_list_is_parsed_and_sorted() {
        let (manager, _) = manager(ScriptedRunner::default().reply(
            "zfs list -H -p -o name,creation",
            "pool_1@snapshot_20240101000000\t1704067300\t1024\t4096\t-\t20240101000000\t-\n\
             pool_1@snapshot_20240102000000\t1704153700\t2048\t8192\tpool_1/branch/main/c1/r0\t20240102000000\tnightly\n\
             pool_1@manual\t1704200000\t0\t0\t-\t-\t-\n",
        ));

        manager.refresh_snapshot_list().await.unwrap();
        let list = manager.snapshot_list();

        let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            ["pool_1@snapshot_20240102000000", "pool_1@snapshot_20240101000000", "pool_1@manual"]
        );
        assert_eq!(list[0].num_clones, 1);
        assert_eq!(list[0].physical_size, 2048);
        assert_eq!(list[0].message.as_deref(), Some("nightly"));
        assert!(list[2].data_state_at.is_none());
    }

    #[tokio::test]
    async fn clone_is_mounted_under_the_pool() {
        let (manager, runner) = manager(ScriptedRunner::default());
        manager
            .create_clone("main", "c1", "pool_1@snapshot_20240101000000", 0)
            .await
            .unwrap();

        assert!(runner.calls().contains(
            &"zfs clone -p -o mountpoint=/var/lib/thinclone/pool_1/clones/main/c1/r0 \
              pool_1@snapshot_20240101000000 pool_1/branch/main/c1/r0"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn clone_from_missing_snapshot_is_rejected() {
        let (manager, runner) = manager(ScriptedRunner::default().fail(
            "zfs list -H -o name -t snapshot",
            "cannot open 'pool_1@gone': dataset does not exist",
        ));

        let err = manager
            .create_clone("main", "c1", "pool_1@gone", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ThincloneError::SnapshotNotFound { .. }));
        assert!(!runner.calls().iter().any(|c| c.starts_with("zfs clone")));
    }

    #[tokio::test]
    async fn revision_zero_destroys_recursively() {
        let (manager, runner) = manager(ScriptedRunner::default());
        manager.destroy_clone("main", "c1", 0).await.unwrap();
        manager.destroy_clone("main", "c1", 2).await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"zfs destroy -r pool_1/branch/main/c1".to_string()));
        assert!(calls.contains(&"zfs destroy pool_1/branch/main/c1/r2".to_string()));
    }

    #[tokio::test]
    async fn snapshot_with_clone_is_not_destroyed() {
        let (manager, runner) = manager(ScriptedRunner::default().reply(
            "zfs get -H -o property,value",
            "clones\tpool_1/branch/main/c1/r0\nthinclone:branch\t-\nthinclone:root\t-\nthinclone:child\t-\n",
        ));

        let err = manager
            .destroy_snapshot("pool_1@snapshot_20240101000000", DestroyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ThincloneError::HasDependents { .. }));
        assert!(!runner.calls().iter().any(|c| c.starts_with("zfs destroy")));
    }

    #[tokio::test]
    async fn destroyed_root_snapshot_is_unlinked_from_children() {
        let (manager, runner) = manager(
            ScriptedRunner::default()
                .reply(
                    "zfs get -H -o property,value",
                    "clones\t\nthinclone:branch\t-\nthinclone:root\tmain\nthinclone:child\tpool_1@b\n",
                )
                .reply("zfs get -H -o value thinclone:child", "pool_1@b\n"),
        );

        manager
            .destroy_snapshot("pool_1@a", DestroyOptions::default())
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"zfs destroy pool_1@a".to_string()));
        assert!(calls.contains(&"zfs inherit thinclone:parent pool_1@b".to_string()));
    }

    #[tokio::test]
    async fn existing_snapshot_is_reported() {
        let (manager, _) = manager(
            ScriptedRunner::default().reply("zfs list -H -o name -t snapshot", "pool_1@snapshot_20240101000000\n"),
        );

        let err = manager
            .create_snapshot("", "20240101000000")
            .await
            .unwrap_err();
        assert!(matches!(err, ThincloneError::SnapshotExists { .. }));
    }

    #[tokio::test]
    async fn branch_prop_is_read_modified_written() {
        let (manager, runner) = manager(
            ScriptedRunner::default().reply("zfs get -H -o value thinclone:branch", "main\n"),
        );

        manager.add_branch_prop("dev", "pool_1@a").await.unwrap();
        manager.delete_branch_prop("main", "pool_1@b").await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"zfs set thinclone:branch=main,dev pool_1@a".to_string()));
        assert!(calls.contains(&"zfs inherit thinclone:branch pool_1@b".to_string()));
    }

    #[tokio::test]
    async fn filesystem_state_is_parsed() {
        let (manager, _) = manager(
            ScriptedRunner::default().reply("zfs get -H -p -o value used,available", "100\n900\n10\n50\n1.50x\n"),
        );

        let state = manager.get_filesystem_state().await.unwrap();
        assert_eq!(state.size, 1000);
        assert_eq!(state.free, 900);
        assert_eq!(state.used_by_clones, 50);
        assert!((state.compress_ratio - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn move_quotes_every_operand() {
        let (manager, runner) = manager(ScriptedRunner::default());
        manager
            .move_to("pool_1@a", "pool_1@b", "pool_2")
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["sh -c zfs send -I 'pool_1@a' 'pool_1@b' | zfs receive -F 'pool_2'"]
        );
    }
}
