//! Filesystem manager capability contract.
//!
//! A backend implements five small capability traits. Callers only ever hold
//! an `Arc<dyn FsManager>`, never a concrete backend.
//!
//! The contract, regardless of backend:
//! - creating a clone requires an existing snapshot
//! - destroying a snapshot requires it to have no dependents
//! - a branch's history is reachable by walking branch -> snapshot -> parent
//!
//! Managers give no concurrency guarantee beyond what the backend offers:
//! callers must not run conflicting mutations on the same clone concurrently.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thinclone_common::ThincloneResult;

use crate::branching::{BranchEntity, CloneDataset, DestroyOptions, Repo, ResetOptions};
use crate::pool::Pool;
use crate::snapshot::{FilesystemState, SessionState, Snapshot, SnapshotKind};

/// Backend construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Suffix marking pre-snapshots (e.g. `_pre`).
    pub pre_snapshot_suffix: String,
    /// LVM volume group holding the pool volume.
    pub volume_group: Option<String>,
    /// LVM logical volume holding the pool data.
    pub logical_volume: Option<String>,
}

/// Access to the owning pool.
pub trait Pooler: Send + Sync {
    /// The pool this manager operates on.
    fn pool(&self) -> Arc<Pool>;
}

/// Thin clone management.
#[async_trait]
pub trait Cloner: Send + Sync {
    /// Materialize a writable clone revision from `snapshot_id`.
    ///
    /// Fails with a not-found error if the snapshot does not exist.
    async fn create_clone(
        &self,
        branch: &str,
        name: &str,
        snapshot_id: &str,
        revision: u32,
    ) -> ThincloneResult<()>;

    /// Destroy a clone revision.
    ///
    /// Revision 0 destroys the clone's dataset including every revision.
    async fn destroy_clone(&self, branch: &str, name: &str, revision: u32)
    -> ThincloneResult<()>;

    /// Every clone revision in the pool.
    async fn list_clones(&self) -> ThincloneResult<Vec<CloneDataset>>;

    /// Names of clones in the pool, without duplicates.
    async fn list_clones_names(&self) -> ThincloneResult<Vec<String>> {
        let mut names: Vec<String> = self
            .list_clones()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Snapshot management.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Cut a snapshot of the pool data as of `data_state_at`.
    ///
    /// Fails with [`ThincloneError::SnapshotExists`](thinclone_common::ThincloneError::SnapshotExists)
    /// if a snapshot for the same data state already exists.
    async fn create_snapshot(&self, suffix: &str, data_state_at: &str) -> ThincloneResult<String>;

    /// Destroy a snapshot, refusing if it has dependents unless forced.
    async fn destroy_snapshot(&self, name: &str, opts: DestroyOptions) -> ThincloneResult<()>;

    /// Keep the `retention_limit` most recent snapshots of `kind`.
    ///
    /// Snapshots with dependents are skipped. Returns the destroyed names.
    async fn cleanup_snapshots(
        &self,
        retention_limit: usize,
        kind: SnapshotKind,
    ) -> ThincloneResult<Vec<String>>;

    /// Cached snapshot list.
    fn snapshot_list(&self) -> Vec<Snapshot>;

    /// Reload the snapshot list from the backend.
    async fn refresh_snapshot_list(&self) -> ThincloneResult<()>;
}

/// Space accounting.
#[async_trait]
pub trait StateReporter: Send + Sync {
    /// Space used by one clone.
    async fn get_session_state(&self, branch: &str, clone: &str) -> ThincloneResult<SessionState>;

    /// Space accounting of the whole pool.
    async fn get_filesystem_state(&self) -> ThincloneResult<FilesystemState>;
}

/// Branch and lineage metadata.
#[async_trait]
pub trait Branching: Send + Sync {
    /// Set up branch metadata; idempotent.
    async fn init_branching(&self) -> ThincloneResult<()>;

    /// Repair branch metadata if it is missing.
    async fn verify_branch_metadata(&self) -> ThincloneResult<()>;

    /// Create a branch pointing at `snapshot_id`.
    async fn create_branch(&self, branch: &str, snapshot_id: &str) -> ThincloneResult<()>;

    /// Delete a branch that has no clones.
    async fn delete_branch(&self, branch: &str) -> ThincloneResult<()>;

    /// Branch heads by branch name.
    async fn list_branches(&self) -> ThincloneResult<BTreeMap<String, String>>;

    /// Every branch, sorted by name.
    async fn list_all_branches(&self) -> ThincloneResult<Vec<BranchEntity>>;

    /// Full relationship graph.
    async fn get_repo(&self) -> ThincloneResult<Repo>;

    /// Record `child` as a successor of `parent`.
    async fn set_relation(&self, parent: &str, child: &str) -> ThincloneResult<()>;

    /// Cut a snapshot with an explicit name.
    async fn snapshot(&self, snapshot_name: &str) -> ThincloneResult<()>;

    /// Replay the changes between two snapshots onto `target`.
    async fn move_to(&self, base_snapshot: &str, current_snapshot: &str, target: &str)
    -> ThincloneResult<()>;

    /// Rename a dataset or snapshot.
    async fn rename(&self, old_name: &str, new_name: &str) -> ThincloneResult<()>;

    /// Change the mount point of a dataset.
    async fn set_mountpoint(&self, path: &Path, name: &str) -> ThincloneResult<()>;

    /// Record the data state of a snapshot.
    async fn set_dsa(&self, dsa: &str, snapshot_name: &str) -> ThincloneResult<()>;

    /// Record a commit message on a snapshot.
    async fn set_message(&self, message: &str, snapshot_name: &str) -> ThincloneResult<()>;

    /// Roll a dataset back to `snapshot_id`.
    async fn reset(&self, snapshot_id: &str, opts: ResetOptions) -> ThincloneResult<()>;

    /// Entities depending on a snapshot; empty means it can be destroyed.
    async fn has_dependent_entity(&self, snapshot_name: &str) -> ThincloneResult<Vec<String>>;

    /// Entities depending on snapshots taken from a clone revision.
    async fn clone_dependents(
        &self,
        branch: &str,
        name: &str,
        revision: u32,
    ) -> ThincloneResult<Vec<String>>;

    /// Mark `dataset` as the head of `branch`.
    async fn add_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()>;

    /// Unmark `dataset` as the head of `branch`.
    async fn delete_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()>;

    /// Remove `child` from the children of `dataset`.
    async fn delete_child_prop(&self, child: &str, dataset: &str) -> ThincloneResult<()>;

    /// Unmark `dataset` as the root of `branch`.
    async fn delete_root_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()>;

    /// Mark `snapshot` as the root of `branch`.
    async fn set_root(&self, branch: &str, snapshot: &str) -> ThincloneResult<()>;
}

/// A complete filesystem manager.
pub trait FsManager:
    Pooler + Cloner + Snapshotter + StateReporter + Branching + std::fmt::Debug
{
}

impl<T> FsManager for T where
    T: Pooler + Cloner + Snapshotter + StateReporter + Branching + std::fmt::Debug
{
}

/// Destroy all but the `retention_limit` most recent snapshots of `kind`.
///
/// Snapshots with dependents are logged and skipped. Destroyed snapshots are
/// spliced out of the branch lineage first.
pub(crate) async fn retain_latest<M>(
    manager: &M,
    pre_suffix: &str,
    retention_limit: usize,
    kind: SnapshotKind,
) -> ThincloneResult<Vec<String>>
where
    M: Pooler + Snapshotter + Branching + ?Sized,
{
    let pool = manager.pool();
    let mut candidates: Vec<Snapshot> = manager
        .snapshot_list()
        .into_iter()
        .filter(|s| SnapshotKind::classify(&pool.name, &s.id, pre_suffix) == kind)
        .collect();
    crate::snapshot::sort_newest_first(&mut candidates);

    let mut destroyed = Vec::new();
    for snapshot in candidates.into_iter().skip(retention_limit) {
        let dependents = manager.has_dependent_entity(&snapshot.id).await?;
        if !dependents.is_empty() {
            tracing::warn!(
                pool = %pool.name,
                snapshot = %snapshot.id,
                dependents = ?dependents,
                "Skipping snapshot cleanup, snapshot has dependents"
            );
            continue;
        }

        crate::branching::splice_out(manager, &snapshot.id).await?;
        manager
            .destroy_snapshot(&snapshot.id, DestroyOptions::default())
            .await?;
        destroyed.push(snapshot.id);
    }

    if !destroyed.is_empty() {
        tracing::info!(pool = %pool.name, count = destroyed.len(), ?kind, "Cleaned up snapshots");
    }
    Ok(destroyed)
}

/// Chain the pool's data snapshots into the default branch.
///
/// Snapshots are linked oldest to newest, the newest becomes the head of the
/// default branch and the oldest its root. Does nothing if any branch exists.
pub(crate) async fn init_default_branch<M>(manager: &M, pre_suffix: &str) -> ThincloneResult<()>
where
    M: Pooler + Snapshotter + Branching + ?Sized,
{
    let pool = manager.pool();
    if !manager.list_branches().await?.is_empty() {
        tracing::debug!(pool = %pool.name, "Branch metadata already initialized");
        return Ok(());
    }

    let mut data: Vec<Snapshot> = manager
        .snapshot_list()
        .into_iter()
        .filter(|s| SnapshotKind::classify(&pool.name, &s.id, pre_suffix) == SnapshotKind::Data)
        .collect();
    crate::snapshot::sort_newest_first(&mut data);
    data.reverse();

    let (Some(oldest), Some(latest)) = (data.first(), data.last()) else {
        return Ok(());
    };

    for pair in data.windows(2) {
        manager.set_relation(&pair[0].id, &pair[1].id).await?;
    }
    manager
        .add_branch_prop(crate::branching::DEFAULT_BRANCH, &latest.id)
        .await?;
    manager
        .set_root(crate::branching::DEFAULT_BRANCH, &oldest.id)
        .await?;

    tracing::info!(pool = %pool.name, head = %latest.id, "Initialized branching");
    Ok(())
}
