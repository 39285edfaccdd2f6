//! Branch, revision and snapshot lineage model.
//!
//! Lineage is recorded as properties on snapshots:
//!
//! - `branch`: branches whose head is this snapshot
//! - `root`: branches created from this snapshot
//! - `parent` / `child`: commit lineage
//!
//! Higher-level operations such as [`commit`] and [`move_branch_head`] are
//! composed from the low-level [`Branching`](crate::Branching) primitives so
//! every backend gets them for free.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thinclone_common::{ThincloneError, ThincloneResult};

use crate::manager::{Branching, FsManager};
use crate::snapshot::format_dsa;

/// Branch every pool starts with.
pub const DEFAULT_BRANCH: &str = "main";

/// Base revision of a clone.
pub const DEFAULT_REVISION: u32 = 0;

/// Property listing branches whose head is the snapshot.
pub const BRANCH_PROP: &str = "thinclone:branch";
/// Property holding the parent snapshot.
pub const PARENT_PROP: &str = "thinclone:parent";
/// Property listing child snapshots.
pub const CHILD_PROP: &str = "thinclone:child";
/// Property listing branches created from the snapshot.
pub const ROOT_PROP: &str = "thinclone:root";
/// Property holding the commit message.
pub const MESSAGE_PROP: &str = "thinclone:message";
/// Property holding the data state timestamp.
pub const DSA_PROP: &str = "thinclone:dsa";

/// Value reported for unset properties.
pub const EMPTY_VALUE: &str = "-";

/// Options for destroying a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Destroy dependents as well instead of refusing.
    pub force: bool,
}

/// Options for resetting to a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Discard snapshots newer than the target.
    pub recursive: bool,
}

/// A clone revision dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CloneDataset {
    /// Branch the clone belongs to.
    pub branch: String,
    /// Clone name.
    pub name: String,
    /// Revision number.
    pub revision: u32,
}

/// A branch and its head.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchEntity {
    /// Branch name.
    pub name: String,
    /// Snapshot the branch points to.
    pub snapshot_id: String,
}

/// Lineage of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDetails {
    /// Snapshot name.
    pub id: String,
    /// Parent snapshot.
    pub parent: Option<String>,
    /// Child snapshots.
    pub children: Vec<String>,
    /// Branches whose head this is.
    pub branches: Vec<String>,
    /// Branches created from this snapshot.
    pub roots: Vec<String>,
    /// Data state timestamp.
    pub data_state_at: Option<String>,
    /// Commit message.
    pub message: Option<String>,
}

/// Full branch and snapshot relationship graph of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Snapshots by name.
    pub snapshots: BTreeMap<String, SnapshotDetails>,
    /// Branch heads.
    pub branches: BTreeMap<String, String>,
}

impl Repo {
    /// Snapshots reachable from a branch head, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::BranchNotFound`] for unknown branches.
    pub fn log(&self, branch: &str) -> ThincloneResult<Vec<&SnapshotDetails>> {
        let head = self
            .branches
            .get(branch)
            .ok_or_else(|| ThincloneError::BranchNotFound {
                name: branch.to_string(),
            })?;

        let mut log = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = Some(head.as_str());

        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let Some(details) = self.snapshots.get(id) else {
                break;
            };
            log.push(details);
            current = details.parent.as_deref();
        }

        Ok(log)
    }
}

/// Entities directly attached to a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRelations {
    /// Clone datasets created from the snapshot.
    pub clones: Vec<String>,
    /// Branches whose head is the snapshot.
    pub branches: Vec<String>,
    /// Branches created from the snapshot.
    pub roots: Vec<String>,
    /// Child snapshots.
    pub children: Vec<String>,
}

impl SnapshotRelations {
    fn direct_dependents(&self) -> impl Iterator<Item = String> + '_ {
        self.clones
            .iter()
            .cloned()
            .chain(self.branches.iter().map(|b| format!("branch {b}")))
    }
}

/// Dataset part of a snapshot name.
#[must_use]
pub fn dataset_of(snapshot: &str) -> &str {
    snapshot.split_once('@').map_or(snapshot, |(dataset, _)| dataset)
}

/// Source of snapshot relations, implemented by backends.
#[async_trait]
pub trait RelationSource: Send + Sync {
    /// Relations of one snapshot.
    async fn relations(&self, snapshot: &str) -> ThincloneResult<SnapshotRelations>;
}

/// Collect every entity that depends on `snapshot`.
///
/// Clones and branch heads attached to the snapshot count directly. Child
/// snapshots on other datasets were taken from clones of it and count when
/// they, or any of their descendants, have dependents themselves. Later
/// snapshots of the same dataset and branch roots are lineage only; see
/// [`splice_out`]. An empty result means the snapshot can be destroyed.
///
/// # Errors
///
/// Propagates backend errors, including unknown snapshots.
pub async fn dependents_of<S>(source: &S, snapshot: &str) -> ThincloneResult<Vec<String>>
where
    S: RelationSource + ?Sized,
{
    let root = source.relations(snapshot).await?;
    let mut dependents: Vec<String> = root.direct_dependents().collect();

    let own_dataset = dataset_of(snapshot);
    let mut visited = BTreeSet::from([snapshot.to_string()]);
    let mut queue: VecDeque<String> = root
        .children
        .into_iter()
        .filter(|child| dataset_of(child) != own_dataset)
        .collect();

    while let Some(child) = queue.pop_front() {
        if !visited.insert(child.clone()) {
            continue;
        }

        let relations = match source.relations(&child).await {
            Ok(relations) => relations,
            Err(e) if e.is_not_found() => {
                tracing::warn!(snapshot, child = %child, "Lineage references a missing snapshot");
                continue;
            }
            Err(e) => return Err(e),
        };

        let direct: Vec<String> = relations.direct_dependents().collect();
        if !direct.is_empty() {
            dependents.push(child.clone());
            dependents.extend(direct);
        }
        queue.extend(relations.children);
    }

    let mut seen = BTreeSet::new();
    dependents.retain(|d| seen.insert(d.clone()));
    Ok(dependents)
}

/// Remove `snapshot` from the lineage before it is destroyed.
///
/// Children are re-linked to the snapshot's parent and branch roots move to
/// the next snapshot of the same dataset. Children left without a parent are
/// unlinked by the backend when the snapshot is destroyed.
///
/// # Errors
///
/// Propagates backend failures.
pub async fn splice_out<M>(manager: &M, snapshot: &str) -> ThincloneResult<()>
where
    M: Branching + ?Sized,
{
    let repo = manager.get_repo().await?;
    let Some(details) = repo.snapshots.get(snapshot) else {
        return Ok(());
    };

    let own_dataset = dataset_of(snapshot);
    let successor = details
        .children
        .iter()
        .find(|child| dataset_of(child) == own_dataset)
        .or_else(|| details.children.first());

    if let Some(parent) = &details.parent {
        for child in &details.children {
            manager.set_relation(parent, child).await?;
            manager.delete_child_prop(child, snapshot).await?;
        }
    }
    for branch in &details.roots {
        manager.delete_root_prop(branch, snapshot).await?;
        if let Some(next) = successor {
            manager.set_root(branch, next).await?;
        }
    }

    tracing::debug!(snapshot, parent = ?details.parent, successor = ?successor, "Spliced snapshot out of lineage");
    Ok(())
}

/// Split a comma-separated property value.
#[must_use]
pub fn parse_list(value: &str) -> Vec<String> {
    let value = value.trim();
    if value.is_empty() || value == EMPTY_VALUE {
        return Vec::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Add an item to a comma-separated property value.
#[must_use]
pub fn add_to_list(value: &str, item: &str) -> String {
    let mut items = parse_list(value);
    if !items.iter().any(|i| i == item) {
        items.push(item.to_string());
    }
    items.join(",")
}

/// Remove an item from a comma-separated property value.
#[must_use]
pub fn remove_from_list(value: &str, item: &str) -> String {
    parse_list(value)
        .into_iter()
        .filter(|i| i != item)
        .collect::<Vec<_>>()
        .join(",")
}

/// Optional single-valued property.
#[must_use]
pub fn parse_optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty() && value != EMPTY_VALUE).then(|| value.to_string())
}

/// Record the current state of a clone revision as the new head of `branch`.
///
/// The commit carries the data state of the previous head. Returns the name
/// of the new snapshot.
///
/// # Errors
///
/// Returns [`ThincloneError::BranchNotFound`] for unknown branches and
/// propagates backend failures.
pub async fn commit(
    fsm: &dyn FsManager,
    branch: &str,
    clone: &str,
    revision: u32,
    message: &str,
) -> ThincloneResult<String> {
    let branches = fsm.list_branches().await?;
    let head = branches
        .get(branch)
        .ok_or_else(|| ThincloneError::BranchNotFound {
            name: branch.to_string(),
        })?
        .clone();

    let dsa = fsm
        .get_repo()
        .await?
        .snapshots
        .get(&head)
        .and_then(|details| details.data_state_at.clone());
    let dataset = fsm.pool().clone_dataset(branch, clone, revision);
    let snapshot = format!("{dataset}@{}", format_dsa(Utc::now()));

    fsm.snapshot(&snapshot).await?;
    fsm.set_relation(&head, &snapshot).await?;
    fsm.delete_branch_prop(branch, &head).await?;
    fsm.add_branch_prop(branch, &snapshot).await?;
    if let Some(dsa) = dsa {
        fsm.set_dsa(&dsa, &snapshot).await?;
    }
    if !message.is_empty() {
        fsm.set_message(message, &snapshot).await?;
    }
    fsm.refresh_snapshot_list().await?;

    tracing::info!(branch, clone, revision, snapshot = %snapshot, "Committed clone state");
    Ok(snapshot)
}

/// Point `branch` at an existing snapshot.
///
/// # Errors
///
/// Returns not-found errors for unknown branches or snapshots.
pub async fn move_branch_head(
    fsm: &dyn FsManager,
    branch: &str,
    snapshot_id: &str,
) -> ThincloneResult<()> {
    if !fsm.snapshot_list().iter().any(|s| s.id == snapshot_id) {
        return Err(ThincloneError::SnapshotNotFound {
            id: snapshot_id.to_string(),
        });
    }

    let branches = fsm.list_branches().await?;
    let head = branches
        .get(branch)
        .ok_or_else(|| ThincloneError::BranchNotFound {
            name: branch.to_string(),
        })?;

    if head != snapshot_id {
        fsm.delete_branch_prop(branch, head).await?;
        fsm.add_branch_prop(branch, snapshot_id).await?;
        tracing::info!(branch, from = %head, to = snapshot_id, "Moved branch head");
    }

    Ok(())
}
