//! In-process filesystem manager.
//!
//! Implements the full capability contract over in-memory datasets and
//! snapshots. Used for tests and dry runs where no copy-on-write storage is
//! available.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thinclone_common::id::validate_name;
use thinclone_common::{ThincloneError, ThincloneResult};

use crate::branching::{
    self, BRANCH_PROP, BranchEntity, CHILD_PROP, CloneDataset, DEFAULT_BRANCH, DSA_PROP,
    DestroyOptions, MESSAGE_PROP, PARENT_PROP, ROOT_PROP, RelationSource, Repo, ResetOptions,
    SnapshotDetails, SnapshotRelations, add_to_list, parse_list, parse_optional, remove_from_list,
};
use crate::manager::{
    Branching, Cloner, ManagerConfig, Pooler, Snapshotter, StateReporter, init_default_branch,
    retain_latest,
};
use crate::pool::{Pool, parse_clone_dataset};
use crate::snapshot::{
    FilesystemState, SNAPSHOT_PREFIX, SessionState, Snapshot, SnapshotKind, format_dsa, parse_dsa,
    sort_newest_first,
};

/// Capacity reported by [`MemoryManager::get_filesystem_state`].
const DEFAULT_CAPACITY: u64 = 100 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct MemSnapshot {
    created_at: DateTime<Utc>,
    size: u64,
    props: BTreeMap<&'static str, String>,
}

impl MemSnapshot {
    fn new(created_at: DateTime<Utc>, size: u64) -> Self {
        Self {
            created_at,
            size,
            props: BTreeMap::new(),
        }
    }

    fn prop(&self, name: &str) -> &str {
        self.props.get(name).map_or("", String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
struct MemDataset {
    origin: Option<String>,
    mountpoint: Option<PathBuf>,
    written: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<String, MemSnapshot>,
    datasets: BTreeMap<String, MemDataset>,
}

impl MemoryState {
    fn snapshot_mut(&mut self, id: &str) -> ThincloneResult<&mut MemSnapshot> {
        self.snapshots
            .get_mut(id)
            .ok_or_else(|| ThincloneError::SnapshotNotFound { id: id.to_string() })
    }

    fn update_prop(
        &mut self,
        id: &str,
        prop: &'static str,
        update: impl FnOnce(&str) -> String,
    ) -> ThincloneResult<()> {
        let snapshot = self.snapshot_mut(id)?;
        let value = update(snapshot.prop(prop));
        if value.is_empty() {
            snapshot.props.remove(prop);
        } else {
            snapshot.props.insert(prop, value);
        }
        Ok(())
    }

    fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, d)| d.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn remove_snapshot(&mut self, id: &str) {
        let Some(removed) = self.snapshots.remove(id) else {
            return;
        };

        if let Some(parent) = parse_optional(removed.prop(PARENT_PROP)) {
            let _ = self.update_prop(&parent, CHILD_PROP, |v| remove_from_list(v, id));
        }
        for child in parse_list(removed.prop(CHILD_PROP)) {
            if let Some(snapshot) = self.snapshots.get_mut(&child) {
                snapshot.props.remove(PARENT_PROP);
            }
        }
    }

    /// Remove a dataset, its descendants and their snapshots.
    fn remove_dataset_tree(&mut self, dataset: &str) {
        let prefix = format!("{dataset}/");
        self.datasets
            .retain(|name, _| name != dataset && !name.starts_with(&prefix));

        let snapshots: Vec<String> = self
            .snapshots
            .keys()
            .filter(|id| {
                let owner = id.split('@').next().unwrap_or_default();
                owner == dataset || owner.starts_with(&prefix)
            })
            .cloned()
            .collect();
        for id in snapshots {
            self.remove_snapshot(&id);
        }
    }
}

/// Filesystem manager keeping datasets and snapshots in memory.
#[derive(Debug)]
pub struct MemoryManager {
    pool: Arc<Pool>,
    config: ManagerConfig,
    state: Mutex<MemoryState>,
    snapshots: RwLock<Vec<Snapshot>>,
}

impl MemoryManager {
    /// Create an empty manager for `pool`.
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Self {
        Self::with_config(pool, ManagerConfig::default())
    }

    /// Create an empty manager with backend options.
    #[must_use]
    pub fn with_config(pool: Arc<Pool>, config: ManagerConfig) -> Self {
        Self {
            pool,
            config,
            state: Mutex::new(MemoryState::default()),
            snapshots: RwLock::new(Vec::new()),
        }
    }

    /// Register an existing snapshot of the pool data.
    ///
    /// Stands in for the retrieval pipeline when seeding a pool.
    pub fn insert_snapshot(&self, snapshot: &Snapshot) {
        let mut mem = MemSnapshot::new(snapshot.created_at, snapshot.physical_size);
        if let Some(dsa) = snapshot.data_state_at {
            mem.props.insert(DSA_PROP, format_dsa(dsa));
        }
        if let Some(message) = &snapshot.message {
            mem.props.insert(MESSAGE_PROP, message.clone());
        }
        self.state.lock().snapshots.insert(snapshot.id.clone(), mem);
        self.rebuild_cache();
    }

    /// Account bytes written into a clone revision.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::CloneNotFound`] if the revision does not exist.
    pub fn record_write(
        &self,
        branch: &str,
        clone: &str,
        revision: u32,
        bytes: u64,
    ) -> ThincloneResult<()> {
        let dataset = self.pool.clone_dataset(branch, clone, revision);
        let mut state = self.state.lock();
        let entry = state
            .datasets
            .get_mut(&dataset)
            .ok_or_else(|| ThincloneError::CloneNotFound {
                name: clone.to_string(),
            })?;
        entry.written += bytes;
        Ok(())
    }

    /// Mount point recorded for a dataset.
    #[must_use]
    pub fn mountpoint(&self, dataset: &str) -> Option<PathBuf> {
        self.state
            .lock()
            .datasets
            .get(dataset)
            .and_then(|d| d.mountpoint.clone())
    }

    fn rebuild_cache(&self) {
        let state = self.state.lock();
        let mut list: Vec<Snapshot> = state
            .snapshots
            .iter()
            .map(|(id, mem)| Snapshot {
                id: id.clone(),
                pool: self.pool.name.clone(),
                created_at: mem.created_at,
                data_state_at: parse_optional(mem.prop(DSA_PROP))
                    .and_then(|dsa| parse_dsa(&dsa).ok()),
                num_clones: state.clones_of(id).len(),
                physical_size: mem.size,
                logical_size: mem.size,
                message: parse_optional(mem.prop(MESSAGE_PROP)),
            })
            .collect();
        drop(state);

        sort_newest_first(&mut list);
        *self.snapshots.write() = list;
    }

    fn dataset_exists(state: &MemoryState, pool: &str, dataset: &str) -> bool {
        dataset == pool || state.datasets.contains_key(dataset)
    }
}

impl Pooler for MemoryManager {
    fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }
}

#[async_trait]
impl RelationSource for MemoryManager {
    async fn relations(&self, snapshot: &str) -> ThincloneResult<SnapshotRelations> {
        let state = self.state.lock();
        let mem = state
            .snapshots
            .get(snapshot)
            .ok_or_else(|| ThincloneError::SnapshotNotFound {
                id: snapshot.to_string(),
            })?;

        Ok(SnapshotRelations {
            clones: state.clones_of(snapshot),
            branches: parse_list(mem.prop(BRANCH_PROP)),
            roots: parse_list(mem.prop(ROOT_PROP)),
            children: parse_list(mem.prop(CHILD_PROP)),
        })
    }
}

#[async_trait]
impl Cloner for MemoryManager {
    async fn create_clone(
        &self,
        branch: &str,
        name: &str,
        snapshot_id: &str,
        revision: u32,
    ) -> ThincloneResult<()> {
        validate_name(branch)?;
        validate_name(name)?;

        let base = self.pool.clone_base_dataset(branch, name);
        let dataset = self.pool.clone_dataset(branch, name, revision);
        {
            let mut state = self.state.lock();
            if !state.snapshots.contains_key(snapshot_id) {
                return Err(ThincloneError::SnapshotNotFound {
                    id: snapshot_id.to_string(),
                });
            }
            if state.datasets.contains_key(&dataset) {
                return Err(ThincloneError::Config {
                    message: format!("dataset {dataset} already exists"),
                });
            }

            state.datasets.entry(base).or_default();
            state.datasets.insert(
                dataset.clone(),
                MemDataset {
                    origin: Some(snapshot_id.to_string()),
                    mountpoint: Some(self.pool.clone_mountpoint(branch, name, revision)),
                    written: 0,
                },
            );
        }

        tracing::info!(pool = %self.pool.name, dataset = %dataset, snapshot = snapshot_id, "Created clone");
        self.rebuild_cache();
        Ok(())
    }

    async fn destroy_clone(&self, branch: &str, name: &str, revision: u32) -> ThincloneResult<()> {
        let target = if revision == branching::DEFAULT_REVISION {
            self.pool.clone_base_dataset(branch, name)
        } else {
            self.pool.clone_dataset(branch, name, revision)
        };

        {
            let mut state = self.state.lock();
            if !state.datasets.contains_key(&target) {
                return Err(ThincloneError::CloneNotFound {
                    name: name.to_string(),
                });
            }
            state.remove_dataset_tree(&target);
        }

        tracing::info!(pool = %self.pool.name, dataset = %target, "Destroyed clone");
        self.rebuild_cache();
        Ok(())
    }

    async fn list_clones(&self) -> ThincloneResult<Vec<CloneDataset>> {
        let state = self.state.lock();
        Ok(state
            .datasets
            .keys()
            .filter_map(|name| parse_clone_dataset(&self.pool.name, name))
            .map(|(branch, name, revision)| CloneDataset {
                branch,
                name,
                revision,
            })
            .collect())
    }
}

#[async_trait]
impl Snapshotter for MemoryManager {
    async fn create_snapshot(&self, suffix: &str, data_state_at: &str) -> ThincloneResult<String> {
        let dsa = if data_state_at.is_empty() {
            format_dsa(Utc::now())
        } else {
            data_state_at.to_string()
        };
        let name = format!("{}@{SNAPSHOT_PREFIX}{dsa}{suffix}", self.pool.name);

        {
            let mut state = self.state.lock();
            if state.snapshots.contains_key(&name) {
                return Err(ThincloneError::SnapshotExists { name });
            }

            let mut snapshot = MemSnapshot::new(Utc::now(), 0);
            if !data_state_at.is_empty() {
                snapshot.props.insert(DSA_PROP, data_state_at.to_string());
            }
            state.snapshots.insert(name.clone(), snapshot);
        }

        tracing::info!(pool = %self.pool.name, snapshot = %name, "Created snapshot");
        self.rebuild_cache();
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

        {
            let mut state = self.state.lock();
            if !state.snapshots.contains_key(name) {
                return Err(ThincloneError::SnapshotNotFound {
                    id: name.to_string(),
                });
            }
            for clone in state.clones_of(name) {
                state.remove_dataset_tree(&clone);
            }
            state.remove_snapshot(name);
        }

        tracing::info!(pool = %self.pool.name, snapshot = name, "Destroyed snapshot");
        self.rebuild_cache();
        Ok(())
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
        self.rebuild_cache();
        Ok(())
    }
}

#[async_trait]
impl StateReporter for MemoryManager {
    async fn get_session_state(&self, branch: &str, clone: &str) -> ThincloneResult<SessionState> {
        let base = self.pool.clone_base_dataset(branch, clone);
        let prefix = format!("{base}/");
        let state = self.state.lock();

        if !state.datasets.contains_key(&base) {
            return Err(ThincloneError::CloneNotFound {
                name: clone.to_string(),
            });
        }

        let mut session = SessionState::default();
        for (_, dataset) in state.datasets.iter().filter(|(n, _)| n.starts_with(&prefix)) {
            session.clone_diff_size += dataset.written;
            let origin_size = dataset
                .origin
                .as_ref()
                .and_then(|o| state.snapshots.get(o))
                .map_or(0, |s| s.size);
            session.logical_size = session.logical_size.max(origin_size + dataset.written);
        }
        Ok(session)
    }

    async fn get_filesystem_state(&self) -> ThincloneResult<FilesystemState> {
        let state = self.state.lock();
        let used_by_snapshots: u64 = state.snapshots.values().map(|s| s.size).sum();
        let used_by_clones: u64 = state.datasets.values().map(|d| d.written).sum();
        let used = used_by_snapshots + used_by_clones;

        Ok(FilesystemState {
            size: DEFAULT_CAPACITY,
            free: DEFAULT_CAPACITY.saturating_sub(used),
            used,
            used_by_snapshots,
            used_by_clones,
            compress_ratio: 1.0,
        })
    }
}

#[async_trait]
impl Branching for MemoryManager {
    async fn init_branching(&self) -> ThincloneResult<()> {
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

        let head = self
            .list_branches()
            .await?
            .remove(branch)
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

        self.delete_branch_prop(branch, &head).await?;
        let roots: Vec<String> = {
            let state = self.state.lock();
            state
                .snapshots
                .iter()
                .filter(|(_, s)| parse_list(s.prop(ROOT_PROP)).iter().any(|b| b == branch))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for root in roots {
            self.delete_root_prop(branch, &root).await?;
        }

        tracing::info!(pool = %self.pool.name, branch, "Deleted branch");
        Ok(())
    }

    async fn list_branches(&self) -> ThincloneResult<BTreeMap<String, String>> {
        let state = self.state.lock();
        let mut branches = BTreeMap::new();
        for (id, snapshot) in &state.snapshots {
            for branch in parse_list(snapshot.prop(BRANCH_PROP)) {
                branches.insert(branch, id.clone());
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
        let mut repo = Repo::default();
        let state = self.state.lock();

        for (id, snapshot) in &state.snapshots {
            let details = SnapshotDetails {
                id: id.clone(),
                parent: parse_optional(snapshot.prop(PARENT_PROP)),
                children: parse_list(snapshot.prop(CHILD_PROP)),
                branches: parse_list(snapshot.prop(BRANCH_PROP)),
                roots: parse_list(snapshot.prop(ROOT_PROP)),
                data_state_at: parse_optional(snapshot.prop(DSA_PROP)),
                message: parse_optional(snapshot.prop(MESSAGE_PROP)),
            };
            for branch in &details.branches {
                repo.branches.insert(branch.clone(), id.clone());
            }
            repo.snapshots.insert(id.clone(), details);
        }

        Ok(repo)
    }

    async fn set_relation(&self, parent: &str, child: &str) -> ThincloneResult<()> {
        let mut state = self.state.lock();
        state.snapshot_mut(parent)?;
        state.update_prop(child, PARENT_PROP, |_| parent.to_string())?;
        state.update_prop(parent, CHILD_PROP, |v| add_to_list(v, child))
    }

    async fn snapshot(&self, snapshot_name: &str) -> ThincloneResult<()> {
        let (dataset, _) = snapshot_name
            .split_once('@')
            .ok_or_else(|| ThincloneError::Config {
                message: format!("invalid snapshot name: {snapshot_name}"),
            })?;

        {
            let mut state = self.state.lock();
            if !Self::dataset_exists(&state, &self.pool.name, dataset) {
                return Err(ThincloneError::CloneNotFound {
                    name: dataset.to_string(),
                });
            }
            if state.snapshots.contains_key(snapshot_name) {
                return Err(ThincloneError::SnapshotExists {
                    name: snapshot_name.to_string(),
                });
            }

            let size = state.datasets.get(dataset).map_or(0, |d| d.written);
            state
                .snapshots
                .insert(snapshot_name.to_string(), MemSnapshot::new(Utc::now(), size));
        }

        self.rebuild_cache();
        Ok(())
    }

    async fn move_to(
        &self,
        base_snapshot: &str,
        current_snapshot: &str,
        target: &str,
    ) -> ThincloneResult<()> {
        {
            let mut state = self.state.lock();
            state.snapshot_mut(base_snapshot)?;
            let current = state.snapshot_mut(current_snapshot)?.clone();
            if !Self::dataset_exists(&state, &self.pool.name, target) {
                return Err(ThincloneError::CloneNotFound {
                    name: target.to_string(),
                });
            }

            let (_, short) = current_snapshot
                .split_once('@')
                .unwrap_or((current_snapshot, current_snapshot));
            let mut replica = MemSnapshot::new(current.created_at, current.size);
            replica.props = current
                .props
                .into_iter()
                .filter(|(k, _)| matches!(*k, DSA_PROP | MESSAGE_PROP))
                .collect();
            state.snapshots.insert(format!("{target}@{short}"), replica);
        }

        self.rebuild_cache();
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> ThincloneResult<()> {
        {
            let mut state = self.state.lock();
            if let Some(snapshot) = state.snapshots.remove(old_name) {
                state.snapshots.insert(new_name.to_string(), snapshot);
                for other in state.snapshots.values_mut() {
                    for prop in [PARENT_PROP, CHILD_PROP] {
                        if let Some(value) = other.props.get_mut(prop) {
                            let renamed: Vec<String> = parse_list(value)
                                .into_iter()
                                .map(|v| if v == old_name { new_name.to_string() } else { v })
                                .collect();
                            *value = renamed.join(",");
                        }
                    }
                }
                for dataset in state.datasets.values_mut() {
                    if dataset.origin.as_deref() == Some(old_name) {
                        dataset.origin = Some(new_name.to_string());
                    }
                }
            } else if state.datasets.contains_key(old_name) {
                let prefix = format!("{old_name}/");
                let moved: Vec<String> = state
                    .datasets
                    .keys()
                    .filter(|k| *k == old_name || k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for name in moved {
                    if let Some(dataset) = state.datasets.remove(&name) {
                        let renamed = format!("{new_name}{}", &name[old_name.len()..]);
                        state.datasets.insert(renamed, dataset);
                    }
                }
            } else {
                return Err(ThincloneError::CloneNotFound {
                    name: old_name.to_string(),
                });
            }
        }

        self.rebuild_cache();
        Ok(())
    }

    async fn set_mountpoint(&self, path: &Path, name: &str) -> ThincloneResult<()> {
        let mut state = self.state.lock();
        let dataset = state
            .datasets
            .get_mut(name)
            .ok_or_else(|| ThincloneError::CloneNotFound {
                name: name.to_string(),
            })?;
        dataset.mountpoint = Some(path.to_path_buf());
        Ok(())
    }

    async fn set_dsa(&self, dsa: &str, snapshot_name: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(snapshot_name, DSA_PROP, |_| dsa.to_string())?;
        self.rebuild_cache();
        Ok(())
    }

    async fn set_message(&self, message: &str, snapshot_name: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(snapshot_name, MESSAGE_PROP, |_| message.to_string())?;
        self.rebuild_cache();
        Ok(())
    }

    async fn reset(&self, snapshot_id: &str, opts: ResetOptions) -> ThincloneResult<()> {
        let dataset = branching::dataset_of(snapshot_id).to_string();
        let newer: Vec<String> = {
            let mut state = self.state.lock();
            let target = state.snapshot_mut(snapshot_id)?.created_at;
            let owner_prefix = format!("{dataset}@");
            state
                .snapshots
                .iter()
                .filter(|(id, s)| id.starts_with(&owner_prefix) && s.created_at > target)
                .map(|(id, _)| id.clone())
                .collect()
        };

        if !newer.is_empty() && !opts.recursive {
            return Err(ThincloneError::Config {
                message: format!(
                    "cannot reset {dataset} to {snapshot_id}: more recent snapshots exist"
                ),
            });
        }
        for id in &newer {
            let dependents = self.has_dependent_entity(id).await?;
            if !dependents.is_empty() {
                return Err(ThincloneError::HasDependents {
                    entity: id.clone(),
                    dependents,
                });
            }
        }

        {
            let mut state = self.state.lock();
            for id in &newer {
                state.remove_snapshot(id);
            }
            if let Some(entry) = state.datasets.get_mut(&dataset) {
                entry.written = 0;
            }
        }

        tracing::info!(pool = %self.pool.name, snapshot = snapshot_id, discarded = newer.len(), "Reset dataset");
        self.rebuild_cache();
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
        let owner_prefix = format!("{}@", self.pool.clone_dataset(branch, name, revision));
        let snapshots: Vec<String> = self
            .state
            .lock()
            .snapshots
            .keys()
            .filter(|id| id.starts_with(&owner_prefix))
            .cloned()
            .collect();

        let mut dependents = Vec::new();
        for snapshot in snapshots {
            dependents.extend(self.has_dependent_entity(&snapshot).await?);
        }
        Ok(dependents)
    }

    async fn add_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(dataset, BRANCH_PROP, |v| add_to_list(v, branch))
    }

    async fn delete_branch_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(dataset, BRANCH_PROP, |v| remove_from_list(v, branch))
    }

    async fn delete_child_prop(&self, child: &str, dataset: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(dataset, CHILD_PROP, |v| remove_from_list(v, child))
    }

    async fn delete_root_prop(&self, branch: &str, dataset: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(dataset, ROOT_PROP, |v| remove_from_list(v, branch))
    }

    async fn set_root(&self, branch: &str, snapshot: &str) -> ThincloneResult<()> {
        self.state
            .lock()
            .update_prop(snapshot, ROOT_PROP, |v| add_to_list(v, branch))
    }
}
