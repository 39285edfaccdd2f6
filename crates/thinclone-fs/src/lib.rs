//! # thinclone-fs
//!
//! Copy-on-write storage for thin database clones.
//!
//! This crate defines the data model shared by every storage backend (pools,
//! snapshots, branches, revisions) and the capability traits a backend
//! implements to be usable by the pool registry and the session provisioner:
//!
//! - [`Pooler`]: access to the owning [`Pool`]
//! - [`Cloner`]: thin clone creation and destruction
//! - [`Snapshotter`]: snapshot creation, retention and listing
//! - [`StateReporter`]: space accounting
//! - [`Branching`]: git-like branch and lineage metadata
//!
//! Backends:
//!
//! - [`ZfsManager`]: full capability set on top of `zfs` user properties
//! - [`LvmManager`]: thin LVM snapshots, no branching history
//! - [`MemoryManager`]: in-process backend used by tests and dry runs

#![warn(missing_docs)]

pub mod branching;
pub mod exec;
pub mod lvm;
pub mod manager;
pub mod marker;
pub mod memory;
pub mod pool;
pub mod snapshot;
pub mod zfs;

pub use branching::{
    BranchEntity, CloneDataset, DEFAULT_BRANCH, DEFAULT_REVISION, DestroyOptions, Repo,
    ResetOptions, SnapshotDetails,
};
pub use exec::{CommandRunner, HostRunner};
pub use lvm::LvmManager;
pub use manager::{
    Branching, Cloner, FsManager, ManagerConfig, Pooler, Snapshotter, StateReporter,
};
pub use marker::DataMarker;
pub use memory::MemoryManager;
pub use pool::{Pool, PoolMode, PoolStatus};
pub use snapshot::{FilesystemState, SessionState, Snapshot, SnapshotKind, latest_snapshot};
pub use zfs::ZfsManager;
