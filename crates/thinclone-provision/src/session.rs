//! Session handles.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thinclone_common::id::validate_name;
use thinclone_common::{SessionId, ThincloneError, ThincloneResult};
use thinclone_fs::DEFAULT_BRANCH;

/// The clone a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRef {
    /// Clone name.
    pub name: String,
    /// Branch the clone is created on.
    pub branch: String,
    /// Revision of the clone lineage.
    pub revision: u32,
    /// Requested snapshot; `None` picks the latest one of the Active pool.
    pub snapshot_id: Option<String>,
    /// Keep the dataset when the session stops.
    pub protected: bool,
}

impl CloneRef {
    /// Base revision of `name` on the default branch, latest snapshot.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: DEFAULT_BRANCH.to_string(),
            revision: 0,
            snapshot_id: None,
            protected: false,
        }
    }

    /// Use a branch.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Use a revision.
    #[must_use]
    pub const fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Request a snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    /// Mark the clone protected.
    #[must_use]
    pub const fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Check clone and branch names.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::InvalidName`] for a malformed name.
    pub fn validate(&self) -> ThincloneResult<()> {
        validate_name(&self.name)?;
        validate_name(&self.branch)
    }
}

/// Marker no password may contain, used to quote passwords in SQL bodies.
pub(crate) const DOLLAR_TAG: &str = "$thinclone$";

/// Database role created for a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralUser {
    /// Role name.
    pub name: String,
    /// Role password.
    pub password: String,
    /// Create a regular role instead of a superuser.
    pub restricted: bool,
}

impl std::fmt::Debug for EphemeralUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralUser")
            .field("name", &self.name)
            .field("password", &"***")
            .field("restricted", &self.restricted)
            .finish()
    }
}

impl EphemeralUser {
    /// Superuser role.
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            restricted: false,
        }
    }

    /// Regular role without superuser rights.
    #[must_use]
    pub const fn restricted(mut self) -> Self {
        self.restricted = true;
        self
    }

    /// Check the role can be created safely.
    ///
    /// # Errors
    ///
    /// Returns [`ThincloneError::InvalidName`] for an empty name and a
    /// configuration error for an unusable password.
    pub fn validate(&self) -> ThincloneResult<()> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(ThincloneError::InvalidName {
                name: self.name.clone(),
            });
        }
        if self.password.is_empty() || self.password.contains(DOLLAR_TAG) {
            return Err(ThincloneError::Config {
                message: format!("password of user {} is empty or unsupported", self.name),
            });
        }
        Ok(())
    }
}

/// A running database instance bound to a clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// Pool holding the clone.
    pub pool: String,
    /// Host port of the instance.
    pub port: u16,
    /// Instance name in the runtime.
    pub instance: String,
    /// Role created for the session.
    pub user: EphemeralUser,
    /// Directory of the instance's unix socket.
    pub socket_dir: PathBuf,
    /// Per-session database settings.
    pub extra_config: BTreeMap<String, String>,
    /// Snapshot the clone was created from.
    pub snapshot_id: String,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_ref_defaults_to_base_revision_on_main() {
        let clone = CloneRef::new("c1");
        assert_eq!(clone.branch, DEFAULT_BRANCH);
        assert_eq!(clone.revision, 0);
        assert!(!clone.protected);
        clone.validate().unwrap();
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert!(CloneRef::new("../c1").validate().is_err());
        assert!(CloneRef::new("c1").with_branch("").validate().is_err());
    }

    #[test]
    fn password_is_not_printed() {
        let user = EphemeralUser::new("alice", "s3cret");
        assert!(!format!("{user:?}").contains("s3cret"));
    }

    #[test]
    fn dollar_tag_in_password_is_rejected() {
        assert!(EphemeralUser::new("alice", "x$thinclone$y").validate().is_err());
        assert!(EphemeralUser::new("alice", "").validate().is_err());
        EphemeralUser::new("alice", "it's fine").validate().unwrap();
    }
}
