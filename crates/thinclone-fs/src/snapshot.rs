//! Snapshots and space accounting.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thinclone_common::{ThincloneError, ThincloneResult};

/// Format of data-state timestamps in snapshot names and data markers.
pub const DATA_STATE_AT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Prefix of snapshots cut from a pool's data.
pub const SNAPSHOT_PREFIX: &str = "snapshot_";

/// Format a data-state timestamp.
#[must_use]
pub fn format_dsa(dsa: DateTime<Utc>) -> String {
    dsa.format(DATA_STATE_AT_FORMAT).to_string()
}

/// Parse a data-state timestamp.
///
/// # Errors
///
/// Returns a serialization error if `value` does not match [`DATA_STATE_AT_FORMAT`].
pub fn parse_dsa(value: &str) -> ThincloneResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATA_STATE_AT_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ThincloneError::Serialization(format!("invalid data state at {value:?}: {e}")))
}

/// Kind of a snapshot, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Cut from the pool's data after a refresh.
    Data,
    /// Cut before promotion or data preparation.
    Pre,
    /// Committed from a clone on a branch.
    Commit,
}

impl SnapshotKind {
    /// Classify a snapshot of `pool`.
    #[must_use]
    pub fn classify(pool: &str, snapshot: &str, pre_suffix: &str) -> Self {
        let dataset = snapshot.split('@').next().unwrap_or_default();
        if dataset != pool {
            Self::Commit
        } else if !pre_suffix.is_empty() && snapshot.ends_with(pre_suffix) {
            Self::Pre
        } else {
            Self::Data
        }
    }
}

/// An immutable point-in-time marker inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name (`<dataset>@<name>`).
    pub id: String,
    /// Name of the owning pool.
    pub pool: String,
    /// When the snapshot was cut.
    pub created_at: DateTime<Utc>,
    /// Logical time of the data, distinct from `created_at`.
    #[serde(default)]
    pub data_state_at: Option<DateTime<Utc>>,
    /// Number of clones created from this snapshot.
    #[serde(default)]
    pub num_clones: usize,
    /// Space referenced on disk in bytes.
    #[serde(default)]
    pub physical_size: u64,
    /// Logical size of the referenced data in bytes.
    #[serde(default)]
    pub logical_size: u64,
    /// Commit message.
    #[serde(default)]
    pub message: Option<String>,
}

impl Snapshot {
    /// Create a snapshot record with no size information.
    pub fn new(id: impl Into<String>, pool: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            pool: pool.into(),
            created_at,
            data_state_at: None,
            num_clones: 0,
            physical_size: 0,
            logical_size: 0,
            message: None,
        }
    }

    /// Set the data state timestamp.
    #[must_use]
    pub fn with_data_state_at(mut self, dsa: DateTime<Utc>) -> Self {
        self.data_state_at = Some(dsa);
        self
    }

    /// Compare by recency.
    ///
    /// A snapshot with a data state outranks one without. Among snapshots
    /// with a data state, the latest data state wins; otherwise the latest
    /// creation time wins.
    #[must_use]
    pub fn cmp_recency(&self, other: &Self) -> Ordering {
        match (self.data_state_at, other.data_state_at) {
            (Some(a), Some(b)) => a.cmp(&b).then(self.created_at.cmp(&other.created_at)),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => self.created_at.cmp(&other.created_at),
        }
    }
}

/// Pick the most recent snapshot.
pub fn latest_snapshot<'a, I>(snapshots: I) -> Option<&'a Snapshot>
where
    I: IntoIterator<Item = &'a Snapshot>,
{
    snapshots.into_iter().max_by(|a, b| a.cmp_recency(b))
}

/// Sort snapshots newest first.
pub fn sort_newest_first(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| b.cmp_recency(a));
}

/// Space used by one clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Bytes written since the clone was created.
    pub clone_diff_size: u64,
    /// Logical size of the clone's data in bytes.
    pub logical_size: u64,
}

/// Space accounting of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemState {
    /// Total capacity in bytes.
    pub size: u64,
    /// Free bytes.
    pub free: u64,
    /// Used bytes.
    pub used: u64,
    /// Bytes held only by snapshots.
    pub used_by_snapshots: u64,
    /// Bytes held by clones and other child datasets.
    pub used_by_clones: u64,
    /// Compression ratio.
    pub compress_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(hours: i64) -> DateTime<Utc> {
        parse_dsa("20240101120000").unwrap() + Duration::hours(hours)
    }

    #[test]
    fn latest_by_created_at_without_dsa() {
        let snapshots = vec![
            Snapshot::new("pool@a", "pool", at(0)),
            Snapshot::new("pool@b", "pool", at(2)),
            Snapshot::new("pool@c", "pool", at(1)),
        ];
        assert_eq!(latest_snapshot(&snapshots).unwrap().id, "pool@b");
    }

    #[test]
    fn dsa_outranks_created_at() {
        let snapshots = vec![
            Snapshot::new("pool@no_dsa", "pool", at(10)),
            Snapshot::new("pool@old_dsa", "pool", at(0)).with_data_state_at(at(-5)),
            Snapshot::new("pool@new_dsa", "pool", at(1)).with_data_state_at(at(-1)),
        ];
        assert_eq!(latest_snapshot(&snapshots).unwrap().id, "pool@new_dsa");
    }

    #[test]
    fn sorting_is_newest_first() {
        let mut snapshots = vec![
            Snapshot::new("pool@a", "pool", at(0)),
            Snapshot::new("pool@b", "pool", at(0)).with_data_state_at(at(1)),
            Snapshot::new("pool@c", "pool", at(3)),
        ];
        sort_newest_first(&mut snapshots);
        let ids: Vec<_> = snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["pool@b", "pool@c", "pool@a"]);
    }

    #[test]
    fn empty_list_has_no_latest() {
        assert!(latest_snapshot(&Vec::new()).is_none());
    }

    #[test]
    fn dsa_round_trip() {
        let dsa = parse_dsa("20240315083000").unwrap();
        assert_eq!(format_dsa(dsa), "20240315083000");
        assert!(parse_dsa("2024-03-15").is_err());
    }

    #[test]
    fn kinds() {
        assert_eq!(
            SnapshotKind::classify("pool", "pool@snapshot_20240101000000", "_pre"),
            SnapshotKind::Data
        );
        assert_eq!(
            SnapshotKind::classify("pool", "pool@snapshot_20240101000000_pre", "_pre"),
            SnapshotKind::Pre
        );
        assert_eq!(
            SnapshotKind::classify("pool", "pool/branch/dev/c1/r0@20240101000000", "_pre"),
            SnapshotKind::Commit
        );
    }
}
