//! Data marker persisted by the retrieval pipeline.
//!
//! The marker lives at `<data_dir>/.thinclone/dbmarker` and records what kind
//! of data the pool holds and how fresh it is. Only `dataStateAt` is
//! interpreted here.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thinclone_common::ThincloneResult;
use thinclone_common::paths::{DATA_MARKER_FILE, METADATA_DIR};

use crate::snapshot::{format_dsa, parse_dsa};

/// Data type recorded by logical (dump/restore) retrieval.
pub const LOGICAL_DATA_TYPE: &str = "logical";

/// Data type recorded by physical (base backup) retrieval.
pub const PHYSICAL_DATA_TYPE: &str = "physical";

/// Contents of the data marker file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMarker {
    /// Retrieval mode that produced the data.
    #[serde(default)]
    pub data_type: String,
    /// Timestamp of the data, in `%Y%m%d%H%M%S` format.
    #[serde(default)]
    pub data_state_at: String,
}

impl DataMarker {
    /// Create a marker for data as of `dsa`.
    pub fn new(data_type: impl Into<String>, dsa: DateTime<Utc>) -> Self {
        Self {
            data_type: data_type.into(),
            data_state_at: format_dsa(dsa),
        }
    }

    /// Path of the marker file for a data directory.
    #[must_use]
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(METADATA_DIR).join(DATA_MARKER_FILE)
    }

    /// Load the marker of a data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(data_dir: &Path) -> ThincloneResult<Self> {
        let content = fs::read_to_string(Self::path(data_dir))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Write the marker into a data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata directory cannot be created or written.
    pub fn save(&self, data_dir: &Path) -> ThincloneResult<()> {
        let path = Self::path(data_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_yaml::to_string(self)?)?;

        tracing::debug!(path = %path.display(), dsa = %self.data_state_at, "Saved data marker");
        Ok(())
    }

    /// Parsed data state timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker holds no valid timestamp.
    pub fn data_state_at(&self) -> ThincloneResult<DateTime<Utc>> {
        parse_dsa(&self.data_state_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_marker() {
        let temp = tempdir().unwrap();
        let dsa = parse_dsa("20240102030405").unwrap();

        DataMarker::new(LOGICAL_DATA_TYPE, dsa).save(temp.path()).unwrap();
        let loaded = DataMarker::load(temp.path()).unwrap();

        assert_eq!(loaded.data_type, LOGICAL_DATA_TYPE);
        assert_eq!(loaded.data_state_at().unwrap(), dsa);
    }

    #[test]
    fn marker_uses_camel_case_keys() {
        let marker: DataMarker =
            serde_yaml::from_str("dataType: physical\ndataStateAt: '20240102030405'\n").unwrap();
        assert_eq!(marker.data_type, PHYSICAL_DATA_TYPE);
        assert_eq!(marker.data_state_at, "20240102030405");
    }

    #[test]
    fn missing_marker_is_an_error() {
        let temp = tempdir().unwrap();
        assert!(DataMarker::load(temp.path()).is_err());
    }

    #[test]
    fn empty_dsa_is_invalid() {
        let marker = DataMarker::default();
        assert!(marker.data_state_at().is_err());
    }
}
