//! Clone, branch and session identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ThincloneError, ThincloneResult};

/// Maximum length of a clone or branch name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Validate a clone or branch name.
///
/// Names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
///
/// These names end up as dataset path components and container labels, so
/// anything that could be read as a path separator or a shell token is rejected.
///
/// # Errors
///
/// Returns [`ThincloneError::InvalidName`] if the format is invalid.
pub fn validate_name(name: &str) -> ThincloneResult<()> {
    let invalid = || ThincloneError::InvalidName {
        name: name.to_string(),
    };

    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(invalid());
    }

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid());
    }

    Ok(())
}

/// A validated clone name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CloneName(String);

impl CloneName {
    /// Create a new clone name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> ThincloneResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self(name))
    }

    /// Generate a random clone name.
    ///
    /// The name is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the clone name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CloneName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CloneName {
    type Err = ThincloneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CloneName {
    type Error = ThincloneError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CloneName> for String {
    fn from(name: CloneName) -> Self {
        name.0
    }
}

impl AsRef<str> for CloneName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a provisioned session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the session ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
