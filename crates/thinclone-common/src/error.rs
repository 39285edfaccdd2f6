//! Common error types for thinclone.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ThincloneError`].
pub type ThincloneResult<T> = Result<T, ThincloneError>;

/// Common errors across thinclone.
#[derive(Error, Diagnostic, Debug)]
pub enum ThincloneError {
    /// A bounded resource has no free capacity left.
    #[error("No room: {resource}")]
    #[diagnostic(
        code(thinclone::capacity::no_room),
        help("The resource is temporarily exhausted, retry once sessions are stopped")
    )]
    NoRoom {
        /// The exhausted resource (e.g. "port pool").
        resource: String,
    },

    /// Pool not found.
    #[error("Pool not found: {name}")]
    #[diagnostic(code(thinclone::pool::not_found))]
    PoolNotFound {
        /// The pool name that was not found.
        name: String,
    },

    /// Snapshot not found.
    #[error("Snapshot not found: {id}")]
    #[diagnostic(code(thinclone::snapshot::not_found))]
    SnapshotNotFound {
        /// The snapshot ID that was not found.
        id: String,
    },

    /// Branch not found.
    #[error("Branch not found: {name}")]
    #[diagnostic(code(thinclone::branch::not_found))]
    BranchNotFound {
        /// The branch name that was not found.
        name: String,
    },

    /// Clone not found.
    #[error("Clone not found: {name}")]
    #[diagnostic(code(thinclone::clone::not_found))]
    CloneNotFound {
        /// The clone name that was not found.
        name: String,
    },

    /// Branch with the same name already exists.
    #[error("Branch already exists: {name}")]
    #[diagnostic(code(thinclone::branch::exists))]
    BranchExists {
        /// Name of the existing branch.
        name: String,
    },

    /// Snapshot with the same name already exists.
    #[error("Snapshot already exists: {name}")]
    #[diagnostic(
        code(thinclone::snapshot::exists),
        help("A snapshot for this data state was already cut, it can be reused")
    )]
    SnapshotExists {
        /// Name of the existing snapshot.
        name: String,
    },

    /// Entity still has dependents and cannot be destroyed.
    #[error("{entity} has dependent entities: {}", .dependents.join(", "))]
    #[diagnostic(
        code(thinclone::dependency::violation),
        help("Destroy the dependent clones and branches first")
    )]
    HasDependents {
        /// The entity that was about to be destroyed.
        entity: String,
        /// Entities depending on it.
        dependents: Vec<String>,
    },

    /// External command exited unsuccessfully.
    #[error("Command `{program} {}` failed ({status}): {stderr}", .args.join(" "))]
    #[diagnostic(code(thinclone::command))]
    Command {
        /// Program name.
        program: String,
        /// Arguments passed to the program.
        args: Vec<String>,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Container/process runtime failure.
    #[error("Runtime error during {operation}: {message}")]
    #[diagnostic(code(thinclone::runtime))]
    Runtime {
        /// The runtime operation.
        operation: String,
        /// The error message.
        message: String,
    },

    /// A multi-step operation failed at a named step.
    #[error("Failed to {step}: {source}")]
    #[diagnostic(code(thinclone::step))]
    Step {
        /// The step that failed.
        step: String,
        /// The underlying error.
        #[source]
        source: Box<ThincloneError>,
    },

    /// Invalid clone, branch or session name.
    #[error("Invalid name: {name}")]
    #[diagnostic(
        code(thinclone::name::invalid),
        help("Names must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidName {
        /// The invalid name.
        name: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(thinclone::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(thinclone::serialization))]
    Serialization(String),

    /// Feature not supported by the backend.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(thinclone::unsupported),
        help("The selected filesystem backend does not implement this capability")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(thinclone::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(thinclone::internal),
        help("This is a bug, please report it at https://github.com/thinclone/thinclone/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl ThincloneError {
    /// Wrap an error with the name of the step that produced it.
    #[must_use]
    pub fn step(step: impl Into<String>, source: Self) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error, looking through step wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error reports exhausted capacity.
    ///
    /// Callers should present these as "try again later" rather than as failures.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self.root(), Self::NoRoom { .. })
    }

    /// Whether the error reports a missing pool, snapshot, branch or clone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Self::PoolNotFound { .. }
                | Self::SnapshotNotFound { .. }
                | Self::BranchNotFound { .. }
                | Self::CloneNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for ThincloneError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ThincloneError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
