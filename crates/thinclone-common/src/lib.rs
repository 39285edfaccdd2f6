//! # thinclone-common
//!
//! Shared utilities and types for the thinclone crates.
//!
//! This crate provides common functionality used across all thinclone crates:
//! - The error taxonomy shared by pools, backends and the provisioner
//! - Clone, branch and session name validation
//! - Standard host paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ThincloneError, ThincloneResult};
pub use id::{CloneName, SessionId};
pub use paths::ThinclonePaths;
