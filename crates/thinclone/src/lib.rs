//! # thinclone
//!
//! Server configuration, logging bootstrap and the operator CLI.

#![warn(missing_docs)]

pub mod cli;
pub mod config;

pub use config::AppConfig;
