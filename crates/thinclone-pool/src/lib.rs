//! # thinclone-pool
//!
//! Registry of the copy-on-write pools mounted on the host.
//!
//! The registry discovers pools under the configured mount directory, builds
//! exactly one filesystem manager per pool and keeps the pools ordered: the
//! front is the Active pool, pools towards the back are the first candidates
//! for a background full refresh.
//!
//! ```text
//!   front                                   back
//!   [ active ] <-> [ pool ] <-> ... <-> [ pool ]
//!                                         ^ get_pool_to_update() scans from here
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod factory;
pub mod probe;
pub mod refresh;
pub mod registry;
pub mod retrieval;

pub use config::{LvmConfig, PoolConfig, RefreshConfig};
pub use factory::{BackendFactory, ManagerFactory};
pub use probe::{PoolProbe, StatfsProbe};
pub use refresh::FullRefresh;
pub use registry::PoolRegistry;
pub use retrieval::{Activity, JobOptions, JobRunner};
