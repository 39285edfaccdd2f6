//! Contract of the data retrieval jobs that fill a pool.
//!
//! Jobs themselves (dump/restore, physical restore) live outside this crate.
//! The registry only relies on their side effects: the pool's data directory
//! holds fresh data and a data marker recording its timestamp.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thinclone_common::ThincloneResult;
use thinclone_fs::Pool;

/// Options a job is reloaded with before a run.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Pool the job fills.
    pub pool: Arc<Pool>,
    /// Job-specific settings.
    pub settings: serde_yaml::Value,
}

impl JobOptions {
    /// Options targeting `pool` with no extra settings.
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            settings: serde_yaml::Value::Null,
        }
    }

    /// Attach job-specific settings.
    #[must_use]
    pub fn with_settings(mut self, settings: serde_yaml::Value) -> Self {
        self.settings = settings;
        self
    }
}

/// A database backend currently busy with a retrieval query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PgActivity {
    /// Role running the query.
    pub user: String,
    /// Query text.
    pub query: String,
    /// Seconds since the query started.
    pub duration_secs: u64,
    /// Wait event, if any.
    pub wait_event: Option<String>,
}

/// What a running job is doing on its source and target databases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Activity on the source database.
    pub source: Vec<PgActivity>,
    /// Activity on the pool's database.
    pub target: Vec<PgActivity>,
}

/// A data retrieval job.
///
/// Dropping the future returned by [`JobRunner::run`] cancels the job.
#[async_trait]
pub trait JobRunner: std::fmt::Debug + Send + Sync {
    /// Job name.
    fn name(&self) -> &str;

    /// Apply new options before the next run.
    async fn reload(&self, options: JobOptions) -> ThincloneResult<()>;

    /// Run the job to completion.
    async fn run(&self) -> ThincloneResult<()>;

    /// Report current database activity of the job.
    async fn report_activity(&self) -> ThincloneResult<Activity>;
}
