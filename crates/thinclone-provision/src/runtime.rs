//! Database instance runtime.
//!
//! Instances run as containers named `thinclone_clone_<port>`, with the clone's
//! data directory and socket directory mounted from the host. They use host
//! networking and listen on the session port.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::CommandRunner;
use thinclone_fs::exec::args;

/// Label present on every instance started by thinclone.
pub const LABEL_APP: &str = "thinclone.app";
/// Label holding the pool name.
pub const LABEL_POOL: &str = "thinclone.pool";
/// Label holding the clone name.
pub const LABEL_CLONE: &str = "thinclone.clone";
/// Label holding the branch name.
pub const LABEL_BRANCH: &str = "thinclone.branch";
/// Label holding the clone revision.
pub const LABEL_REVISION: &str = "thinclone.revision";
/// Label holding the session port.
pub const LABEL_PORT: &str = "thinclone.port";

/// Data directory inside the instance.
pub const INSTANCE_DATA_DIR: &str = "/var/lib/postgresql/pgdata";
/// Socket directory inside the instance.
pub const INSTANCE_SOCKET_DIR: &str = "/var/run/postgresql";

const DOCKER: &str = "docker";

/// Name of the instance serving `port`.
#[must_use]
pub fn instance_name(port: u16) -> String {
    format!("thinclone_clone_{port}")
}

/// Everything needed to start an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Instance name.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Port the database listens on.
    pub port: u16,
    /// Host directory holding the database files.
    pub data_dir: PathBuf,
    /// Host directory for the unix socket.
    pub socket_dir: PathBuf,
    /// Metadata labels.
    pub labels: BTreeMap<String, String>,
    /// Runtime options, passed as `--<key>=<value>`.
    pub options: BTreeMap<String, String>,
    /// Database settings, passed as `-c <key>=<value>`.
    pub settings: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Arguments of `docker run`.
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut run = args([
            "run",
            "--detach",
            "--name",
            self.name.as_str(),
            "--network",
            "host",
            "--restart",
            "on-failure",
        ]);
        run.push("--env".to_string());
        run.push(format!("PGDATA={INSTANCE_DATA_DIR}"));
        run.push("--volume".to_string());
        run.push(format!("{}:{INSTANCE_DATA_DIR}", self.data_dir.display()));
        run.push("--volume".to_string());
        run.push(format!("{}:{INSTANCE_SOCKET_DIR}", self.socket_dir.display()));

        for (key, value) in &self.labels {
            run.push("--label".to_string());
            run.push(format!("{key}={value}"));
        }
        for (key, value) in &self.options {
            run.push(format!("--{key}={value}"));
        }

        run.push(self.image.clone());
        let port = self.port.to_string();
        run.extend(args(["postgres", "-p", port.as_str(), "-k", INSTANCE_SOCKET_DIR]));
        for (key, value) in &self.settings {
            run.push("-c".to_string());
            run.push(format!("{key}={value}"));
        }
        run
    }
}

/// A known instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Instance name.
    pub name: String,
    /// Runtime identifier.
    pub id: String,
    /// Whether the instance is running.
    pub running: bool,
    /// Metadata labels.
    pub labels: BTreeMap<String, String>,
}

/// Starts and supervises database instances.
#[async_trait]
pub trait InstanceRuntime: Debug + Send + Sync {
    /// Start an instance and return its runtime identifier.
    async fn start(&self, spec: &InstanceSpec) -> ThincloneResult<String>;

    /// Stop and remove an instance. A missing instance is not an error.
    async fn stop(&self, name: &str) -> ThincloneResult<()>;

    /// Look up an instance.
    async fn inspect(&self, name: &str) -> ThincloneResult<Option<InstanceInfo>>;

    /// Run a command inside an instance and return its output.
    async fn exec(&self, name: &str, command: &[String]) -> ThincloneResult<String>;

    /// Last `tail` lines of the instance log.
    async fn logs(&self, name: &str, tail: usize) -> ThincloneResult<String>;

    /// Instances carrying the `key=value` label.
    async fn list(&self, label: &str) -> ThincloneResult<Vec<InstanceInfo>>;
}

/// Runtime driving the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
    id: String,
    name: String,
    state: InspectedState,
    config: InspectedConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl From<Inspected> for InstanceInfo {
    fn from(inspected: Inspected) -> Self {
        Self {
            name: inspected.name.trim_start_matches('/').to_string(),
            id: inspected.id,
            running: inspected.state.running,
            labels: inspected.config.labels.unwrap_or_default(),
        }
    }
}

fn is_missing(err: &ThincloneError) -> bool {
    matches!(err, ThincloneError::Command { stderr, .. } if stderr.contains("No such"))
}

impl DockerCli {
    /// Create a runtime running `docker` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn docker(&self, items: Vec<String>) -> ThincloneResult<String> {
        self.runner.run(DOCKER, &items).await
    }

    async fn inspect_many(&self, names: &[String]) -> ThincloneResult<Vec<InstanceInfo>> {
        let mut items = args(["inspect", "--type", "container"]);
        items.extend(names.iter().cloned());
        let out = self.docker(items).await?;
        let inspected: Vec<Inspected> = serde_json::from_str(&out)?;
        Ok(inspected.into_iter().map(InstanceInfo::from).collect())
    }
}

#[async_trait]
impl InstanceRuntime for DockerCli {
    async fn start(&self, spec: &InstanceSpec) -> ThincloneResult<String> {
        tracing::info!(instance = %spec.name, image = %spec.image, port = spec.port, "Starting instance");
        let out = self.docker(spec.run_args()).await?;
        Ok(out.trim().to_string())
    }

    async fn stop(&self, name: &str) -> ThincloneResult<()> {
        match self.docker(args(["rm", "--force", "--volumes", name])).await {
            Ok(_) => {
                tracing::info!(instance = %name, "Instance removed");
                Ok(())
            }
            Err(e) if is_missing(&e) => {
                tracing::debug!(instance = %name, "Instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, name: &str) -> ThincloneResult<Option<InstanceInfo>> {
        match self.inspect_many(&[name.to_string()]).await {
            Ok(mut found) => Ok(found.pop()),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, name: &str, command: &[String]) -> ThincloneResult<String> {
        let mut items = args(["exec", name]);
        items.extend(command.iter().cloned());
        self.docker(items).await
    }

    async fn logs(&self, name: &str, tail: usize) -> ThincloneResult<String> {
        let tail = tail.to_string();
        self.docker(args(["logs", "--tail", tail.as_str(), name]))
            .await
    }

    async fn list(&self, label: &str) -> ThincloneResult<Vec<InstanceInfo>> {
        let filter = format!("label={label}");
        let out = self
            .docker(args([
                "ps",
                "--all",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.Names}}",
            ]))
            .await?;

        let names: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        self.inspect_many(&names).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// In-process runtime recording instances and commands.
    #[derive(Debug, Default)]
    pub(crate) struct FakeRuntime {
        instances: Mutex<BTreeMap<String, InstanceSpec>>,
        execs: Mutex<Vec<String>>,
        stops: Mutex<Vec<String>>,
        fail_start: Mutex<bool>,
        fail_stop: Mutex<bool>,
        not_ready: Mutex<bool>,
        fail_exec: Mutex<Option<String>>,
    }

    impl FakeRuntime {
        pub(crate) fn fail_start(&self, fail: bool) {
            *self.fail_start.lock() = fail;
        }

        pub(crate) fn fail_stop(&self, fail: bool) {
            *self.fail_stop.lock() = fail;
        }

        pub(crate) fn never_ready(&self, never: bool) {
            *self.not_ready.lock() = never;
        }

        /// Fail every exec whose command line contains `needle`.
        pub(crate) fn fail_exec(&self, needle: Option<&str>) {
            *self.fail_exec.lock() = needle.map(ToString::to_string);
        }

        pub(crate) fn running(&self) -> Vec<String> {
            self.instances.lock().keys().cloned().collect()
        }

        pub(crate) fn spec(&self, name: &str) -> Option<InstanceSpec> {
            self.instances.lock().get(name).cloned()
        }

        pub(crate) fn execs(&self) -> Vec<String> {
            self.execs.lock().clone()
        }

        pub(crate) fn stops(&self) -> Vec<String> {
            self.stops.lock().clone()
        }

        fn failure(operation: &str) -> ThincloneError {
            ThincloneError::Runtime {
                operation: operation.to_string(),
                message: "simulated failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl InstanceRuntime for FakeRuntime {
        async fn start(&self, spec: &InstanceSpec) -> ThincloneResult<String> {
            // A failed start still leaves a container behind.
            self.instances
                .lock()
                .insert(spec.name.clone(), spec.clone());
            if *self.fail_start.lock() {
                return Err(Self::failure("start"));
            }
            Ok(format!("id-{}", spec.name))
        }

        async fn stop(&self, name: &str) -> ThincloneResult<()> {
            self.stops.lock().push(name.to_string());
            if *self.fail_stop.lock() {
                return Err(Self::failure("stop"));
            }
            self.instances.lock().remove(name);
            Ok(())
        }

        async fn inspect(&self, name: &str) -> ThincloneResult<Option<InstanceInfo>> {
            Ok(self.instances.lock().get(name).map(|spec| InstanceInfo {
                name: spec.name.clone(),
                id: format!("id-{}", spec.name),
                running: true,
                labels: spec.labels.clone(),
            }))
        }

        async fn exec(&self, name: &str, command: &[String]) -> ThincloneResult<String> {
            let line = command.join(" ");
            self.execs.lock().push(format!("{name}: {line}"));

            if *self.not_ready.lock() && line.starts_with("pg_isready") {
                return Err(Self::failure("pg_isready"));
            }
            if let Some(needle) = self.fail_exec.lock().as_deref() {
                if line.contains(needle) {
                    return Err(Self::failure("exec"));
                }
            }
            Ok(String::new())
        }

        async fn logs(&self, name: &str, _tail: usize) -> ThincloneResult<String> {
            Ok(format!("{name}: FATAL: simulated"))
        }

        async fn list(&self, label: &str) -> ThincloneResult<Vec<InstanceInfo>> {
            let (key, value) = label.split_once('=').unwrap_or((label, ""));
            Ok(self
                .instances
                .lock()
                .values()
                .filter(|spec| spec.labels.get(key).is_some_and(|v| v == value))
                .map(|spec| InstanceInfo {
                    name: spec.name.clone(),
                    id: format!("id-{}", spec.name),
                    running: true,
                    labels: spec.labels.clone(),
                })
                .collect())
        }
    }
}
