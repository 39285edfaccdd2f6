//! Session lifecycle on top of the pool registry.
//!
//! ```text
//! start:  resolve snapshot -> allocate port -> create clone -> start instance
//!         -> wait ready -> prepare database
//! stop:   stop instance -> destroy clone (base revision) -> free port
//! reset:  resolve snapshot -> stop instance -> destroy old clone
//!         -> create clone -> start instance -> wait ready -> prepare database
//! ```
//!
//! Start and reset register a compensating action after every step that
//! changes host state. If a later step fails the actions run in reverse and
//! the original error is returned.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use thinclone_common::{SessionId, ThincloneError, ThincloneResult};
use thinclone_fs::{DEFAULT_REVISION, FsManager, Pool, Snapshot, SnapshotKind, latest_snapshot};
use thinclone_pool::PoolRegistry;

use crate::config::ProvisionConfig;
use crate::database::DatabaseClient;
use crate::events::{EventBus, ProvisionEvent};
use crate::ports::{PortPool, PortProber, PortRevision, TcpProber};
use crate::rollback::Rollback;
use crate::runtime::{
    InstanceRuntime, InstanceSpec, LABEL_APP, LABEL_BRANCH, LABEL_CLONE, LABEL_POOL, LABEL_PORT,
    LABEL_REVISION, instance_name,
};
use crate::session::{CloneRef, EphemeralUser, Session};

/// Starts, resets and stops database sessions on thin clones.
#[derive(Debug)]
pub struct Provisioner {
    registry: Arc<PoolRegistry>,
    runtime: Arc<dyn InstanceRuntime>,
    ports: PortPool,
    config: ProvisionConfig,
    events: EventBus,
}

impl Provisioner {
    /// Create a provisioner probing ports with TCP binds.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        registry: Arc<PoolRegistry>,
        runtime: Arc<dyn InstanceRuntime>,
        config: ProvisionConfig,
    ) -> ThincloneResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            runtime,
            ports: PortPool::new(config.port_pool, Arc::new(TcpProber)),
            config,
            events: EventBus::new(),
        })
    }

    /// Probe ports with `prober`. Resets the port bookkeeping.
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn PortProber>) -> Self {
        self.ports = PortPool::new(self.config.port_pool, prober);
        self
    }

    /// Provisioning events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Port bookkeeping.
    #[must_use]
    pub const fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Active settings.
    #[must_use]
    pub const fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Find a snapshot and the manager of its pool.
    ///
    /// An explicit id is looked up in every pool; `None` picks the latest
    /// data snapshot of the Active pool. Branch commits and pre-snapshots are
    /// only used when asked for by id.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no pool or snapshot matches.
    pub fn resolve_snapshot(
        &self,
        snapshot_id: Option<&str>,
    ) -> ThincloneResult<(Arc<dyn FsManager>, Snapshot)> {
        if let Some(id) = snapshot_id {
            return self
                .registry
                .get_fs_manager_list()
                .into_iter()
                .find_map(|fsm| {
                    let found = fsm.snapshot_list().into_iter().find(|s| s.id == id);
                    found.map(|snapshot| (fsm, snapshot))
                })
                .ok_or_else(|| ThincloneError::SnapshotNotFound { id: id.to_string() });
        }

        let fsm = self
            .registry
            .first()
            .ok_or_else(|| ThincloneError::PoolNotFound {
                name: "active pool".to_string(),
            })?;
        let pool = fsm.pool();
        let pre_suffix = self.registry.config().pre_snapshot_suffix;
        let snapshots = fsm.snapshot_list();
        let data = snapshots
            .iter()
            .filter(|s| SnapshotKind::classify(&pool.name, &s.id, &pre_suffix) == SnapshotKind::Data);
        let latest = latest_snapshot(data).cloned().ok_or_else(|| {
            ThincloneError::SnapshotNotFound {
                id: format!("latest data snapshot of pool {}", pool.name),
            }
        })?;
        Ok((fsm, latest))
    }

    /// Start a session on a new clone.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step. [`ThincloneError::is_capacity`]
    /// holds when no port is free. Everything done before the failure is
    /// rolled back.
    pub async fn start_session(
        &self,
        clone: &CloneRef,
        user: EphemeralUser,
        extra_config: BTreeMap<String, String>,
    ) -> ThincloneResult<Session> {
        clone.validate()?;
        user.validate()?;

        let (fsm, snapshot) = self
            .resolve_snapshot(clone.snapshot_id.as_deref())
            .map_err(|e| ThincloneError::step("resolve snapshot", e))?;

        let mut rollback = Rollback::new();
        let started = self
            .start_steps(&mut rollback, fsm, &snapshot, clone, &user, &extra_config)
            .await;
        let (pool, port) = match started {
            Ok(started) => {
                rollback.disarm();
                started
            }
            Err(e) => {
                tracing::error!(clone = %clone.name, error = %e, "Failed to start session, rolling back");
                rollback.run().await;
                return Err(e);
            }
        };

        let session = Session {
            id: SessionId::generate(),
            pool: pool.name.clone(),
            port,
            instance: instance_name(port),
            user,
            socket_dir: pool.clone_socket_dir(&clone.name),
            extra_config,
            snapshot_id: snapshot.id,
            started_at: Utc::now(),
        };

        tracing::info!(
            session = %session.id.short(),
            pool = %session.pool,
            clone = %clone.name,
            port,
            snapshot = %session.snapshot_id,
            "Session started"
        );
        self.events.publish(ProvisionEvent::SessionStarted {
            session_id: session.id.to_string(),
            pool: session.pool.clone(),
            clone: clone.name.clone(),
            port,
            timestamp: session.started_at.timestamp(),
        });
        Ok(session)
    }

    async fn start_steps<'a>(
        &'a self,
        rollback: &mut Rollback<'a>,
        fsm: Arc<dyn FsManager>,
        snapshot: &Snapshot,
        clone: &CloneRef,
        user: &EphemeralUser,
        extra_config: &BTreeMap<String, String>,
    ) -> ThincloneResult<(Arc<Pool>, u16)> {
        let port = self
            .ports
            .allocate()
            .map_err(|e| ThincloneError::step("allocate port", e))?;
        rollback.push("free port", async move { self.ports.free(port) }.boxed());

        self.create_clone(rollback, &fsm, snapshot, clone).await?;

        let pool = fsm.pool();
        self.launch(rollback, &pool, clone, port, user, extra_config)
            .await?;
        Ok((pool, port))
    }

    async fn create_clone<'a>(
        &'a self,
        rollback: &mut Rollback<'a>,
        fsm: &Arc<dyn FsManager>,
        snapshot: &Snapshot,
        clone: &CloneRef,
    ) -> ThincloneResult<()> {
        fsm.create_clone(&clone.branch, &clone.name, &snapshot.id, clone.revision)
            .await
            .map_err(|e| ThincloneError::step("create clone", e))?;

        let owner = Arc::clone(fsm);
        let (branch, name, revision) = (clone.branch.clone(), clone.name.clone(), clone.revision);
        rollback.push(
            "destroy clone",
            async move { owner.destroy_clone(&branch, &name, revision).await }.boxed(),
        );
        Ok(())
    }

    async fn launch<'a>(
        &'a self,
        rollback: &mut Rollback<'a>,
        pool: &Pool,
        clone: &CloneRef,
        port: u16,
        user: &EphemeralUser,
        extra_config: &BTreeMap<String, String>,
    ) -> ThincloneResult<()> {
        let spec = self.instance_spec(pool, clone, port, extra_config);

        // Registered before the start: a failed start may leave a container.
        let name = spec.name.clone();
        rollback.push(
            "stop instance",
            async move { self.runtime.stop(&name).await }.boxed(),
        );
        self.runtime
            .start(&spec)
            .await
            .map_err(|e| ThincloneError::step("start instance", e))?;

        let db = DatabaseClient::new(
            self.runtime.as_ref(),
            &spec.name,
            port,
            &self.config.admin_user,
            &self.config.database,
        );
        db.wait_ready(&self.config.health_check)
            .await
            .map_err(|e| ThincloneError::step("wait for instance", e))?;
        db.prepare(user, self.config.keep_user_passwords)
            .await
            .map_err(|e| ThincloneError::step("prepare database", e))
    }

    fn instance_spec(
        &self,
        pool: &Pool,
        clone: &CloneRef,
        port: u16,
        extra_config: &BTreeMap<String, String>,
    ) -> InstanceSpec {
        let labels = BTreeMap::from([
            (LABEL_APP.to_string(), "thinclone".to_string()),
            (LABEL_POOL.to_string(), pool.name.clone()),
            (LABEL_CLONE.to_string(), clone.name.clone()),
            (LABEL_BRANCH.to_string(), clone.branch.clone()),
            (LABEL_REVISION.to_string(), clone.revision.to_string()),
            (LABEL_PORT.to_string(), port.to_string()),
        ]);

        InstanceSpec {
            name: instance_name(port),
            image: self.config.image.clone(),
            port,
            data_dir: pool.clone_data_dir(&clone.branch, &clone.name, clone.revision),
            socket_dir: pool.clone_socket_dir(&clone.name),
            labels,
            options: self.config.container_config.clone(),
            settings: extra_config.clone(),
        }
    }

    /// Stop a session.
    ///
    /// The base revision of an unprotected clone is destroyed with its
    /// dataset; a clone that no longer exists counts as destroyed. The port
    /// is released last.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step; later steps are not attempted.
    pub async fn stop_session(&self, session: &Session, clone: &CloneRef) -> ThincloneResult<()> {
        self.runtime
            .stop(&session.instance)
            .await
            .map_err(|e| ThincloneError::step("stop instance", e))?;

        if clone.revision == DEFAULT_REVISION && !clone.protected {
            let fsm = self
                .registry
                .get_fs_manager(&session.pool)
                .map_err(|e| ThincloneError::step("resolve pool", e))?;
            match fsm
                .destroy_clone(&clone.branch, &clone.name, clone.revision)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(session = %session.id.short(), clone = %clone.name, "Clone already gone");
                }
                Err(e) => return Err(ThincloneError::step("destroy clone", e)),
            }
        }

        self.ports
            .free(session.port)
            .map_err(|e| ThincloneError::step("free port", e))?;

        tracing::info!(session = %session.id.short(), clone = %clone.name, port = session.port, "Session stopped");
        self.events.publish(ProvisionEvent::SessionStopped {
            session_id: session.id.to_string(),
            port: session.port,
            timestamp: Utc::now().timestamp(),
        });
        Ok(())
    }

    /// Move a session to a fresh clone of another snapshot, possibly in
    /// another pool. The session keeps its port and user.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step. The session only moves to the
    /// new pool once its old clone is handled. If the new clone cannot be
    /// started it is rolled back; the port stays reserved for the session.
    pub async fn reset_session(
        &self,
        session: &mut Session,
        clone: &CloneRef,
        snapshot_id: Option<&str>,
    ) -> ThincloneResult<()> {
        clone.validate()?;

        let (fsm, snapshot) = self
            .resolve_snapshot(snapshot_id)
            .map_err(|e| ThincloneError::step("resolve snapshot", e))?;
        let current = self
            .registry
            .get_fs_manager(&session.pool)
            .map_err(|e| ThincloneError::step("resolve current pool", e))?;

        self.runtime
            .stop(&session.instance)
            .await
            .map_err(|e| ThincloneError::step("stop instance", e))?;

        let dependents = if clone.revision == DEFAULT_REVISION {
            Vec::new()
        } else {
            current
                .clone_dependents(&clone.branch, &clone.name, clone.revision)
                .await
                .map_err(|e| ThincloneError::step("check clone dependents", e))?
        };
        if dependents.is_empty() {
            match current
                .destroy_clone(&clone.branch, &clone.name, clone.revision)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(clone = %clone.name, "Old clone already gone");
                }
                Err(e) => return Err(ThincloneError::step("destroy clone", e)),
            }
        } else {
            tracing::info!(clone = %clone.name, dependents = ?dependents, "Keeping clone with dependents");
        }

        let target = fsm.pool();
        if target.name != session.pool {
            tracing::info!(
                session = %session.id.short(),
                from = %session.pool,
                to = %target.name,
                "Moving session to another pool"
            );
            session.pool = target.name.clone();
        }
        session.socket_dir = target.clone_socket_dir(&clone.name);

        let mut rollback = Rollback::new();
        let reset = self
            .reset_steps(&mut rollback, &fsm, &snapshot, clone, session)
            .await;
        if let Err(e) = reset {
            tracing::error!(session = %session.id.short(), error = %e, "Failed to reset session, rolling back");
            rollback.run().await;
            return Err(e);
        }
        rollback.disarm();

        session.snapshot_id = snapshot.id;
        tracing::info!(
            session = %session.id.short(),
            pool = %session.pool,
            snapshot = %session.snapshot_id,
            "Session reset"
        );
        self.events.publish(ProvisionEvent::SessionReset {
            session_id: session.id.to_string(),
            pool: session.pool.clone(),
            snapshot_id: session.snapshot_id.clone(),
            timestamp: Utc::now().timestamp(),
        });
        Ok(())
    }

    async fn reset_steps<'a>(
        &'a self,
        rollback: &mut Rollback<'a>,
        fsm: &Arc<dyn FsManager>,
        snapshot: &Snapshot,
        clone: &CloneRef,
        session: &Session,
    ) -> ThincloneResult<()> {
        self.create_clone(rollback, fsm, snapshot, clone).await?;
        self.launch(
            rollback,
            &fsm.pool(),
            clone,
            session.port,
            &session.user,
            &session.extra_config,
        )
        .await
    }

    /// Stop every instance and destroy every clone whose name is not in
    /// `except`, across all pools.
    ///
    /// # Errors
    ///
    /// Keeps going after a failure and returns the first error at the end.
    pub async fn stop_all_sessions(&self, except: &HashSet<String>) -> ThincloneResult<()> {
        let mut first_error = None;
        let mut record = |e: ThincloneError| {
            first_error.get_or_insert(e);
        };

        for fsm in self.registry.get_fs_manager_list() {
            let pool = fsm.pool();

            match self.runtime.list(&format!("{LABEL_POOL}={}", pool.name)).await {
                Ok(instances) => {
                    for instance in instances {
                        let clone = instance.labels.get(LABEL_CLONE).map(String::as_str);
                        if clone.is_some_and(|c| except.contains(c)) {
                            continue;
                        }
                        if let Err(e) = self.runtime.stop(&instance.name).await {
                            tracing::warn!(pool = %pool.name, instance = %instance.name, error = %e, "Failed to stop instance");
                            record(ThincloneError::step("stop instance", e));
                            continue;
                        }
                        let port = instance
                            .labels
                            .get(LABEL_PORT)
                            .and_then(|p| p.parse::<u16>().ok());
                        if let Some(port) = port {
                            if let Err(e) = self.ports.free(port) {
                                tracing::warn!(instance = %instance.name, error = %e, "Instance port is outside the pool");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(pool = %pool.name, error = %e, "Failed to list instances");
                    record(ThincloneError::step("list instances", e));
                }
            }

            let clones = match fsm.list_clones().await {
                Ok(clones) => clones,
                Err(e) => {
                    tracing::warn!(pool = %pool.name, error = %e, "Failed to list clones");
                    record(ThincloneError::step("list clones", e));
                    continue;
                }
            };
            let doomed: BTreeSet<(String, String)> = clones
                .into_iter()
                .filter(|c| !except.contains(&c.name))
                .map(|c| (c.branch, c.name))
                .collect();

            for (branch, name) in doomed {
                match fsm.destroy_clone(&branch, &name, DEFAULT_REVISION).await {
                    Ok(()) => tracing::info!(pool = %pool.name, clone = %name, "Clone destroyed"),
                    Err(e) => {
                        tracing::warn!(pool = %pool.name, clone = %name, error = %e, "Failed to destroy clone");
                        record(ThincloneError::step(format!("destroy clone {name}"), e));
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Align the port bookkeeping with the host.
    pub fn revise_port_pool(&self) -> PortRevision {
        let revision = self.ports.revise();
        if revision != PortRevision::default() {
            tracing::info!(bound = revision.bound, freed = revision.freed, "Port pool revised");
        }
        self.events.publish(ProvisionEvent::PortPoolRevised {
            bound: revision.bound,
            freed: revision.freed,
            timestamp: Utc::now().timestamp(),
        });
        revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use chrono::{DateTime, Duration};
    use tempfile::TempDir;
    use thinclone_fs::marker::LOGICAL_DATA_TYPE;
    use thinclone_fs::snapshot::parse_dsa;
    use thinclone_fs::branching::commit;
    use thinclone_fs::{Branching, Cloner, DataMarker, MemoryManager, Pooler};
    use thinclone_pool::PoolConfig;

    use crate::config::HealthCheckConfig;
    use crate::ports::testing::FakeProber;
    use crate::runtime::testing::FakeRuntime;
    use crate::testing::{DirProbe, MemoryFactory};

    const LATEST_A: &str = "pool_a@snapshot_20240601120000";
    const SNAPSHOT_B: &str = "pool_b@snapshot_20240601130000";

    struct Harness {
        _temp: TempDir,
        factory: Arc<MemoryFactory>,
        runtime: Arc<FakeRuntime>,
        prober: Arc<FakeProber>,
        provisioner: Provisioner,
    }

    impl Harness {
        fn pool(&self, name: &str) -> Arc<MemoryManager> {
            self.factory.manager(name)
        }

        async fn clones(&self, pool: &str) -> Vec<String> {
            self.pool(pool).list_clones_names().await.unwrap()
        }
    }

    fn at(hours: i64) -> DateTime<Utc> {
        parse_dsa("20240601120000").unwrap() + Duration::hours(hours)
    }

    fn snapshot(id: &str, pool: &str, hours: i64) -> Snapshot {
        Snapshot::new(id, pool, at(hours)).with_data_state_at(at(hours))
    }

    fn user() -> EphemeralUser {
        EphemeralUser::new("alice", "secret")
    }

    async fn harness() -> Harness {
        let temp = tempfile::tempdir().unwrap();
        for dir in ["pool_a", "pool_b"] {
            fs::create_dir_all(temp.path().join(dir).join("data")).unwrap();
        }
        DataMarker::new(LOGICAL_DATA_TYPE, at(0))
            .save(&temp.path().join("pool_a").join("data"))
            .unwrap();

        let factory = Arc::new(MemoryFactory::default());
        let registry = Arc::new(PoolRegistry::new(
            PoolConfig::default().with_mount_dir(temp.path()),
            Arc::new(DirProbe),
            Arc::clone(&factory) as Arc<dyn thinclone_pool::ManagerFactory>,
        ));
        registry.discover().await.unwrap();

        let a = factory.manager("pool_a");
        a.insert_snapshot(&snapshot("pool_a@snapshot_20240601110000", "pool_a", -1));
        a.insert_snapshot(&snapshot(LATEST_A, "pool_a", 0));
        factory
            .manager("pool_b")
            .insert_snapshot(&snapshot(SNAPSHOT_B, "pool_b", 1));

        let runtime = Arc::new(FakeRuntime::default());
        let prober = Arc::new(FakeProber::default());
        let config = ProvisionConfig {
            health_check: HealthCheckConfig {
                interval_secs: 0,
                max_retries: 2,
            },
            ..ProvisionConfig::default()
        }
        .with_port_range(6000, 6002);

        let provisioner = Provisioner::new(
            registry,
            Arc::clone(&runtime) as Arc<dyn InstanceRuntime>,
            config,
        )
        .unwrap()
        .with_prober(Arc::clone(&prober) as Arc<dyn PortProber>);

        Harness {
            _temp: temp,
            factory,
            runtime,
            prober,
            provisioner,
        }
    }

    #[test_log::test(tokio::test)]
    async fn session_starts_on_latest_snapshot_of_active_pool() {
        let h = harness().await;
        let mut events = h.provisioner.events().subscribe();

        let extra = BTreeMap::from([("work_mem".to_string(), "64MB".to_string())]);
        let session = h
            .provisioner
            .start_session(&CloneRef::new("c1"), user(), extra)
            .await
            .unwrap();

        assert_eq!(session.pool, "pool_a");
        assert_eq!(session.port, 6000);
        assert_eq!(session.snapshot_id, LATEST_A);
        assert_eq!(session.instance, "thinclone_clone_6000");
        assert_eq!(h.clones("pool_a").await, vec!["c1"]);
        assert!(h.provisioner.ports().is_bound(6000));

        let pool = h.pool("pool_a").pool();
        let spec = h.runtime.spec(&session.instance).unwrap();
        assert_eq!(spec.data_dir, pool.clone_data_dir("main", "c1", 0));
        assert_eq!(spec.socket_dir, session.socket_dir);
        assert_eq!(spec.labels[LABEL_POOL], "pool_a");
        assert_eq!(spec.labels[LABEL_PORT], "6000");
        assert_eq!(spec.settings["work_mem"], "64MB");

        let execs = h.runtime.execs();
        assert!(execs.iter().any(|e| e.contains("pg_isready")));
        assert!(execs.iter().any(|e| e.contains("CREATE ROLE \"alice\"")));

        assert!(matches!(
            events.recv().await.unwrap(),
            ProvisionEvent::SessionStarted { port: 6000, .. }
        ));
    }

    #[tokio::test]
    async fn explicit_snapshot_selects_its_pool() {
        let h = harness().await;
        let session = h
            .provisioner
            .start_session(
                &CloneRef::new("c1").with_snapshot(SNAPSHOT_B),
                user(),
                BTreeMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(session.pool, "pool_b");
        assert_eq!(
            session.socket_dir,
            h.pool("pool_b").pool().clone_socket_dir("c1")
        );
        assert_eq!(h.clones("pool_b").await, vec!["c1"]);
        assert!(h.clones("pool_a").await.is_empty());
    }

    #[tokio::test]
    async fn default_snapshot_ignores_commits_and_pre_snapshots() {
        let h = harness().await;
        let a = h.pool("pool_a");
        a.insert_snapshot(&snapshot("pool_a@snapshot_20240601150000_pre", "pool_a", 3));
        a.create_branch("dev", LATEST_A).await.unwrap();
        a.create_clone("dev", "scratch", LATEST_A, 0).await.unwrap();
        let head = commit(&*a, "dev", "scratch", 0, "wip").await.unwrap();

        let (fsm, latest) = h.provisioner.resolve_snapshot(None).unwrap();
        assert_eq!(fsm.pool().name, "pool_a");
        assert_eq!(latest.id, LATEST_A);

        let (_, explicit) = h.provisioner.resolve_snapshot(Some(head.as_str())).unwrap();
        assert_eq!(explicit.data_state_at, Some(at(0)));
    }

    #[tokio::test]
    async fn unknown_snapshot_allocates_nothing() {
        let h = harness().await;
        let err = h
            .provisioner
            .start_session(
                &CloneRef::new("c1").with_snapshot("pool_a@missing"),
                user(),
                BTreeMap::new(),
            )
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(h.provisioner.ports().bound_count(), 0);
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_behind() {
        for (failure, step) in [
            ("start", "start instance"),
            ("ready", "wait for instance"),
            ("prepare", "prepare database"),
        ] {
            let h = harness().await;
            match failure {
                "start" => h.runtime.fail_start(true),
                "ready" => h.runtime.never_ready(true),
                _ => h.runtime.fail_exec(Some("CREATE ROLE")),
            }

            let err = h
                .provisioner
                .start_session(&CloneRef::new("c1"), user(), BTreeMap::new())
                .await
                .unwrap_err();

            assert!(
                err.to_string().starts_with(&format!("Failed to {step}")),
                "{failure}: {err}"
            );
            assert_eq!(h.provisioner.ports().bound_count(), 0, "{failure}");
            assert!(h.clones("pool_a").await.is_empty(), "{failure}");
            assert!(h.runtime.running().is_empty(), "{failure}");
        }
    }

    #[tokio::test]
    async fn failed_clone_creation_frees_the_port_only() {
        let h = harness().await;
        h.pool("pool_a")
            .create_clone("main", "c1", LATEST_A, 0)
            .await
            .unwrap();

        let err = h
            .provisioner
            .start_session(&CloneRef::new("c1"), user(), BTreeMap::new())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failed to create clone"));
        assert_eq!(h.provisioner.ports().bound_count(), 0);
        assert_eq!(h.clones("pool_a").await, vec!["c1"]);
        assert!(h.runtime.stops().is_empty());
    }

    #[tokio::test]
    async fn exhausted_ports_are_a_capacity_error() {
        let h = harness().await;
        for name in ["c1", "c2", "c3"] {
            h.provisioner
                .start_session(&CloneRef::new(name), user(), BTreeMap::new())
                .await
                .unwrap();
        }

        let err = h
            .provisioner
            .start_session(&CloneRef::new("c4"), user(), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(h.clones("pool_a").await, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn stopping_the_base_revision_destroys_the_clone() {
        let h = harness().await;
        let clone = CloneRef::new("c1");
        let session = h
            .provisioner
            .start_session(&clone, user(), BTreeMap::new())
            .await
            .unwrap();

        h.provisioner.stop_session(&session, &clone).await.unwrap();

        assert!(h.clones("pool_a").await.is_empty());
        assert!(h.runtime.running().is_empty());
        assert!(!h.provisioner.ports().is_bound(session.port));
    }

    #[tokio::test]
    async fn protected_and_forked_clones_survive_a_stop() {
        let h = harness().await;
        for clone in [CloneRef::new("c1").protected(), CloneRef::new("c2").with_revision(1)] {
            let session = h
                .provisioner
                .start_session(&clone, user(), BTreeMap::new())
                .await
                .unwrap();
            h.provisioner.stop_session(&session, &clone).await.unwrap();
        }

        assert_eq!(h.clones("pool_a").await, vec!["c1", "c2"]);
        assert_eq!(h.provisioner.ports().bound_count(), 0);
        assert!(h.runtime.running().is_empty());
    }

    #[tokio::test]
    async fn reset_moves_the_session_and_keeps_its_port() {
        let h = harness().await;
        let clone = CloneRef::new("c1");
        let mut session = h
            .provisioner
            .start_session(&clone, user(), BTreeMap::new())
            .await
            .unwrap();
        let mut events = h.provisioner.events().subscribe();

        h.provisioner
            .reset_session(&mut session, &clone, Some(SNAPSHOT_B))
            .await
            .unwrap();

        assert_eq!(session.pool, "pool_b");
        assert_eq!(session.port, 6000);
        assert_eq!(session.snapshot_id, SNAPSHOT_B);
        assert_eq!(h.provisioner.ports().bound_count(), 1);
        assert!(h.clones("pool_a").await.is_empty());
        assert_eq!(h.clones("pool_b").await, vec!["c1"]);

        let spec = h.runtime.spec("thinclone_clone_6000").unwrap();
        assert_eq!(spec.labels[LABEL_POOL], "pool_b");

        let ensured = h
            .runtime
            .execs()
            .iter()
            .filter(|e| e.contains("CREATE ROLE \"alice\""))
            .count();
        assert_eq!(ensured, 2);

        assert!(matches!(
            events.recv().await.unwrap(),
            ProvisionEvent::SessionReset { .. }
        ));
    }

    #[tokio::test]
    async fn failed_reset_rolls_back_but_keeps_the_port() {
        let h = harness().await;
        let clone = CloneRef::new("c1");
        let mut session = h
            .provisioner
            .start_session(&clone, user(), BTreeMap::new())
            .await
            .unwrap();

        h.runtime.fail_start(true);
        let err = h
            .provisioner
            .reset_session(&mut session, &clone, None)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failed to start instance"));
        assert!(h.provisioner.ports().is_bound(6000));
        assert!(h.clones("pool_a").await.is_empty());
        assert!(h.runtime.running().is_empty());
    }

    #[tokio::test]
    async fn session_stops_cleanly_after_a_failed_reset() {
        let h = harness().await;
        let clone = CloneRef::new("c1");
        let mut session = h
            .provisioner
            .start_session(&clone, user(), BTreeMap::new())
            .await
            .unwrap();

        h.runtime.fail_start(true);
        h.provisioner
            .reset_session(&mut session, &clone, None)
            .await
            .unwrap_err();
        h.runtime.fail_start(false);

        h.provisioner.stop_session(&session, &clone).await.unwrap();
        assert!(!h.provisioner.ports().is_bound(6000));
        assert!(h.clones("pool_a").await.is_empty());
        assert!(h.runtime.running().is_empty());
    }

    #[tokio::test]
    async fn interrupted_reset_keeps_the_session_on_its_pool() {
        let h = harness().await;
        let clone = CloneRef::new("c1");
        let mut session = h
            .provisioner
            .start_session(&clone, user(), BTreeMap::new())
            .await
            .unwrap();
        let socket_dir = session.socket_dir.clone();

        h.runtime.fail_stop(true);
        let err = h
            .provisioner
            .reset_session(&mut session, &clone, Some(SNAPSHOT_B))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to stop instance"));
        assert_eq!(session.pool, "pool_a");
        assert_eq!(session.socket_dir, socket_dir);
        assert_eq!(h.clones("pool_a").await, vec!["c1"]);
        assert!(h.clones("pool_b").await.is_empty());

        h.runtime.fail_stop(false);
        h.provisioner.stop_session(&session, &clone).await.unwrap();
        assert!(h.clones("pool_a").await.is_empty());
        assert_eq!(h.provisioner.ports().bound_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_spares_excepted_clones() {
        let h = harness().await;
        for name in ["c1", "c2"] {
            h.provisioner
                .start_session(&CloneRef::new(name), user(), BTreeMap::new())
                .await
                .unwrap();
        }

        h.provisioner
            .stop_all_sessions(&HashSet::from(["c2".to_string()]))
            .await
            .unwrap();

        assert_eq!(h.clones("pool_a").await, vec!["c2"]);
        assert_eq!(h.runtime.running(), vec!["thinclone_clone_6001"]);
        assert!(!h.provisioner.ports().is_bound(6000));
        assert!(h.provisioner.ports().is_bound(6001));
    }

    #[tokio::test]
    async fn revision_marks_ports_held_by_other_processes() {
        let h = harness().await;
        h.provisioner
            .start_session(&CloneRef::new("c1"), user(), BTreeMap::new())
            .await
            .unwrap();
        h.prober.set_busy(6000, true);
        h.prober.set_busy(6002, true);

        let revision = h.provisioner.revise_port_pool();
        assert_eq!(revision, PortRevision { bound: 1, freed: 0 });
        assert_eq!(h.provisioner.ports().bound_count(), 2);

        let session = h
            .provisioner
            .start_session(&CloneRef::new("c2"), user(), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(session.port, 6001);
    }
}
