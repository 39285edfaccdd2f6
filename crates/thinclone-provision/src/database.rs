//! Database readiness and preparation inside an instance.

use std::time::Duration;

use thinclone_common::{ThincloneError, ThincloneResult};
use thinclone_fs::exec::args;

use crate::config::HealthCheckConfig;
use crate::runtime::{INSTANCE_SOCKET_DIR, InstanceRuntime};
use crate::session::{DOLLAR_TAG, EphemeralUser};

/// Log lines attached to a failed readiness check.
const LOG_TAIL: usize = 20;

/// Quote an SQL identifier.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statement clearing the passwords of every login role except `keep`.
#[must_use]
pub fn reset_passwords_sql(keep: &[&str]) -> String {
    let kept = keep
        .iter()
        .map(|name| quote_literal(name))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "DO {DOLLAR_TAG}
DECLARE r record;
BEGIN
  FOR r IN SELECT rolname FROM pg_catalog.pg_roles WHERE rolcanlogin AND rolname NOT IN ({kept}) LOOP
    EXECUTE format('ALTER ROLE %I PASSWORD NULL', r.rolname);
  END LOOP;
END
{DOLLAR_TAG};"
    )
}

/// Statement creating `user`, or updating it if the role already exists.
#[must_use]
pub fn ensure_user_sql(user: &EphemeralUser, database: &str) -> String {
    let role = quote_ident(&user.name);
    let attributes = if user.restricted {
        "LOGIN NOSUPERUSER NOCREATEDB NOCREATEROLE"
    } else {
        "LOGIN SUPERUSER"
    };
    let options = format!("{attributes} PASSWORD {}", quote_literal(&user.password));

    let mut sql = format!(
        "DO {DOLLAR_TAG}
BEGIN
  IF EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname = {name}) THEN
    ALTER ROLE {role} WITH {options};
  ELSE
    CREATE ROLE {role} WITH {options};
  END IF;
END
{DOLLAR_TAG};",
        name = quote_literal(&user.name),
    );
    if user.restricted {
        sql.push_str(&format!(
            "\nGRANT ALL PRIVILEGES ON DATABASE {} TO {role};",
            quote_ident(database)
        ));
    }
    sql
}

/// Admin connection to the database of one instance.
#[derive(Debug)]
pub struct DatabaseClient<'a> {
    runtime: &'a dyn InstanceRuntime,
    instance: &'a str,
    port: u16,
    admin_user: &'a str,
    database: &'a str,
}

impl<'a> DatabaseClient<'a> {
    /// Connect as `admin_user` to `database` of `instance` over its socket.
    #[must_use]
    pub fn new(
        runtime: &'a dyn InstanceRuntime,
        instance: &'a str,
        port: u16,
        admin_user: &'a str,
        database: &'a str,
    ) -> Self {
        Self {
            runtime,
            instance,
            port,
            admin_user,
            database,
        }
    }

    fn connection_args(&self, program: &str) -> Vec<String> {
        let port = self.port.to_string();
        args([
            program,
            "--host",
            INSTANCE_SOCKET_DIR,
            "--port",
            port.as_str(),
            "--username",
            self.admin_user,
            "--dbname",
            self.database,
        ])
    }

    /// Run `sql` through `psql`, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the runtime error of the failed statement.
    pub async fn execute(&self, sql: &str) -> ThincloneResult<()> {
        let mut command = self.connection_args("psql");
        command.extend(args(["--no-psqlrc", "--set", "ON_ERROR_STOP=1", "--command", sql]));
        self.runtime.exec(self.instance, &command).await?;
        Ok(())
    }

    /// Whether the database accepts connections.
    pub async fn is_ready(&self) -> bool {
        let command = self.connection_args("pg_isready");
        self.runtime.exec(self.instance, &command).await.is_ok()
    }

    /// Poll until the database accepts connections.
    ///
    /// # Errors
    ///
    /// Returns a runtime error carrying the tail of the instance log once
    /// `max_retries` probes failed.
    pub async fn wait_ready(&self, health: &HealthCheckConfig) -> ThincloneResult<()> {
        let interval = Duration::from_secs(health.interval_secs);

        for attempt in 1..=health.max_retries {
            if self.is_ready().await {
                tracing::debug!(instance = %self.instance, attempt, "Instance is ready");
                return Ok(());
            }
            if attempt < health.max_retries {
                tracing::debug!(instance = %self.instance, attempt, "Instance not ready yet");
                tokio::time::sleep(interval).await;
            }
        }

        let logs = self
            .runtime
            .logs(self.instance, LOG_TAIL)
            .await
            .unwrap_or_else(|e| format!("<logs unavailable: {e}>"));
        Err(ThincloneError::Runtime {
            operation: "readiness check".to_string(),
            message: format!(
                "instance {} not ready after {} attempts, last log lines:\n{}",
                self.instance,
                health.max_retries,
                logs.trim_end()
            ),
        })
    }

    /// Reset foreign passwords unless `keep_passwords`, then ensure `user`.
    ///
    /// # Errors
    ///
    /// Returns the first failing statement's error.
    pub async fn prepare(&self, user: &EphemeralUser, keep_passwords: bool) -> ThincloneResult<()> {
        user.validate()?;

        if !keep_passwords {
            self.execute(&reset_passwords_sql(&[self.admin_user, user.name.as_str()]))
                .await
                .map_err(|e| ThincloneError::step("reset user passwords", e))?;
        }

        self.execute(&ensure_user_sql(user, self.database))
            .await
            .map_err(|e| ThincloneError::step(format!("ensure user {}", user.name), e))?;

        tracing::debug!(instance = %self.instance, user = %user.name, "Database prepared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::FakeRuntime;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn reset_keeps_listed_roles() {
        let sql = reset_passwords_sql(&["postgres", "o'neil"]);
        assert!(sql.contains("NOT IN ('postgres', 'o''neil')"));
        assert!(sql.starts_with("DO $thinclone$"));
        assert!(sql.ends_with("$thinclone$;"));
    }

    #[test]
    fn superuser_and_restricted_roles() {
        let admin = ensure_user_sql(&EphemeralUser::new("alice", "pa'ss"), "postgres");
        assert!(admin.contains(r#"CREATE ROLE "alice" WITH LOGIN SUPERUSER PASSWORD 'pa''ss';"#));
        assert!(admin.contains("rolname = 'alice'"));
        assert!(!admin.contains("GRANT"));

        let restricted = ensure_user_sql(&EphemeralUser::new("bob", "pw").restricted(), "app");
        assert!(restricted.contains("NOSUPERUSER"));
        assert!(restricted.ends_with(r#"GRANT ALL PRIVILEGES ON DATABASE "app" TO "bob";"#));
    }

    #[tokio::test]
    async fn prepare_resets_passwords_then_ensures_user() {
        let runtime = FakeRuntime::default();
        let client = DatabaseClient::new(&runtime, "i1", 6000, "postgres", "postgres");

        client
            .prepare(&EphemeralUser::new("alice", "pw"), false)
            .await
            .unwrap();

        let execs = runtime.execs();
        assert_eq!(execs.len(), 2);
        assert!(execs[0].starts_with(
            "i1: psql --host /var/run/postgresql --port 6000 --username postgres --dbname postgres"
        ));
        assert!(execs[0].contains("PASSWORD NULL"));
        assert!(execs[1].contains("CREATE ROLE \"alice\""));
    }

    #[tokio::test]
    async fn kept_passwords_skip_the_reset() {
        let runtime = FakeRuntime::default();
        let client = DatabaseClient::new(&runtime, "i1", 6000, "postgres", "postgres");

        client
            .prepare(&EphemeralUser::new("alice", "pw"), true)
            .await
            .unwrap();
        assert_eq!(runtime.execs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_gives_up_with_logs() {
        let runtime = FakeRuntime::default();
        runtime.never_ready(true);
        let client = DatabaseClient::new(&runtime, "i1", 6000, "postgres", "postgres");

        let err = client
            .wait_ready(&HealthCheckConfig {
                interval_secs: 1,
                max_retries: 3,
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not ready after 3 attempts"));
        assert!(err.to_string().contains("FATAL: simulated"));
        assert_eq!(runtime.execs().len(), 3);
    }
}
