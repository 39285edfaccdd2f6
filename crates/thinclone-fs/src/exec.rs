//! External command execution.
//!
//! Backends never spawn processes directly; they go through a
//! [`CommandRunner`] so tests can script command output.

use std::fmt::Debug;
use std::process::Stdio;

use async_trait::async_trait;
use thinclone_common::{ThincloneError, ThincloneResult};
use tokio::process::Command;

/// Runs external commands and returns their standard output.
#[async_trait]
pub trait CommandRunner: Debug + Send + Sync {
    /// Run `program` with `args`.
    ///
    /// Dropping the returned future aborts the command.
    async fn run(&self, program: &str, args: &[String]) -> ThincloneResult<String>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct HostRunner {
    /// Prefix every command with `sudo -n`.
    use_sudo: bool,
}

impl HostRunner {
    /// Create a runner executing commands directly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every command with non-interactive `sudo`.
    #[must_use]
    pub fn with_sudo(mut self) -> Self {
        self.use_sudo = true;
        self
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> ThincloneResult<String> {
        let mut command = if self.use_sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg(program);
            sudo
        } else {
            Command::new(program)
        };

        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program, args = ?args, "Running command");

        let output = command.output().await.map_err(|e| ThincloneError::Command {
            program: program.to_string(),
            args: args.to_vec(),
            status: "spawn failed".to_string(),
            stderr: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(ThincloneError::Command {
                program: program.to_string(),
                args: args.to_vec(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Build an owned argument list.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Quote a value for `sh -c`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_runner_captures_stdout() {
        let out = HostRunner::new()
            .run("echo", &args(["hello"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn host_runner_reports_failures() {
        let err = HostRunner::new()
            .run("sh", &args(["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ThincloneError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("pool@snap"), "'pool@snap'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
