//! Compensating actions for multi-step operations.

use futures::future::BoxFuture;
use thinclone_common::ThincloneResult;

/// Stack of cleanup actions run in reverse order on failure.
///
/// Actions are futures, so nothing runs until [`Rollback::run`] polls them.
/// Cleanup errors are logged and never returned.
#[derive(Default)]
pub struct Rollback<'a> {
    actions: Vec<(String, BoxFuture<'a, ThincloneResult<()>>)>,
}

impl std::fmt::Debug for Rollback<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(step, _)| step))
            .finish()
    }
}

impl<'a> Rollback<'a> {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a cleanup action undoing `step`.
    pub fn push(&mut self, step: impl Into<String>, action: BoxFuture<'a, ThincloneResult<()>>) {
        self.actions.push((step.into(), action));
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drop every action; the operation succeeded.
    pub fn disarm(&mut self) {
        self.actions.clear();
    }

    /// Run every action, most recent first.
    pub async fn run(mut self) {
        while let Some((step, action)) = self.actions.pop() {
            match action.await {
                Ok(()) => tracing::debug!(step = %step, "Rolled back"),
                Err(e) => tracing::warn!(step = %step, error = %e, "Rollback action failed"),
            }
        }
    }
}
