use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conn::BatchConn;
use crate::error::SqlBatchError;

/// Call-scoped context carried through every query API.
///
/// Bundles a cancellation token, an optional deadline, and the batch
/// connection currently running a batch (if any). Cloning is cheap; derived
/// contexts share the parent's cancellation lineage:
/// ```rust
/// use sql_batch_middleware::prelude::*;
/// use std::time::Duration;
///
/// let ctx = Context::background().with_timeout(Duration::from_secs(5));
/// let (ctx, cancel) = ctx.with_cancellation();
/// cancel.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    batch_conn: Option<BatchConn>,
}

impl Context {
    /// A root context: never cancelled, no deadline, no batch in progress.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the given deadline; an earlier inherited
    /// deadline is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            batch_conn: self.batch_conn.clone(),
        }
    }

    /// Derive a cancellable context, returning the token that cancels it.
    #[must_use]
    pub fn with_cancellation(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            deadline: self.deadline,
            batch_conn: self.batch_conn.clone(),
        };
        (ctx, token)
    }

    /// Derive a context shielded from the parent's cancellation.
    ///
    /// The deadline and the batch-connection slot still apply; only the
    /// cancellation lineage is severed.
    #[must_use]
    pub fn without_cancel(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: self.deadline,
            batch_conn: self.batch_conn.clone(),
        }
    }

    pub(crate) fn with_batch_conn(&self, conn: BatchConn) -> Self {
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            batch_conn: Some(conn),
        }
    }

    /// The batch connection currently running a batch, if this call is
    /// being made from inside a batch callback.
    #[must_use]
    pub fn batch_conn(&self) -> Option<&BatchConn> {
        self.batch_conn.as_ref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once this context is cancelled or its deadline passes.
    /// Pends forever on a root context.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Fail fast if this context is already done.
    ///
    /// # Errors
    /// `DeadlineExceeded` if the deadline passed, `Canceled` if the token
    /// was cancelled.
    pub fn check(&self) -> Result<(), SqlBatchError> {
        if self.deadline_passed() {
            return Err(SqlBatchError::DeadlineExceeded);
        }
        if self.cancel.is_cancelled() {
            return Err(SqlBatchError::Canceled);
        }
        Ok(())
    }

    /// Run a fallible future, racing it against cancellation and deadline.
    ///
    /// # Errors
    /// The future's own error, or `Canceled`/`DeadlineExceeded` when the
    /// context finishes first.
    pub async fn run_until_cancelled<T, F>(&self, fut: F) -> Result<T, SqlBatchError>
    where
        F: Future<Output = Result<T, SqlBatchError>>,
    {
        tokio::select! {
            res = fut => res,
            () = self.cancelled() => {
                self.check().err().map_or(Err(SqlBatchError::Canceled), Err)
            }
        }
    }
}
