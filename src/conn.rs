use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::batch::{Batch, Request};
use crate::context::Context;
use crate::driver::{BatchRequestsSender, BatchRound, DriverConnection, TxOptions};
use crate::error::SqlBatchError;
use crate::named::bind_named;
use crate::options::BatchOptions;
use crate::results::{DbRow, ResultSet};
use crate::runner::BatchRunner;
use crate::tx::BatchTx;
use crate::types::{PlaceholderStyle, RowValues};

struct ConnState {
    runner: Option<Arc<BatchRunner>>,
    in_tx: bool,
    done: bool,
}

pub(crate) struct BatchConnCore {
    /// The pinned driver connection; `None` once the connection is closed
    /// and the underlying object has been released to the pool.
    conn: tokio::sync::Mutex<Option<Box<dyn DriverConnection>>>,
    state: Mutex<ConnState>,
    style: PlaceholderStyle,
    options: BatchOptions,
}

/// A batch-aware connection: exclusively owns one pooled driver connection
/// for its lifetime and holds at most one active batch runner.
///
/// Outside a batch, query methods forward straight to the driver
/// connection. While a batch runs, each query method invokes the driver
/// twice around a round trip: the first invocation is a side-effect-free
/// queueing probe (the driver hands the request to the runner and fails
/// with [`SqlBatchError::BatchNotReady`]), and the second invocation after
/// the round trip consumes the callback's result from the round's handle.
///
/// Cheap to clone; all clones refer to the same underlying connection.
#[derive(Clone)]
pub struct BatchConn {
    core: Arc<BatchConnCore>,
}

// Manual Debug implementation because the boxed driver connection does
// not expose `Debug`.
impl fmt::Debug for BatchConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("BatchConn")
            .field("batch_running", &state.runner.is_some())
            .field("in_tx", &state.in_tx)
            .field("done", &state.done)
            .finish()
    }
}

impl BatchConn {
    pub(crate) fn new(conn: Box<dyn DriverConnection>, options: BatchOptions) -> Self {
        let style = conn.placeholder_style();
        Self {
            core: Arc::new(BatchConnCore {
                conn: tokio::sync::Mutex::new(Some(conn)),
                state: Mutex::new(ConnState {
                    runner: None,
                    in_tx: false,
                    done: false,
                }),
                style,
                options,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.core
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The runner of the batch currently in progress.
    ///
    /// Only for use in driver implementation code.
    ///
    /// # Errors
    /// `NoRunningBatch` when no batch is in progress.
    pub fn batch_runner(&self) -> Result<Arc<BatchRunner>, SqlBatchError> {
        self.state()
            .runner
            .clone()
            .ok_or(SqlBatchError::NoRunningBatch)
    }

    /// Whether a batch is currently running on this connection.
    #[must_use]
    pub fn is_batch_running(&self) -> bool {
        self.state().runner.is_some()
    }

    #[must_use]
    pub fn placeholder_style(&self) -> PlaceholderStyle {
        self.core.style
    }

    pub(crate) fn finish_tx(&self) {
        self.state().in_tx = false;
    }

    fn maybe_without_cancel(&self, ctx: &Context) -> Context {
        // The shield never applies inside a server-side transaction: a
        // cancelled transaction must abort rather than keep running
        // statements the caller gave up on.
        if !self.state().in_tx && self.core.options.without_cancel {
            ctx.without_cancel()
        } else {
            ctx.clone()
        }
    }

    /// Run a batch on this connection.
    ///
    /// Creates a runner, installs it as active, runs the batch to
    /// completion, and clears the runner regardless of outcome.
    ///
    /// # Errors
    /// `ConnDone` on a closed connection, `HasRunningBatch` when a batch
    /// is already in progress, otherwise whatever
    /// [`BatchRunner::run`] returns.
    pub async fn send_batch(&self, ctx: &Context, batch: &Batch) -> Result<(), SqlBatchError> {
        let runner = {
            let mut state = self.state();
            if state.done {
                return Err(SqlBatchError::ConnDone);
            }
            if state.runner.is_some() {
                return Err(SqlBatchError::HasRunningBatch);
            }
            let sender: Arc<dyn BatchRequestsSender> = self.core.clone();
            let runner = Arc::new(BatchRunner::new(sender));
            state.runner = Some(Arc::clone(&runner));
            runner
        };

        debug!(callbacks = batch.len(), "running batch on connection");

        let ctx = ctx.with_batch_conn(self.clone());
        let result = runner.run(&ctx, batch).await;

        self.state().runner = None;

        result
    }

    /// Begin a server-side transaction and return a batch-capable handle.
    ///
    /// Once the transaction has begun, use only the returned [`BatchTx`];
    /// commit or rollback releases this connection.
    ///
    /// # Errors
    /// `ConnDone`, `NestedTxNotSupported` when a transaction is already
    /// open, `HasRunningBatch` during a batch, or driver errors.
    pub async fn begin_batch_tx(
        &self,
        ctx: &Context,
        opts: TxOptions,
    ) -> Result<BatchTx, SqlBatchError> {
        {
            let state = self.state();
            if state.done {
                return Err(SqlBatchError::ConnDone);
            }
            if state.in_tx {
                return Err(SqlBatchError::NestedTxNotSupported);
            }
            if state.runner.is_some() {
                return Err(SqlBatchError::HasRunningBatch);
            }
        }

        {
            let mut guard = self.core.conn.lock().await;
            let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
            conn.begin(ctx, opts).await?;
        }

        self.state().in_tx = true;

        Ok(BatchTx::new(self.clone()))
    }

    /// Begin an ad-hoc transaction.
    ///
    /// Rejected during a batch; use [`begin_batch_tx`](Self::begin_batch_tx)
    /// to batch inside a transaction.
    ///
    /// # Errors
    /// `TxNotSupported` during a batch, `NestedTxNotSupported` when a
    /// transaction is already open, `ConnDone`, or driver errors.
    pub async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> Result<BatchTx, SqlBatchError> {
        {
            let state = self.state();
            if state.done {
                return Err(SqlBatchError::ConnDone);
            }
            if state.runner.is_some() {
                return Err(SqlBatchError::TxNotSupported);
            }
            if state.in_tx {
                return Err(SqlBatchError::NestedTxNotSupported);
            }
        }

        self.begin_batch_tx(ctx, opts).await
    }

    /// Close the connection, releasing the pooled driver connection.
    ///
    /// # Errors
    /// `ConnDone` if already closed, `HasRunningBatch` during a batch.
    pub async fn close(&self) -> Result<(), SqlBatchError> {
        {
            let mut state = self.state();
            if state.done {
                return Err(SqlBatchError::ConnDone);
            }
            if state.runner.is_some() {
                return Err(SqlBatchError::HasRunningBatch);
            }
            state.done = true;
        }

        // Dropping the boxed connection returns it to its pool.
        self.core.conn.lock().await.take();

        Ok(())
    }

    /// Execute a DML statement and return the affected row count.
    ///
    /// # Errors
    /// `ConnDone` on a closed connection, `BatchAborted` when the batch is
    /// torn down mid-round, or driver errors.
    pub async fn execute_dml(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError> {
        match self.active_runner()? {
            None => {
                let ctx = self.maybe_without_cancel(ctx);
                let mut guard = self.core.conn.lock().await;
                let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                conn.execute_dml(&ctx, query, params).await
            }
            Some(runner) => {
                let ctx = ctx.with_batch_conn(self.clone());
                {
                    let mut guard = self.core.conn.lock().await;
                    let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                    // Queueing probe; the driver reports BatchNotReady.
                    let _ = conn.execute_dml(&ctx, query, params).await;
                }

                runner.round_trip().await?;

                let mut guard = self.core.conn.lock().await;
                let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                conn.execute_dml(&ctx, query, params).await
            }
        }
    }

    /// Execute a query and return all rows.
    ///
    /// # Errors
    /// `ConnDone` on a closed connection, `BatchAborted` when the batch is
    /// torn down mid-round, or driver errors.
    pub async fn execute_select(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError> {
        match self.active_runner()? {
            None => {
                let ctx = self.maybe_without_cancel(ctx);
                let mut guard = self.core.conn.lock().await;
                let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                conn.execute_select(&ctx, query, params).await
            }
            Some(runner) => {
                let ctx = ctx.with_batch_conn(self.clone());
                {
                    let mut guard = self.core.conn.lock().await;
                    let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                    let _ = conn.execute_select(&ctx, query, params).await;
                }

                runner.round_trip().await?;

                let mut guard = self.core.conn.lock().await;
                let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
                conn.execute_select(&ctx, query, params).await
            }
        }
    }

    /// Execute a query expected to return at least one row.
    ///
    /// # Errors
    /// As [`execute_select`](Self::execute_select), plus `ExecutionError`
    /// when no row comes back.
    pub async fn execute_select_one(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<DbRow, SqlBatchError> {
        let mut result = self.execute_select(ctx, query, params).await?;
        if result.results.is_empty() {
            return Err(SqlBatchError::ExecutionError(
                "query returned no rows".to_string(),
            ));
        }
        Ok(result.results.swap_remove(0))
    }

    /// [`execute_dml`](Self::execute_dml) with `:name` placeholders.
    ///
    /// # Errors
    /// `ParameterError` for unknown placeholder names, otherwise as
    /// [`execute_dml`](Self::execute_dml).
    pub async fn execute_dml_named(
        &self,
        ctx: &Context,
        query: &str,
        params: &[(&str, RowValues)],
    ) -> Result<u64, SqlBatchError> {
        let (query, positional) = bind_named(query, params, self.core.style)?;
        self.execute_dml(ctx, &query, &positional).await
    }

    /// [`execute_select`](Self::execute_select) with `:name` placeholders.
    ///
    /// # Errors
    /// `ParameterError` for unknown placeholder names, otherwise as
    /// [`execute_select`](Self::execute_select).
    pub async fn execute_select_named(
        &self,
        ctx: &Context,
        query: &str,
        params: &[(&str, RowValues)],
    ) -> Result<ResultSet, SqlBatchError> {
        let (query, positional) = bind_named(query, params, self.core.style)?;
        self.execute_select(ctx, &query, &positional).await
    }

    /// Validate a statement and warm the driver's statement cache.
    ///
    /// # Errors
    /// `StmtNotSupported` during a batch, `ConnDone`, or driver errors.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<(), SqlBatchError> {
        if self.active_runner()?.is_some() {
            return Err(SqlBatchError::StmtNotSupported);
        }

        let mut guard = self.core.conn.lock().await;
        let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
        conn.prepare(ctx, query).await
    }

    pub(crate) async fn commit_tx(&self, ctx: &Context) -> Result<(), SqlBatchError> {
        let result = {
            let mut guard = self.core.conn.lock().await;
            let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
            conn.commit(ctx).await
        };

        self.finish_tx();
        let _ = self.close().await;

        result
    }

    pub(crate) async fn rollback_tx(&self, ctx: &Context) -> Result<(), SqlBatchError> {
        let result = {
            let mut guard = self.core.conn.lock().await;
            let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
            conn.rollback(ctx).await
        };

        self.finish_tx();
        let _ = self.close().await;

        result
    }

    fn active_runner(&self) -> Result<Option<Arc<BatchRunner>>, SqlBatchError> {
        let state = self.state();
        if state.done {
            return Err(SqlBatchError::ConnDone);
        }
        Ok(state.runner.clone())
    }
}

#[async_trait]
impl BatchRequestsSender for BatchConnCore {
    async fn send_batch_requests(
        &self,
        ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError> {
        {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.done {
                return Err(SqlBatchError::ConnDone);
            }
        }

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(SqlBatchError::ConnDone)?;
        if !conn.supports_batch() {
            return Err(SqlBatchError::BatchUnsupported);
        }
        conn.send_batch_requests(ctx, requests).await
    }
}
