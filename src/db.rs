use std::sync::Arc;

use tracing::{debug, instrument};

use crate::batch::Batch;
use crate::conn::BatchConn;
use crate::context::Context;
use crate::driver::{DriverConnection, DriverPool, TxOptions};
use crate::error::SqlBatchError;
use crate::named::bind_named;
use crate::options::BatchOptions;
use crate::results::{DbRow, ResultSet};
use crate::tx::BatchTx;
use crate::types::RowValues;

/// The database handle: multiplexes ordinary calls onto pooled
/// connections and routes calls made from inside a batch callback to the
/// batch connection carried in the [`Context`].
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sql_batch_middleware::prelude::*;
///
/// # async fn demo(driver: Arc<dyn sql_batch_middleware::driver::DriverPool>) -> Result<(), SqlBatchError> {
/// let db = BatchDb::new(driver);
/// let ctx = Context::background();
///
/// let mut batch = Batch::new();
/// let reporting = db.clone();
/// batch.add(move |ctx: Context| {
///     let db = reporting.clone();
///     async move {
///         let rows = db
///             .execute_select(&ctx, "SELECT id FROM users WHERE org = $1", &[RowValues::Int(7)])
///             .await?;
///         let _ = rows;
///         Ok(())
///     }
/// });
///
/// db.send_batch(&ctx, &batch).await?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct BatchDb {
    driver: Arc<dyn DriverPool>,
    options: BatchOptions,
}

impl BatchDb {
    #[must_use]
    pub fn new(driver: Arc<dyn DriverPool>) -> Self {
        Self::with_options(driver, BatchOptions::default())
    }

    #[must_use]
    pub fn with_options(driver: Arc<dyn DriverPool>, options: BatchOptions) -> Self {
        Self { driver, options }
    }

    #[must_use]
    pub fn options(&self) -> BatchOptions {
        self.options
    }

    fn maybe_without_cancel(&self, ctx: &Context) -> Context {
        if self.options.without_cancel {
            ctx.without_cancel()
        } else {
            ctx.clone()
        }
    }

    /// Pin a pooled connection into a batch-aware connection.
    ///
    /// The caller must [`close`](BatchConn::close) it when done.
    ///
    /// # Errors
    /// `NoNestedBatch` when called from inside a batch callback, or pool
    /// checkout errors.
    pub async fn batch_conn(&self, ctx: &Context) -> Result<BatchConn, SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::NoNestedBatch);
        }

        let conn = self.driver.acquire(ctx).await?;
        Ok(BatchConn::new(conn, self.options))
    }

    /// Run a batch on a connection pinned for its duration.
    ///
    /// # Errors
    /// `NoNestedBatch` when called from inside a batch callback, pool
    /// checkout errors, or whatever the batch run produces (the joined
    /// callback errors, `AdapterSend`, `AdapterClose`).
    #[instrument(skip_all, fields(callbacks = batch.len()))]
    pub async fn send_batch(&self, ctx: &Context, batch: &Batch) -> Result<(), SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::NoNestedBatch);
        }

        let conn = self.batch_conn(ctx).await?;
        let result = conn.send_batch(ctx, batch).await;
        let _ = conn.close().await;

        debug!(ok = result.is_ok(), "batch finished");

        result
    }

    /// Begin a transaction on a pinned connection; batches sent through
    /// the returned handle run inside it.
    ///
    /// # Errors
    /// `NoNestedBatch` when called from inside a batch callback, pool
    /// checkout errors, or driver errors beginning the transaction.
    pub async fn begin_batch_tx(
        &self,
        ctx: &Context,
        opts: TxOptions,
    ) -> Result<BatchTx, SqlBatchError> {
        let conn = self.batch_conn(ctx).await?;
        match conn.begin_batch_tx(ctx, opts).await {
            Ok(tx) => Ok(tx),
            Err(err) => {
                let _ = conn.close().await;
                Err(err)
            }
        }
    }

    /// Begin an ad-hoc transaction.
    ///
    /// # Errors
    /// `TxNotSupported` when called from inside a batch callback,
    /// otherwise as [`begin_batch_tx`](Self::begin_batch_tx).
    pub async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> Result<BatchTx, SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::TxNotSupported);
        }

        self.begin_batch_tx(ctx, opts).await
    }

    /// Execute a DML statement and return the affected row count.
    ///
    /// Inside a batch callback this routes to the running batch; otherwise
    /// it runs on a dedicated pooled connection. Under
    /// [`without_cancel`](BatchOptions::without_cancel) the pool wait stays
    /// cancellable and only the statement itself is shielded.
    ///
    /// # Errors
    /// Pool checkout or driver errors; `BatchAborted` when a batch is torn
    /// down mid-round.
    pub async fn execute_dml(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError> {
        if let Some(conn) = ctx.batch_conn() {
            return conn.execute_dml(ctx, query, params).await;
        }

        let mut conn = self.driver.acquire(ctx).await?;
        let exec_ctx = self.maybe_without_cancel(ctx);
        conn.execute_dml(&exec_ctx, query, params).await
    }

    /// Execute a query and return all rows.
    ///
    /// # Errors
    /// As [`execute_dml`](Self::execute_dml).
    pub async fn execute_select(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError> {
        if let Some(conn) = ctx.batch_conn() {
            return conn.execute_select(ctx, query, params).await;
        }

        let mut conn = self.driver.acquire(ctx).await?;
        let exec_ctx = self.maybe_without_cancel(ctx);
        conn.execute_select(&exec_ctx, query, params).await
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
        if let Some(conn) = ctx.batch_conn() {
            return conn.execute_select_one(ctx, query, params).await;
        }

        let mut result = {
            let mut conn = self.driver.acquire(ctx).await?;
            let exec_ctx = self.maybe_without_cancel(ctx);
            conn.execute_select(&exec_ctx, query, params).await?
        };
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
        if let Some(conn) = ctx.batch_conn() {
            return conn.execute_dml_named(ctx, query, params).await;
        }

        let mut conn = self.driver.acquire(ctx).await?;
        let (query, positional) = bind_named(query, params, conn.placeholder_style())?;
        let exec_ctx = self.maybe_without_cancel(ctx);
        conn.execute_dml(&exec_ctx, &query, &positional).await
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
        if let Some(conn) = ctx.batch_conn() {
            return conn.execute_select_named(ctx, query, params).await;
        }

        let mut conn = self.driver.acquire(ctx).await?;
        let (query, positional) = bind_named(query, params, conn.placeholder_style())?;
        let exec_ctx = self.maybe_without_cancel(ctx);
        conn.execute_select(&exec_ctx, &query, &positional).await
    }

    /// Validate a statement and warm the driver's statement cache.
    ///
    /// # Errors
    /// `StmtNotSupported` when called from inside a batch callback, pool
    /// checkout errors, or driver errors.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<(), SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::StmtNotSupported);
        }

        let mut conn: Box<dyn DriverConnection> = self.driver.acquire(ctx).await?;
        conn.prepare(ctx, query).await
    }
}
