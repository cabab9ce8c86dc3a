use std::sync::atomic::{AtomicBool, Ordering};

use crate::batch::Batch;
use crate::conn::BatchConn;
use crate::context::Context;
use crate::error::SqlBatchError;
use crate::results::{DbRow, ResultSet};
use crate::types::RowValues;

/// A batch-capable handle to a server-side transaction.
///
/// Thin facade over the owning [`BatchConn`]: every query runs inside the
/// transaction, and batches sent through it are submitted in one
/// transaction. Commit or rollback finishes the transaction and releases
/// the connection back to the pool; any later operation fails with
/// [`SqlBatchError::TxDone`].
#[derive(Debug)]
pub struct BatchTx {
    conn: BatchConn,
    done: AtomicBool,
}

impl BatchTx {
    pub(crate) fn new(conn: BatchConn) -> Self {
        Self {
            conn,
            done: AtomicBool::new(false),
        }
    }

    fn check_done(&self) -> Result<(), SqlBatchError> {
        if self.done.load(Ordering::Acquire) {
            return Err(SqlBatchError::TxDone);
        }
        Ok(())
    }

    /// Run a batch inside this transaction.
    ///
    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::send_batch`].
    pub async fn send_batch(&self, ctx: &Context, batch: &Batch) -> Result<(), SqlBatchError> {
        self.check_done()?;
        self.conn.send_batch(ctx, batch).await
    }

    /// Commit the transaction and release the connection.
    ///
    /// # Errors
    /// `TxDone` if already finished, or driver commit errors.
    pub async fn commit(&self, ctx: &Context) -> Result<(), SqlBatchError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(SqlBatchError::TxDone);
        }
        self.conn.commit_tx(ctx).await
    }

    /// Abort the transaction and release the connection.
    ///
    /// # Errors
    /// `TxDone` if already finished, or driver rollback errors.
    pub async fn rollback(&self, ctx: &Context) -> Result<(), SqlBatchError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Err(SqlBatchError::TxDone);
        }
        self.conn.rollback_tx(ctx).await
    }

    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::execute_dml`].
    pub async fn execute_dml(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError> {
        self.check_done()?;
        self.conn.execute_dml(ctx, query, params).await
    }

    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::execute_select`].
    pub async fn execute_select(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError> {
        self.check_done()?;
        self.conn.execute_select(ctx, query, params).await
    }

    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::execute_select_one`].
    pub async fn execute_select_one(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<DbRow, SqlBatchError> {
        self.check_done()?;
        self.conn.execute_select_one(ctx, query, params).await
    }

    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::execute_dml_named`].
    pub async fn execute_dml_named(
        &self,
        ctx: &Context,
        query: &str,
        params: &[(&str, RowValues)],
    ) -> Result<u64, SqlBatchError> {
        self.check_done()?;
        self.conn.execute_dml_named(ctx, query, params).await
    }

    /// # Errors
    /// `TxDone` after commit/rollback, otherwise as
    /// [`BatchConn::execute_select_named`].
    pub async fn execute_select_named(
        &self,
        ctx: &Context,
        query: &str,
        params: &[(&str, RowValues)],
    ) -> Result<ResultSet, SqlBatchError> {
        self.check_done()?;
        self.conn.execute_select_named(ctx, query, params).await
    }

    /// Validate a statement and warm the driver's statement cache.
    ///
    /// # Errors
    /// `TxDone` after commit/rollback, `StmtNotSupported` while a batch is
    /// running on the connection, or driver errors.
    pub async fn prepare(&self, ctx: &Context, query: &str) -> Result<(), SqlBatchError> {
        self.check_done()?;
        if self.conn.is_batch_running() {
            return Err(SqlBatchError::StmtNotSupported);
        }
        self.conn.prepare(ctx, query).await
    }
}
