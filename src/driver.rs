use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::batch::Request;
use crate::context::Context;
use crate::error::SqlBatchError;
use crate::results::ResultSet;
use crate::types::{PlaceholderStyle, RowValues};

/// Opaque per-round result handle produced by a driver adapter.
///
/// Only the adapter that produced it knows the concrete type; the runner
/// and the batch connection pass it through untouched.
pub type BatchResults = Arc<dyn Any + Send + Sync>;

/// Deferred release of the server-side resources behind a round's results.
pub type BatchCloser = BoxFuture<'static, Result<(), SqlBatchError>>;

/// What an adapter returns for one submitted round.
pub struct BatchRound {
    /// Handle yielding the i-th per-request outcome on its i-th retrieval.
    pub results: BatchResults,
    /// Must be awaited after the round's results have been consumed.
    pub closer: BatchCloser,
}

impl BatchRound {
    /// A round whose closer has nothing to release.
    #[must_use]
    pub fn new(results: BatchResults) -> Self {
        Self {
            results,
            closer: Box::pin(async { Ok(()) }),
        }
    }

    #[must_use]
    pub fn with_closer(results: BatchResults, closer: BatchCloser) -> Self {
        Self { results, closer }
    }
}

/// Transaction isolation level requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for beginning a server-side transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

/// The contract the batch runner is defined against: submit one round of
/// requests as a single network round trip.
#[async_trait]
pub trait BatchRequestsSender: Send + Sync {
    /// Submit all requests of one round.
    ///
    /// The returned handle must yield the i-th response on the i-th
    /// retrieval, and the closer must release any server-side resources
    /// associated with the round.
    ///
    /// # Errors
    /// Any submission failure; the runner aborts the batch on error.
    async fn send_batch_requests(
        &self,
        ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError>;
}

/// A pool of driver connections for one database.
#[async_trait]
pub trait DriverPool: Send + Sync {
    /// Check a connection out of the pool. Pool wait must honor `ctx`.
    ///
    /// # Errors
    /// Pool checkout failures, or `Canceled`/`DeadlineExceeded` from `ctx`.
    async fn acquire(&self, ctx: &Context) -> Result<Box<dyn DriverConnection>, SqlBatchError>;
}

/// One checked-out driver connection.
///
/// The exec/select methods implement the dual-invocation batching hook:
/// when `ctx` carries a batch connection with a running batch, the first
/// invocation hands the request to the runner via
/// [`queue`](crate::runner::BatchRunner::queue) and fails with
/// [`SqlBatchError::BatchNotReady`] without touching the database; the
/// second invocation (after the round trip) consumes one outcome from the
/// round's result handle and returns it as if it were a stand-alone
/// response.
#[async_trait]
pub trait DriverConnection: Send {
    /// Execute a DML statement and return the affected row count.
    ///
    /// # Errors
    /// Driver errors, or `BatchNotReady` for the queueing invocation.
    async fn execute_dml(
        &mut self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError>;

    /// Execute a query and return its rows.
    ///
    /// # Errors
    /// Driver errors, or `BatchNotReady` for the queueing invocation.
    async fn execute_select(
        &mut self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError>;

    /// Validate a statement and warm the driver's statement cache.
    ///
    /// # Errors
    /// Driver errors, or `StmtNotSupported` inside a batch.
    async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<(), SqlBatchError>;

    /// Begin a server-side transaction on this connection.
    ///
    /// # Errors
    /// Driver errors starting the transaction.
    async fn begin(&mut self, ctx: &Context, opts: TxOptions) -> Result<(), SqlBatchError>;

    /// # Errors
    /// Driver errors committing the transaction.
    async fn commit(&mut self, ctx: &Context) -> Result<(), SqlBatchError>;

    /// # Errors
    /// Driver errors rolling the transaction back.
    async fn rollback(&mut self, ctx: &Context) -> Result<(), SqlBatchError>;

    /// Positional placeholder style this driver expects.
    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Whether this connection can submit batched rounds.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Submit one round of requests as a single network round trip.
    ///
    /// # Errors
    /// `BatchUnsupported` unless the driver overrides this with a real
    /// batching implementation.
    async fn send_batch_requests(
        &mut self,
        ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError> {
        let _ = (ctx, requests);
        Err(SqlBatchError::BatchUnsupported)
    }
}
