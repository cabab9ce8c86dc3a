use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::SqlBatchError;
use crate::types::RowValues;

/// One query queued by a callback during a batch round.
///
/// Immutable from the moment it is queued until the round completes.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The SQL query string
    pub query: String,
    /// The parameters to be bound to the query
    pub args: Vec<RowValues>,
}

impl Request {
    pub fn new(query: impl Into<String>, args: Vec<RowValues>) -> Self {
        Self {
            query: query.into(),
            args,
        }
    }

    pub fn new_without_params(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            args: Vec::new(),
        }
    }
}

/// The future type a batch callback resolves to.
pub type CallbackFuture = BoxFuture<'static, Result<(), SqlBatchError>>;

/// A batch callback: independent application code issuing ordinary-looking
/// queries through the context it receives.
pub type BatchCallback = Arc<dyn Fn(Context) -> CallbackFuture + Send + Sync>;

/// An ordered, append-only collection of callbacks submitted together.
///
/// A batch may be submitted more than once; each submission re-iterates
/// the callbacks from the start.
///
/// ```rust
/// use sql_batch_middleware::prelude::*;
///
/// let mut batch = Batch::new();
/// batch.add(|ctx: Context| async move {
///     let _ = ctx;
///     Ok(())
/// });
/// assert_eq!(batch.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct Batch {
    callbacks: Vec<BatchCallback>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback; never fails.
    pub fn add<F, Fut>(&mut self, cb: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqlBatchError>> + Send + 'static,
    {
        self.callbacks
            .push(Arc::new(move |ctx: Context| -> CallbackFuture {
                Box::pin(cb(ctx))
            }));
    }

    /// Append an already-boxed callback.
    pub fn add_boxed(&mut self, cb: BatchCallback) {
        self.callbacks.push(cb);
    }

    #[must_use]
    pub fn callbacks(&self) -> &[BatchCallback] {
        &self.callbacks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Invoke the callbacks one after another, joining all errors.
    ///
    /// A callback's error does not short-circuit subsequent callbacks.
    ///
    /// # Errors
    /// The joined callback errors, in insertion order.
    pub async fn run_sequential(&self, ctx: &Context) -> Result<(), SqlBatchError> {
        let mut err = None;
        for cb in &self.callbacks {
            err = SqlBatchError::join(err, cb(ctx.clone()).await.err());
        }

        err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Fallback batcher for environments without a batching driver: runs the
/// callbacks strictly one after another on whatever connection each call
/// resolves to.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqBatcher {}

impl SeqBatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// # Errors
    /// The joined callback errors, in insertion order.
    pub async fn send_batch(&self, ctx: &Context, batch: &Batch) -> Result<(), SqlBatchError> {
        batch.run_sequential(ctx).await
    }
}
