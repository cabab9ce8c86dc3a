use std::fmt;

use thiserror::Error;

/// Errors produced by the batching middleware.
#[derive(Debug, Error)]
pub enum SqlBatchError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PoolErrorPostgres(#[from] deadpool_postgres::PoolError),

    /// Any operation on a closed batch connection.
    #[error("connection is already closed")]
    ConnDone,

    /// Any operation on a finished batch transaction.
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// Starting a batch while another batch connection is in the context.
    #[error("nested batches are not supported")]
    NoNestedBatch,

    /// Close or transaction begin attempted while a batch is running.
    #[error("connection has running batch")]
    HasRunningBatch,

    /// Driver-facing batch API used outside a running batch.
    #[error("connection has no running batch")]
    NoRunningBatch,

    /// Ad-hoc transaction attempted during a batch.
    #[error("transactions are not supported in batch, use begin_batch_tx")]
    TxNotSupported,

    /// Transaction begin on a connection that already holds one.
    #[error("nested transactions are not supported")]
    NestedTxNotSupported,

    /// Prepared statement attempted during a batch.
    #[error("prepared statements are not supported in batch, use simple queries")]
    StmtNotSupported,

    /// The driver connection lacks batching capability.
    #[error("batch sending is unsupported by driver")]
    BatchUnsupported,

    /// The adapter failed to submit a round; the batch is aborted.
    #[error("batchSender.sendBatch: {0}")]
    AdapterSend(#[source] Box<SqlBatchError>),

    /// Closing a round's result handle failed; the batch is aborted.
    #[error("close batch results: {0}")]
    AdapterClose(#[source] Box<SqlBatchError>),

    /// Round counter safeguard against runaway batches.
    #[error("max allowed iterations {0} reached")]
    IterationLimit(usize),

    /// First (queueing) invocation of a query inside a batch round.
    ///
    /// Drivers return this sentinel after handing the request to the
    /// runner; the batch connection discards it and repeats the call
    /// after the round trip.
    #[error("batch result is not ready yet")]
    BatchNotReady,

    /// The batch was torn down while this callback was still suspended.
    #[error("batch was aborted before the result was delivered")]
    BatchAborted,

    /// Errors from several callbacks of one batch, in insertion order.
    #[error("{0}")]
    Joined(JoinedErrors),

    #[error("operation canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parameter conversion error: {0}")]
    ParameterError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    #[error("Other database error: {0}")]
    Other(String),
}

/// A list of callback errors displayed one per line.
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<SqlBatchError>);

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl SqlBatchError {
    /// Combine two optional errors, flattening joined lists.
    ///
    /// A single error passes through unchanged so callers comparing
    /// against one expected error see it directly rather than wrapped.
    #[must_use]
    pub(crate) fn join(
        acc: Option<SqlBatchError>,
        next: Option<SqlBatchError>,
    ) -> Option<SqlBatchError> {
        match (acc, next) {
            (acc, None) => acc,
            (None, next) => next,
            (Some(SqlBatchError::Joined(JoinedErrors(mut list))), Some(next)) => {
                match next {
                    SqlBatchError::Joined(JoinedErrors(mut more)) => list.append(&mut more),
                    other => list.push(other),
                }
                Some(SqlBatchError::Joined(JoinedErrors(list)))
            }
            (Some(acc), Some(next)) => Some(SqlBatchError::Joined(JoinedErrors(vec![acc, next]))),
        }
    }
}
