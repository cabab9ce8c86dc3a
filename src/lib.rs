/*!
 * SQL Batch Middleware - transparent query batching for SQL databases
 *
 * This crate lets a set of independently-written callbacks each issue
 * ordinary-looking queries against a database while the middleware
 * collects one query per callback per round into a single network-level
 * batch, then feeds every callback its individual result as if the call
 * had been issued on its own. Repeated rounds let every callback issue an
 * arbitrary sequence of queries over one pinned connection.
 *
 * # Features
 *
 * - Transparent batching: callbacks keep the plain `execute`/`select`
 *   calling style and never see each other's results
 * - Driver-agnostic core with a PostgreSQL adapter that submits each
 *   round as one pipelined extended-query round trip
 * - Batch-capable transactions (`begin_batch_tx`) and a sequential
 *   fallback for drivers without batching support
 * - Named-parameter binding and an optional cancellation shield for
 *   non-batch calls
 *
 * # Example
 *
 * ```rust,no_run
 * use std::sync::Arc;
 * use sql_batch_middleware::prelude::*;
 * use sql_batch_middleware::postgres::{PostgresDriver, PostgresOptions};
 *
 * async fn report_totals() -> Result<(), SqlBatchError> {
 *     let mut config = deadpool_postgres::Config::new();
 *     config.host = Some("localhost".to_string());
 *     config.port = Some(5432);
 *     config.dbname = Some("mydatabase".to_string());
 *     config.user = Some("user".to_string());
 *     config.password = Some("password".to_string());
 *
 *     let driver = PostgresDriver::new(PostgresOptions::new(config))?;
 *     let db = BatchDb::new(Arc::new(driver));
 *     let ctx = Context::background();
 *
 *     let mut batch = Batch::new();
 *     for org in [1i64, 2, 3] {
 *         let db = db.clone();
 *         batch.add(move |ctx: Context| {
 *             let db = db.clone();
 *             async move {
 *                 // Collected into one round with the other callbacks'
 *                 // queries, submitted as a single pipelined batch.
 *                 let rows = db
 *                     .execute_select(
 *                         &ctx,
 *                         "SELECT count(*) FROM users WHERE org = $1",
 *                         &[RowValues::Int(org)],
 *                     )
 *                     .await?;
 *                 let _ = rows;
 *                 Ok(())
 *             }
 *         });
 *     }
 *
 *     db.send_batch(&ctx, &batch).await
 * }
 * ```
 */

#![forbid(unsafe_code)]

// Core modules
pub mod batch;
pub mod context;
pub mod conn;
pub mod db;
pub mod driver;
pub mod error;
pub mod named;
pub mod options;
pub mod results;
pub mod runner;
pub mod tx;
pub mod types;

// Driver adapters
#[cfg(feature = "postgres")]
pub mod postgres;

// Re-export everything that should be part of the public API
pub mod prelude {
    //! Convenient imports for common functionality.

    pub use crate::batch::{Batch, Request, SeqBatcher};
    pub use crate::conn::BatchConn;
    pub use crate::context::Context;
    pub use crate::db::BatchDb;
    pub use crate::driver::{BatchRound, IsolationLevel, TxOptions};
    pub use crate::error::SqlBatchError;
    pub use crate::options::{BatchOptions, BatchOptionsBuilder};
    pub use crate::results::{DbRow, ResultSet};
    pub use crate::tx::BatchTx;
    pub use crate::types::{PlaceholderStyle, RowValues};
}

// Direct exports of frequently used types for simplicity
pub use batch::{Batch, BatchCallback, CallbackFuture, Request, SeqBatcher};
pub use conn::BatchConn;
pub use context::Context;
pub use db::BatchDb;
pub use driver::{
    BatchCloser, BatchRequestsSender, BatchResults, BatchRound, DriverConnection, DriverPool,
    IsolationLevel, TxOptions,
};
pub use error::{JoinedErrors, SqlBatchError};
pub use named::bind_named;
pub use options::{BatchOptions, BatchOptionsBuilder};
pub use results::{DbRow, ResultSet};
pub use runner::BatchRunner;
pub use tx::BatchTx;
pub use types::{ConversionMode, ParamConverter, PlaceholderStyle, RowValues};

#[cfg(feature = "postgres")]
pub use postgres::Params as PostgresParams;
#[cfg(feature = "postgres")]
pub use postgres::build_result_set as postgres_build_result_set;
