use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use deadpool_postgres::Object;
use futures_util::future::join_all;
use tracing::debug;

use crate::batch::Request;
use crate::context::Context;
use crate::driver::{BatchRound, DriverConnection, TxOptions};
use crate::error::SqlBatchError;
use crate::results::ResultSet;
use crate::types::{PlaceholderStyle, RowValues};

use super::params::Params;
use super::query::build_result_set;

/// Per-round result handle for the Postgres adapter.
///
/// Outcomes are fully materialized when the round is submitted, so the
/// i-th retrieval simply pops outcome i; there is nothing left to release
/// server-side when the round closes.
pub struct PgBatchResults {
    outcomes: Mutex<VecDeque<Result<ResultSet, SqlBatchError>>>,
}

impl PgBatchResults {
    fn new(outcomes: Vec<Result<ResultSet, SqlBatchError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }

    /// Consume the next per-request outcome of the round.
    ///
    /// # Errors
    /// The request's own database error, or `ExecutionError` when more
    /// results are consumed than were queued.
    pub fn next(&self) -> Result<ResultSet, SqlBatchError> {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(SqlBatchError::ExecutionError(
                    "batch results already fully consumed".to_string(),
                ))
            })
    }
}

/// One pinned PostgreSQL connection.
pub struct PostgresConnection {
    client: Object,
}

impl PostgresConnection {
    #[must_use]
    pub fn new(client: Object) -> Self {
        Self { client }
    }

    /// Dual-invocation hook: when a batch is running, hand the request to
    /// the runner (probe) or consume one outcome from the round's handle.
    fn batch_step(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Option<Result<ResultSet, SqlBatchError>> {
        let conn = ctx.batch_conn()?;
        let runner = match conn.batch_runner() {
            Ok(runner) => runner,
            Err(err) => return Some(Err(err)),
        };

        match runner.queue(Request::new(query, params.to_vec())) {
            None => Some(Err(SqlBatchError::BatchNotReady)),
            Some(handle) => match handle.downcast::<PgBatchResults>() {
                Ok(results) => Some(results.next()),
                Err(_) => Some(Err(SqlBatchError::ExecutionError(
                    "unknown type of batch results handle".to_string(),
                ))),
            },
        }
    }

    async fn run_statement(
        &self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError> {
        ctx.run_until_cancelled(async {
            let stmt = self.client.prepare_cached(query).await?;
            build_result_set(&self.client, &stmt, params).await
        })
        .await
    }
}

fn begin_statement(opts: TxOptions) -> String {
    let mut stmt = String::from("BEGIN");
    match opts.isolation {
        Some(crate::driver::IsolationLevel::ReadCommitted) => {
            stmt.push_str(" ISOLATION LEVEL READ COMMITTED");
        }
        Some(crate::driver::IsolationLevel::RepeatableRead) => {
            stmt.push_str(" ISOLATION LEVEL REPEATABLE READ");
        }
        Some(crate::driver::IsolationLevel::Serializable) => {
            stmt.push_str(" ISOLATION LEVEL SERIALIZABLE");
        }
        None => {}
    }
    if opts.read_only {
        stmt.push_str(" READ ONLY");
    }
    stmt
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute_dml(
        &mut self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError> {
        if let Some(step) = self.batch_step(ctx, query, params) {
            return step.map(|rs| rs.rows_affected);
        }

        ctx.run_until_cancelled(async {
            let stmt = self.client.prepare_cached(query).await?;
            let converted = Params::convert(params)?;
            Ok(self.client.execute(&stmt, converted.as_refs()).await?)
        })
        .await
    }

    async fn execute_select(
        &mut self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<ResultSet, SqlBatchError> {
        if let Some(step) = self.batch_step(ctx, query, params) {
            return step;
        }

        self.run_statement(ctx, query, params).await
    }

    async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<(), SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::StmtNotSupported);
        }

        ctx.run_until_cancelled(async {
            self.client.prepare_cached(query).await?;
            Ok(())
        })
        .await
    }

    async fn begin(&mut self, ctx: &Context, opts: TxOptions) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.client.batch_execute(&begin_statement(opts)).await?;
        Ok(())
    }

    async fn commit(&mut self, ctx: &Context) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self, ctx: &Context) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn send_batch_requests(
        &mut self,
        ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError> {
        debug!(requests = requests.len(), "submitting pipelined round");

        let client = &self.client;
        let round = requests.iter().map(|request| async move {
            let stmt = client.prepare_cached(&request.query).await?;
            build_result_set(client, &stmt, &request.args).await
        });

        // Driving all request futures at once is what pipelines them on
        // the single underlying connection.
        let outcomes = ctx
            .run_until_cancelled(async { Ok(join_all(round).await) })
            .await?;

        Ok(BatchRound::new(Arc::new(PgBatchResults::new(outcomes))))
    }
}
