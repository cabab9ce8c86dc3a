//! Shared scripted mocks for the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sql_batch_middleware::prelude::*;
use sql_batch_middleware::{
    BatchRequestsSender, BatchResults, DriverConnection, DriverPool, Request,
};

pub fn req(query: &str, args: Vec<RowValues>) -> Request {
    Request::new(query, args)
}

pub fn simple_req(query: &str) -> Request {
    Request::new_without_params(query)
}

/// The canned response both mocks produce for a statement: one row whose
/// `query` column echoes the statement text.
pub fn echo_result(query: &str) -> ResultSet {
    let mut rs = ResultSet::with_capacity(1);
    rs.set_column_names(Arc::new(vec!["query".to_string()]));
    rs.add_row_values(vec![RowValues::Text(query.to_string())]);
    rs.rows_affected = 1;
    rs
}

/// What a scripted sender round resolves to.
pub enum RoundScript {
    /// Deliver this handle to every callback of the round.
    Results(BatchResults),
    /// Deliver this handle, then fail the round close with this message.
    ResultsThenCloseError(BatchResults, String),
    /// Fail the submission itself.
    SendError(String),
}

/// Scripted [`BatchRequestsSender`] for driving a runner directly: each
/// round asserts the expected request list and resolves per its script.
pub struct MockSender {
    expected: Mutex<VecDeque<Vec<Request>>>,
    script: Mutex<VecDeque<RoundScript>>,
    pub send_calls: AtomicUsize,
    pub close_calls: Arc<AtomicUsize>,
}

impl MockSender {
    pub fn new(rounds: Vec<(Vec<Request>, RoundScript)>) -> Arc<Self> {
        let (expected, script): (VecDeque<_>, VecDeque<_>) = rounds.into_iter().unzip();
        Arc::new(Self {
            expected: Mutex::new(expected),
            script: Mutex::new(script),
            send_calls: AtomicUsize::new(0),
            close_calls: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl BatchRequestsSender for MockSender {
    async fn send_batch_requests(
        &self,
        _ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        let expected = self
            .expected
            .lock()
            .unwrap()
            .pop_front()
            .expect("sender called more often than scripted");
        assert_eq!(requests, expected.as_slice(), "unexpected round requests");

        let close_calls = Arc::clone(&self.close_calls);
        match self.script.lock().unwrap().pop_front().unwrap() {
            RoundScript::Results(results) => Ok(BatchRound::with_closer(
                results,
                Box::pin(async move {
                    close_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )),
            RoundScript::ResultsThenCloseError(results, message) => Ok(BatchRound::with_closer(
                results,
                Box::pin(async move {
                    close_calls.fetch_add(1, Ordering::SeqCst);
                    Err(SqlBatchError::Other(message))
                }),
            )),
            RoundScript::SendError(message) => Err(SqlBatchError::Other(message)),
        }
    }
}

/// Per-round result handle produced by [`MockConnection`]; outcome i is
/// consumed by retrieval i.
pub struct MockBatchResults {
    outcomes: Mutex<VecDeque<Result<ResultSet, String>>>,
}

impl MockBatchResults {
    fn new(outcomes: Vec<Result<ResultSet, String>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }

    pub fn next(&self) -> Result<ResultSet, SqlBatchError> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .map_or_else(
                || {
                    Err(SqlBatchError::ExecutionError(
                        "batch results already fully consumed".to_string(),
                    ))
                },
                |outcome| outcome.map_err(SqlBatchError::Other),
            )
    }
}

/// Shared observable state of a [`MockDriver`] and its connections.
pub struct MockState {
    pub acquired: AtomicUsize,
    /// Every batched round submitted through `send_batch_requests`.
    pub rounds: Mutex<Vec<Vec<Request>>>,
    pub close_calls: AtomicUsize,
    /// Every statement executed outside a batch.
    pub direct: Mutex<Vec<(String, Vec<RowValues>)>>,
    pub prepared: Mutex<Vec<String>>,
    pub tx_events: Mutex<Vec<&'static str>>,
    scripted_direct: Mutex<HashMap<String, ResultSet>>,
    fail_send_on_round: Mutex<Option<(usize, String)>>,
    fail_close_on_round: Mutex<Option<(usize, String)>>,
    batch_supported: bool,
}

impl MockState {
    pub fn new() -> Arc<Self> {
        Self::with_batch_support(true)
    }

    pub fn without_batch_support() -> Arc<Self> {
        Self::with_batch_support(false)
    }

    fn with_batch_support(batch_supported: bool) -> Arc<Self> {
        Arc::new(Self {
            acquired: AtomicUsize::new(0),
            rounds: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            direct: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
            tx_events: Mutex::new(Vec::new()),
            scripted_direct: Mutex::new(HashMap::new()),
            fail_send_on_round: Mutex::new(None),
            fail_close_on_round: Mutex::new(None),
            batch_supported,
        })
    }

    /// Replace the echo response for one statement.
    pub fn script_direct(&self, query: &str, result: ResultSet) {
        self.scripted_direct
            .lock()
            .unwrap()
            .insert(query.to_string(), result);
    }

    pub fn fail_send_on_round(&self, round: usize, message: &str) {
        *self.fail_send_on_round.lock().unwrap() = Some((round, message.to_string()));
    }

    pub fn fail_close_on_round(&self, round: usize, message: &str) {
        *self.fail_close_on_round.lock().unwrap() = Some((round, message.to_string()));
    }

    fn respond(&self, query: &str) -> ResultSet {
        self.scripted_direct
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_else(|| echo_result(query))
    }
}

/// Scripted driver pool handing out [`MockConnection`]s that share one
/// [`MockState`].
pub struct MockDriver {
    pub state: Arc<MockState>,
}

impl MockDriver {
    pub fn new(state: Arc<MockState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

#[async_trait]
impl DriverPool for MockDriver {
    async fn acquire(&self, _ctx: &Context) -> Result<Box<dyn DriverConnection>, SqlBatchError> {
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
}

impl MockConnection {
    /// Dual-invocation hook, mirroring what a real driver does: queue on
    /// the probe, consume one outcome after the round trip.
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
            Some(handle) => match handle.downcast::<MockBatchResults>() {
                Ok(results) => Some(results.next()),
                Err(_) => Some(Err(SqlBatchError::ExecutionError(
                    "unknown type of batch results handle".to_string(),
                ))),
            },
        }
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn execute_dml(
        &mut self,
        ctx: &Context,
        query: &str,
        params: &[RowValues],
    ) -> Result<u64, SqlBatchError> {
        if let Some(step) = self.batch_step(ctx, query, params) {
            return step.map(|rs| rs.rows_affected);
        }

        ctx.check()?;
        self.state
            .direct
            .lock()
            .unwrap()
            .push((query.to_string(), params.to_vec()));
        Ok(self.state.respond(query).rows_affected)
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

        ctx.check()?;
        self.state
            .direct
            .lock()
            .unwrap()
            .push((query.to_string(), params.to_vec()));
        Ok(self.state.respond(query))
    }

    async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<(), SqlBatchError> {
        if ctx.batch_conn().is_some() {
            return Err(SqlBatchError::StmtNotSupported);
        }

        ctx.check()?;
        self.state.prepared.lock().unwrap().push(query.to_string());
        Ok(())
    }

    async fn begin(&mut self, ctx: &Context, _opts: TxOptions) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.state.tx_events.lock().unwrap().push("begin");
        Ok(())
    }

    async fn commit(&mut self, ctx: &Context) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.state.tx_events.lock().unwrap().push("commit");
        Ok(())
    }

    async fn rollback(&mut self, ctx: &Context) -> Result<(), SqlBatchError> {
        ctx.check()?;
        self.state.tx_events.lock().unwrap().push("rollback");
        Ok(())
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn supports_batch(&self) -> bool {
        self.state.batch_supported
    }

    async fn send_batch_requests(
        &mut self,
        ctx: &Context,
        requests: &[Request],
    ) -> Result<BatchRound, SqlBatchError> {
        ctx.check()?;

        let round_index = self.state.rounds.lock().unwrap().len();
        if let Some((round, message)) = self.state.fail_send_on_round.lock().unwrap().clone() {
            if round == round_index {
                return Err(SqlBatchError::Other(message));
            }
        }

        self.state
            .rounds
            .lock()
            .unwrap()
            .push(requests.to_vec());

        let outcomes = requests
            .iter()
            .map(|request| Ok(self.state.respond(&request.query)))
            .collect();

        let state = Arc::clone(&self.state);
        let closer = Box::pin(async move {
            state.close_calls.fetch_add(1, Ordering::SeqCst);
            if let Some((round, message)) = state.fail_close_on_round.lock().unwrap().clone() {
                if round == round_index {
                    return Err(SqlBatchError::Other(message));
                }
            }
            Ok(())
        });

        Ok(BatchRound::with_closer(
            Arc::new(MockBatchResults::new(outcomes)),
            closer,
        ))
    }
}
