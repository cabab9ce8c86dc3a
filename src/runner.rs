use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::debug;

use crate::batch::{Batch, Request};
use crate::context::Context;
use crate::driver::{BatchRequestsSender, BatchResults};
use crate::error::SqlBatchError;

const MAX_ALLOWED_ITERATIONS: usize = 10_000_000;
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-callback state shared between the runner and that callback's task.
struct BatchItem {
    /// Result handle of the current round; valid only between the adapter
    /// call and the callback's next queue read.
    batch_result: Mutex<Option<BatchResults>>,
    /// The callback parks here between rounds; the runner's matching
    /// sender wakes it once its round result is in place.
    round_trip_rx: Mutex<Option<mpsc::Receiver<()>>>,
    /// Set while the callback has a request queued for the current round.
    is_waiting: AtomicBool,
    /// Monotonic: once the callback returns it never rejoins a round.
    is_finished: AtomicBool,
}

/// Runner-private side of one item: where the callback reports its result
/// and how the runner wakes (or, by dropping, aborts) the callback.
struct ItemControl {
    item: Arc<BatchItem>,
    result_rx: oneshot::Receiver<Result<(), SqlBatchError>>,
    round_trip_tx: Option<mpsc::Sender<()>>,
}

/// The rendezvous-and-dispatch engine behind
/// [`BatchConn::send_batch`](crate::conn::BatchConn::send_batch).
///
/// Drives every callback of a batch as a cooperative task, collects one
/// request per live callback per round, submits each round through the
/// [`BatchRequestsSender`] in one network round trip, and redelivers the
/// per-callback results. At most one participant (the runner or a single
/// callback) makes observable progress at any time; the single-permit
/// semaphore is the handoff token enforcing that.
pub struct BatchRunner {
    /// Requests collected for the round being assembled, in item order.
    requests: Mutex<Vec<Request>>,
    /// The item whose callback currently owns the active section.
    current: Mutex<Option<Arc<BatchItem>>>,
    /// Single-permit handoff token. Permit held (`acquire().forget()`)
    /// means the active section is occupied; `add_permits(1)` hands it
    /// back.
    sema: Semaphore,
    sender: Arc<dyn BatchRequestsSender>,
    rendezvous_timeout: Duration,
}

impl BatchRunner {
    #[must_use]
    pub fn new(sender: Arc<dyn BatchRequestsSender>) -> Self {
        Self::with_rendezvous_timeout(sender, RENDEZVOUS_TIMEOUT)
    }

    pub(crate) fn with_rendezvous_timeout(
        sender: Arc<dyn BatchRequestsSender>,
        rendezvous_timeout: Duration,
    ) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            sema: Semaphore::new(1),
            sender,
            rendezvous_timeout,
        }
    }

    /// Run the batch to completion.
    ///
    /// Returns the joined callback errors, if any. An adapter submission
    /// failure aborts the batch with `AdapterSend`; a result-handle close
    /// failure aborts it with `AdapterClose`. On abort, callbacks still
    /// suspended in a round trip observe [`SqlBatchError::BatchAborted`]
    /// from their in-flight query call.
    ///
    /// # Errors
    /// `AdapterSend`, `AdapterClose`, `IterationLimit`, or the joined
    /// callback errors.
    ///
    /// # Panics
    /// After 120 seconds without a callback either finishing or yielding.
    /// This is a deadlock watchdog, not an operation deadline.
    pub async fn run(&self, ctx: &Context, batch: &Batch) -> Result<(), SqlBatchError> {
        let mut controls: Vec<ItemControl> = Vec::with_capacity(batch.len());
        let mut err: Option<SqlBatchError> = None;

        debug!(callbacks = batch.len(), "starting batch");

        // Initial sweep: start every callback and wait until it either
        // finishes or has queued its first request and yielded.
        for cb in batch.callbacks() {
            let (round_trip_tx, round_trip_rx) = mpsc::channel(1);
            let (result_tx, result_rx) = oneshot::channel();
            let item = Arc::new(BatchItem {
                batch_result: Mutex::new(None),
                round_trip_rx: Mutex::new(Some(round_trip_rx)),
                is_waiting: AtomicBool::new(false),
                is_finished: AtomicBool::new(false),
            });
            let mut control = ItemControl {
                item: Arc::clone(&item),
                result_rx,
                round_trip_tx: Some(round_trip_tx),
            };

            *lock(&self.current) = Some(item);
            self.lock_handoff().await?;

            let cb = Arc::clone(cb);
            let cb_ctx = ctx.clone();
            tokio::spawn(async move {
                let res = cb(cb_ctx).await;
                let _ = result_tx.send(res);
            });

            let item_err = self.wait_for_current_item_finished_or_locked(&mut control).await?;
            err = SqlBatchError::join(err, item_err);
            controls.push(control);
        }

        // Round loop: one adapter call per round while live callbacks
        // still have requests pending.
        let mut iteration = 0usize;
        loop {
            let round_requests = {
                let mut requests = lock(&self.requests);
                if requests.is_empty() {
                    break;
                }
                std::mem::take(&mut *requests)
            };

            debug!(
                round = iteration,
                requests = round_requests.len(),
                "sending batch round"
            );

            let round = match self.sender.send_batch_requests(ctx, &round_requests).await {
                Ok(round) => round,
                // Dropping `controls` here closes every round-trip signal,
                // so suspended callbacks observe BatchAborted.
                Err(e) => return Err(SqlBatchError::AdapterSend(Box::new(e))),
            };

            for control in &mut controls {
                if control.item.is_finished.load(Ordering::Acquire) {
                    continue;
                }

                *lock(&self.current) = Some(Arc::clone(&control.item));
                self.lock_handoff().await?;

                *lock(&control.item.batch_result) = Some(Arc::clone(&round.results));
                if let Some(tx) = &control.round_trip_tx {
                    tx.send(()).await.map_err(|_| {
                        SqlBatchError::ExecutionError(
                            "batch callback dropped its round trip signal".to_string(),
                        )
                    })?;
                }

                let item_err = self.wait_for_current_item_finished_or_locked(control).await?;
                err = SqlBatchError::join(err, item_err);
            }

            round
                .closer
                .await
                .map_err(|e| SqlBatchError::AdapterClose(Box::new(e)))?;

            iteration += 1;
            if iteration >= MAX_ALLOWED_ITERATIONS {
                return Err(SqlBatchError::IterationLimit(iteration));
            }
        }

        err.map_or(Ok(()), Err)
    }

    /// Block until the current callback either finishes or yields the
    /// active section back by entering its next round trip.
    async fn wait_for_current_item_finished_or_locked(
        &self,
        control: &mut ItemControl,
    ) -> Result<Option<SqlBatchError>, SqlBatchError> {
        let item_err = tokio::select! {
            res = &mut control.result_rx => {
                // Close the round-trip signal so a racy adapter calling
                // round_trip after the callback returned still unblocks.
                control.round_trip_tx = None;
                control.item.is_finished.store(true, Ordering::Release);
                match res {
                    Ok(cb_result) => cb_result.err(),
                    Err(_) => Some(SqlBatchError::ExecutionError(
                        "batch callback exited without reporting a result".to_string(),
                    )),
                }
            }
            permit = self.sema.acquire() => {
                permit
                    .map_err(|_| SqlBatchError::ExecutionError(
                        "batch handoff token closed".to_string(),
                    ))?
                    .forget();
                None
            }
            () = tokio::time::sleep(self.rendezvous_timeout) => {
                panic!("possible deadlock in waiting for finished batch callbacks");
            }
        };

        self.sema.add_permits(1);

        Ok(item_err)
    }

    async fn lock_handoff(&self) -> Result<(), SqlBatchError> {
        self.sema
            .acquire()
            .await
            .map_err(|_| SqlBatchError::ExecutionError("batch handoff token closed".to_string()))?
            .forget();
        Ok(())
    }

    /// Hand a request to the runner, or read back the round's result.
    ///
    /// Only for use in driver implementation code. The first call in a
    /// round records the request and returns `None`; the call following a
    /// round trip returns the round's result handle.
    pub fn queue(&self, request: Request) -> Option<BatchResults> {
        let item = lock(&self.current)
            .clone()
            .expect("no batch callback is currently scheduled");

        if !item.is_waiting.load(Ordering::Acquire) {
            item.is_waiting.store(true, Ordering::Release);
            lock(&self.requests).push(request);

            return None;
        }

        let res = lock(&item.batch_result).clone();
        item.is_waiting.store(false, Ordering::Release);

        res
    }

    /// Suspend the calling callback until the current round has been
    /// submitted and its result handle is in place for this callback.
    ///
    /// Only for use in driver implementation and connection facade code.
    /// After this returns `Ok`, the next [`queue`](Self::queue) call is
    /// guaranteed to observe the round's result handle.
    ///
    /// # Errors
    /// [`SqlBatchError::BatchAborted`] when the batch was torn down while
    /// this callback was suspended.
    pub async fn round_trip(&self) -> Result<(), SqlBatchError> {
        // The runner repoints `current` as soon as it is resumed, so the
        // item must be captured before the handoff token is released.
        let item = lock(&self.current)
            .clone()
            .expect("no batch callback is currently scheduled");

        self.sema.add_permits(1);

        let mut rx = lock(&item.round_trip_rx).take().ok_or_else(|| {
            SqlBatchError::ExecutionError("round trip signal already in use".to_string())
        })?;
        let signaled = rx.recv().await;
        *lock(&item.round_trip_rx) = Some(rx);

        match signaled {
            Some(()) => Ok(()),
            None => Err(SqlBatchError::BatchAborted),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
