//! Batch runner behavior driven through a scripted sender.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{MockSender, RoundScript, req, simple_req};
use sql_batch_middleware::prelude::*;
use sql_batch_middleware::{BatchResults, BatchRunner};

fn int_args(vals: &[i64]) -> Vec<RowValues> {
    vals.iter().map(|v| RowValues::Int(*v)).collect()
}

fn result_handle(name: &str) -> BatchResults {
    Arc::new(name.to_string())
}

fn assert_handle(handle: &BatchResults, name: &str) {
    assert_eq!(handle.downcast_ref::<String>().unwrap(), name);
}

#[tokio::test]
async fn one_step_batch_two_callbacks() {
    let sender = MockSender::new(vec![(
        vec![
            req("first", int_args(&[1, 2])),
            req("second", int_args(&[3, 4])),
        ],
        RoundScript::Results(result_handle("result 1")),
    )]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let a = Arc::new(AtomicUsize::new(0));

    let mut batch = Batch::new();
    {
        let runner = runner.clone();
        let a = a.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);

                assert!(runner.queue(req("first", int_args(&[1, 2]))).is_none());

                runner.round_trip().await?;

                let res = runner
                    .queue(req("first", int_args(&[1, 2])))
                    .expect("result after round trip");
                assert_handle(&res, "result 1");

                Ok(())
            }
        });
    }
    {
        let runner = runner.clone();
        let a = a.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            async move {
                a.fetch_add(100, Ordering::SeqCst);

                assert!(runner.queue(req("second", int_args(&[3, 4]))).is_none());

                runner.round_trip().await?;

                let res = runner
                    .queue(req("second", int_args(&[3, 4])))
                    .expect("result after round trip");
                assert_handle(&res, "result 1");

                Ok(())
            }
        });
    }

    runner.run(&Context::background(), &batch).await.unwrap();

    assert_eq!(a.load(Ordering::SeqCst), 101);
    assert_eq!(sender.send_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sender.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn multi_step_batch_runs_one_round_per_surviving_depth() {
    let request1 = req("first", int_args(&[1, 2]));
    let request2 = req("second", int_args(&[3, 4]));
    let request3 = req("third", int_args(&[5, 6]));

    let sender = MockSender::new(vec![
        (
            vec![request1.clone(), request2.clone()],
            RoundScript::Results(result_handle("result 1")),
        ),
        (
            vec![request3.clone()],
            RoundScript::Results(result_handle("result 2")),
        ),
    ]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let a = Arc::new(AtomicUsize::new(0));

    let mut batch = Batch::new();
    {
        let runner = runner.clone();
        let a = a.clone();
        let (request1, request3) = (request1.clone(), request3.clone());
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let (request1, request3) = (request1.clone(), request3.clone());
            async move {
                a.fetch_add(1, Ordering::SeqCst);

                assert!(runner.queue(request1.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request1).unwrap(), "result 1");

                assert!(runner.queue(request3.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request3).unwrap(), "result 2");

                Ok(())
            }
        });
    }
    {
        let runner = runner.clone();
        let a = a.clone();
        let request2 = request2.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let request2 = request2.clone();
            async move {
                a.fetch_add(100, Ordering::SeqCst);

                assert!(runner.queue(request2.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request2).unwrap(), "result 1");

                Ok(())
            }
        });
    }

    runner.run(&Context::background(), &batch).await.unwrap();

    assert_eq!(a.load(Ordering::SeqCst), 101);
    assert_eq!(sender.send_calls.load(Ordering::SeqCst), 2);
    assert_eq!(sender.close_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn callback_error_does_not_stop_the_surviving_peer() {
    let request1 = req("first", int_args(&[1, 2]));
    let request2 = req("second", int_args(&[3, 4]));
    let request3 = req("third", int_args(&[5, 6]));

    let sender = MockSender::new(vec![
        (
            vec![request1.clone(), request2.clone()],
            RoundScript::Results(result_handle("result 1")),
        ),
        (
            vec![request3.clone()],
            RoundScript::Results(result_handle("result 2")),
        ),
    ]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let a = Arc::new(AtomicUsize::new(0));

    let mut batch = Batch::new();
    {
        let runner = runner.clone();
        let a = a.clone();
        let (request1, request3) = (request1.clone(), request3.clone());
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let (request1, request3) = (request1.clone(), request3.clone());
            async move {
                a.fetch_add(1, Ordering::SeqCst);

                assert!(runner.queue(request1.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request1).unwrap(), "result 1");

                assert!(runner.queue(request3.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request3).unwrap(), "result 2");

                Ok(())
            }
        });
    }
    {
        let runner = runner.clone();
        let a = a.clone();
        let request2 = request2.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let request2 = request2.clone();
            async move {
                a.fetch_add(100, Ordering::SeqCst);

                assert!(runner.queue(request2.clone()).is_none());
                runner.round_trip().await?;
                assert_handle(&runner.queue(request2).unwrap(), "result 1");

                Err(SqlBatchError::Other("some error".to_string()))
            }
        });
    }

    let err = runner
        .run(&Context::background(), &batch)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Other database error: some error");
    assert_eq!(a.load(Ordering::SeqCst), 101);
    assert_eq!(sender.send_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sender_failure_aborts_before_any_close() {
    let request1 = req("first", int_args(&[1, 2]));
    let sender = MockSender::new(vec![(
        vec![request1.clone()],
        RoundScript::SendError("some error".to_string()),
    )]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let a = Arc::new(AtomicUsize::new(0));

    let mut batch = Batch::new();
    {
        let runner = runner.clone();
        let a = a.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let request1 = req("first", int_args(&[1, 2]));
            async move {
                a.fetch_add(1, Ordering::SeqCst);

                assert!(runner.queue(request1).is_none());
                runner.round_trip().await?;

                Ok(())
            }
        });
    }

    let err = runner
        .run(&Context::background(), &batch)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "batchSender.sendBatch: Other database error: some error"
    );
    assert_eq!(a.load(Ordering::SeqCst), 1);
    assert_eq!(sender.close_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_failure_aborts_the_batch() {
    let request1 = req("first", int_args(&[1, 2]));
    let sender = MockSender::new(vec![(
        vec![request1.clone()],
        RoundScript::ResultsThenCloseError(result_handle("result 1"), "some error".to_string()),
    )]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let a = Arc::new(AtomicUsize::new(0));

    let mut batch = Batch::new();
    {
        let runner = runner.clone();
        let a = a.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            let a = a.clone();
            let request1 = req("first", int_args(&[1, 2]));
            async move {
                a.fetch_add(1, Ordering::SeqCst);

                assert!(runner.queue(request1.clone()).is_none());
                runner.round_trip().await?;
                let _ = runner.queue(request1);

                Ok(())
            }
        });
    }

    let err = runner
        .run(&Context::background(), &batch)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "close batch results: Other database error: some error"
    );
    assert_eq!(a.load(Ordering::SeqCst), 1);
}

/// One sender invocation per round: with callbacks issuing 3, 1, and 2
/// queries, rounds shrink as callbacks finish.
#[tokio::test]
async fn sender_is_invoked_max_depth_times_with_shrinking_rounds() {
    let sender = MockSender::new(vec![
        (
            vec![simple_req("a-0"), simple_req("b-0"), simple_req("c-0")],
            RoundScript::Results(result_handle("round 0")),
        ),
        (
            vec![simple_req("a-1"), simple_req("c-1")],
            RoundScript::Results(result_handle("round 1")),
        ),
        (
            vec![simple_req("a-2")],
            RoundScript::Results(result_handle("round 2")),
        ),
    ]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    let mut batch = Batch::new();
    for (label, queries) in [("a", 3usize), ("b", 1), ("c", 2)] {
        let runner = runner.clone();
        batch.add(move |_ctx| {
            let runner = runner.clone();
            async move {
                for i in 0..queries {
                    let query = format!("{label}-{i}");
                    assert!(runner.queue(simple_req(&query)).is_none());
                    runner.round_trip().await?;
                    let res = runner.queue(simple_req(&query)).expect("round result");
                    assert_eq!(
                        res.downcast_ref::<String>().unwrap(),
                        &format!("round {i}")
                    );
                }
                Ok(())
            }
        });
    }

    runner.run(&Context::background(), &batch).await.unwrap();
    assert_eq!(sender.send_calls.load(Ordering::SeqCst), 3);
    assert_eq!(sender.close_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_batch_never_invokes_the_sender() {
    let sender = MockSender::new(vec![]);
    let runner = Arc::new(BatchRunner::new(sender.clone()));

    runner
        .run(&Context::background(), &Batch::new())
        .await
        .unwrap();
    assert_eq!(sender.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resubmitting_the_same_batch_repeats_the_behavior() {
    let mut batch = Batch::new();
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = runs.clone();
        batch.add(move |_ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    for _ in 0..2 {
        let sender = MockSender::new(vec![]);
        let runner = Arc::new(BatchRunner::new(sender));
        runner.run(&Context::background(), &batch).await.unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn every_callback_error_is_joined_in_insertion_order() {
    let sender = MockSender::new(vec![]);
    let runner = Arc::new(BatchRunner::new(sender));

    let mut batch = Batch::new();
    for label in ["e1", "e2", "e3"] {
        batch.add(move |_ctx| async move { Err(SqlBatchError::Other(label.to_string())) });
    }

    let err = runner
        .run(&Context::background(), &batch)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Other database error: e1\nOther database error: e2\nOther database error: e3"
    );
}
