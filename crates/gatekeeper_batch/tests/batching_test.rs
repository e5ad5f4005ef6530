//! Batching coordinator tests.

use futures::future::{BoxFuture, FutureExt, join_all};
use gatekeeper_batch::{BatchFlush, BatchingCoordinator, PendingBatch};
use gatekeeper_core::{GatekeeperConfig, MethodOverrides};
use gatekeeper_error::{CallError, CallErrorKind, CallResult};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const METHOD: &str = "users.get";

type Dispatches = Arc<Mutex<Vec<Vec<Value>>>>;

fn config(window_ms: u64, max_batch_size: usize) -> Arc<GatekeeperConfig> {
    let mut config = GatekeeperConfig::default();
    config.methods.push(MethodOverrides {
        name: METHOD.to_string(),
        batch_window_ms: Some(window_ms),
        max_batch_size: Some(max_batch_size),
        ..Default::default()
    });
    Arc::new(config)
}

/// Flush that records each dispatch and answers with `{"user": <param>}` per request.
fn echo_flush(dispatches: Dispatches) -> BatchFlush {
    Arc::new(
        move |batch: Arc<PendingBatch>| -> BoxFuture<'static, CallResult<Vec<Value>>> {
            let dispatches = dispatches.clone();
            async move {
                let params = batch.take();
                dispatches.lock().unwrap().push(params.clone());
                Ok(params.into_iter().map(|p| json!({ "user": p })).collect())
            }
            .boxed()
        },
    )
}

fn failing_flush(error: CallError) -> BatchFlush {
    Arc::new(
        move |batch: Arc<PendingBatch>| -> BoxFuture<'static, CallResult<Vec<Value>>> {
            let error = error.clone();
            async move {
                batch.take();
                Err(error)
            }
            .boxed()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_calls_in_window_share_one_dispatch() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(config(50, 25), echo_flush(dispatches.clone()));

    let results = join_all((0..5).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))).await;

    for (i, result) in results.into_iter().enumerate() {
        let reply = result.unwrap();
        assert_eq!(*reply.value(), json!({ "user": i }));
        assert_eq!(*reply.dispatches(), 1);
    }
    let dispatches = dispatches.lock().unwrap();
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0], (0..5).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_size_threshold_flushes_early() {
    let dispatches = Dispatches::default();
    let coordinator =
        BatchingCoordinator::new(config(10_000, 3), echo_flush(dispatches.clone()));
    let started = tokio::time::Instant::now();

    let first = join_all((0..3).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))).await;
    assert!(first.iter().all(Result::is_ok));
    assert!(started.elapsed() < Duration::from_millis(10));

    let rest = join_all((3..5).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))).await;
    assert_eq!(rest[1].as_ref().unwrap().value(), &json!({ "user": 4 }));
    assert!(started.elapsed() >= Duration::from_secs(10));

    let sizes: Vec<usize> = dispatches.lock().unwrap().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_reaches_every_caller() {
    let coordinator = BatchingCoordinator::new(
        config(20, 25),
        failing_flush(CallError::upstream("503 Service Unavailable", true)),
    );

    let results = join_all((0..3).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))).await;
    for result in results {
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_response_count_mismatch_is_terminal() {
    let flush: BatchFlush = Arc::new(
        |batch: Arc<PendingBatch>| -> BoxFuture<'static, CallResult<Vec<Value>>> {
            async move {
                batch.take();
                Ok(vec![json!("only one")])
            }
            .boxed()
        },
    );
    let coordinator = BatchingCoordinator::new(config(20, 25), flush);

    let results = join_all((0..2).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))).await;
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(
            err.kind(),
            CallErrorKind::Upstream { retryable: false, .. }
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_is_left_out_of_the_batch() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(config(50, 25), echo_flush(dispatches.clone()));
    let token = CancellationToken::new();

    let cancel_soon = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
    };
    let (a, b, c, ()) = tokio::join!(
        coordinator.submit(METHOD, METHOD, json!("a")),
        coordinator.submit_with_cancel(METHOD, METHOD, json!("b"), &token),
        coordinator.submit(METHOD, METHOD, json!("c")),
        cancel_soon,
    );

    assert_eq!(a.unwrap().into_value(), json!({ "user": "a" }));
    assert!(matches!(b.unwrap_err().kind(), CallErrorKind::Cancelled));
    assert_eq!(c.unwrap().into_value(), json!({ "user": "c" }));
    assert_eq!(*dispatches.lock().unwrap(), vec![vec![json!("a"), json!("c")]]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_abandoned_by_everyone_is_not_dispatched() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(config(50, 25), echo_flush(dispatches.clone()));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        join_all((0..2).map(|i| coordinator.submit(METHOD, METHOD, json!(i)))),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(coordinator.queued(METHOD, METHOD), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(dispatches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_keys_batch_separately() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(config(50, 25), echo_flush(dispatches.clone()));

    let (a, b) = tokio::join!(
        coordinator.submit(METHOD, "users.get:eu", json!(1)),
        coordinator.submit(METHOD, "users.get:us", json!(2)),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(dispatches.lock().unwrap().len(), 2);
}

/// Flush that holds the batch for `admission` before taking it, giving up
/// if every caller leaves in the meantime.
fn slow_admission_flush(admission: Duration, dispatches: Dispatches) -> BatchFlush {
    Arc::new(
        move |batch: Arc<PendingBatch>| -> BoxFuture<'static, CallResult<Vec<Value>>> {
            let dispatches = dispatches.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(admission) => {}
                    _ = batch.abandoned().cancelled() => return Err(CallError::cancelled()),
                }
                let params = batch.take();
                dispatches.lock().unwrap().push(params.clone());
                Ok(params)
            }
            .boxed()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_caller_can_leave_while_flush_awaits_admission() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(
        config(20, 25),
        slow_admission_flush(Duration::from_secs(15), dispatches.clone()),
    );
    let token = CancellationToken::new();
    let started = tokio::time::Instant::now();

    let cancel_after_window = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(
        coordinator.submit_with_cancel(METHOD, METHOD, json!("A"), &token),
        cancel_after_window,
    );

    assert!(matches!(result.unwrap_err().kind(), CallErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(200));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(dispatches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remaining_callers_dispatch_after_one_leaves_during_admission() {
    let dispatches = Dispatches::default();
    let coordinator = BatchingCoordinator::new(
        config(20, 25),
        slow_admission_flush(Duration::from_secs(1), dispatches.clone()),
    );
    let token = CancellationToken::new();

    let cancel_after_window = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (a, b, ()) = tokio::join!(
        coordinator.submit_with_cancel(METHOD, METHOD, json!("a"), &token),
        coordinator.submit(METHOD, METHOD, json!("b")),
        cancel_after_window,
    );

    assert!(matches!(a.unwrap_err().kind(), CallErrorKind::Cancelled));
    assert_eq!(b.unwrap().into_value(), json!("b"));
    assert_eq!(*dispatches.lock().unwrap(), vec![vec![json!("b")]]);
}

#[tokio::test(start_paused = true)]
async fn test_reply_counts_every_dispatch_of_the_batch() {
    let flush: BatchFlush = Arc::new(
        |batch: Arc<PendingBatch>| -> BoxFuture<'static, CallResult<Vec<Value>>> {
            async move {
                batch.take();
                Ok(batch.take())
            }
            .boxed()
        },
    );
    let coordinator = BatchingCoordinator::new(config(20, 25), flush);

    let reply = coordinator.submit(METHOD, METHOD, json!(7)).await.unwrap();
    assert_eq!(*reply.dispatches(), 2);
    assert_eq!(reply.into_value(), json!(7));
}
