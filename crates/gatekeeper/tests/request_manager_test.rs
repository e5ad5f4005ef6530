//! Request manager tests: the guarded call path end to end, one call at a time.

use gatekeeper::{
    ApiError, ApiErrorKind, CallDescriptor, CallPhase, CancellationToken, CircuitState,
    ErrorClass, GatekeeperConfig, PhaseEvent, PhaseObserver, RequestManager,
};
use serde_json::{Value, json};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn manager(methods: Value) -> RequestManager {
    let config: GatekeeperConfig = serde_json::from_value(json!({
        "defaults": {
            "retry": { "jitter": false, "initial_backoff_ms": 100 }
        },
        "methods": methods,
    }))
    .unwrap();
    config.validate().unwrap();
    RequestManager::new(config)
}

fn unavailable() -> ApiError {
    ApiError::new(ApiErrorKind::Http {
        status_code: 503,
        message: "Service unavailable".to_string(),
    })
}

#[derive(Default)]
struct PhaseLog(Mutex<Vec<(CallPhase, u32)>>);

impl PhaseObserver for PhaseLog {
    fn on_phase(&self, event: &PhaseEvent) {
        self.0.lock().unwrap().push((*event.phase(), *event.attempt()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_successful_call_records_outcome() {
    let manager = manager(json!([]));

    let value = manager
        .execute(&CallDescriptor::new("users.get"), || async {
            Ok::<_, ApiError>(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);

    let stats = manager.metrics().stats("users.get").unwrap();
    assert_eq!(*stats.success_count(), 1);
    assert_eq!(*stats.failure_count(), 0);

    let recent = manager.metrics().recent(1);
    assert_eq!(recent.len(), 1);
    assert!(*recent[0].success());
    assert_eq!(*recent[0].attempts(), 1);
    assert_eq!(*recent[0].wait(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_retried_until_success() {
    let manager = manager(json!([]));
    let calls = Arc::new(AtomicU32::new(0));
    let start = Instant::now();

    let value = manager
        .execute(&CallDescriptor::new("wall.getComments"), || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(unavailable()),
                    _ => Ok("comments"),
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "comments");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 100ms then 200ms of backoff; the bucket holds three tokens.
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert_eq!(*manager.metrics().recent(1)[0].attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_error_is_not_retried_and_keeps_circuit_closed() {
    let manager = manager(json!([
        { "name": "groups.getById", "capacity": 20, "refill_per_sec": 20.0, "failure_threshold": 2 }
    ]));
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = CallDescriptor::new("groups.getById");

    for _ in 0..5 {
        let err = manager
            .execute(&descriptor, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ApiError::new(ApiErrorKind::NotFound("group 42".into())))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Upstream);
        assert!(!err.is_retryable());
        assert_eq!(err.attempts, 1);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(manager.breaker().state("groups.getById"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_expiry_is_a_timeout() {
    let manager = manager(json!([{ "name": "photos.get", "max_attempts": 1 }]));
    let descriptor =
        CallDescriptor::new("photos.get").with_deadline(Some(Duration::from_millis(100)));
    let start = Instant::now();

    let err = manager
        .execute(&descriptor, || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::Timeout);
    assert_eq!(err.attempts, 1);
    assert_eq!(start.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_wait_beyond_maximum_is_rate_limited() {
    let manager = manager(json!([
        { "name": "messages.send", "capacity": 1, "refill_per_sec": 1.0, "max_wait_ms": 500 }
    ]));
    let descriptor = CallDescriptor::new("messages.send");
    let calls = Arc::new(AtomicU32::new(0));
    let op = || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ApiError>(())
        }
    };

    manager.execute(&descriptor, op).await.unwrap();
    let err = manager.execute(&descriptor, op).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::RateLimited);
    assert_eq!(err.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_fast_without_dispatch() {
    let manager = manager(json!([{
        "name": "wall.post",
        "capacity": 10,
        "refill_per_sec": 10.0,
        "failure_threshold": 2,
        "max_attempts": 1
    }]));
    let descriptor = CallDescriptor::new("wall.post");
    let calls = Arc::new(AtomicU32::new(0));
    let op = || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(unavailable())
        }
    };

    for _ in 0..2 {
        let err = manager.execute(&descriptor, op).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Upstream);
    }
    assert_eq!(manager.breaker().state("wall.post"), CircuitState::Open);

    let err = manager.execute(&descriptor, op).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_consumes_no_token() {
    let manager = manager(json!([
        { "name": "wall.post", "capacity": 1, "refill_per_sec": 1.0 }
    ]));
    let descriptor = CallDescriptor::new("wall.post");
    let start = Instant::now();

    manager
        .execute(&descriptor, || async { Ok::<_, ApiError>(()) })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let dispatched = Arc::new(AtomicBool::new(false));
    let waiter = tokio::spawn({
        let manager = manager.clone();
        let descriptor = descriptor.clone();
        let cancel = cancel.clone();
        let dispatched = dispatched.clone();
        async move {
            manager
                .execute_with_cancel(&descriptor, &cancel, || {
                    let dispatched = dispatched.clone();
                    async move {
                        dispatched.store(true, Ordering::SeqCst);
                        Ok::<_, ApiError>(())
                    }
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert_eq!(err.class(), ErrorClass::Cancelled);
    assert!(!dispatched.load(Ordering::SeqCst));

    // The abandoned slot is released: the next token arrives at 1s, not 2s.
    manager
        .execute(&descriptor, || async { Ok::<_, ApiError>(()) })
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(1_100));

    let stats = manager.metrics().stats("wall.post").unwrap();
    assert_eq!(*stats.success_count(), 2);
    assert_eq!(*stats.cancelled_count(), 1);
    assert_eq!(*stats.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_observer_sees_every_phase() {
    let log = Arc::new(PhaseLog::default());
    let manager = manager(json!([])).with_observer(log.clone());
    let calls = Arc::new(AtomicU32::new(0));

    manager
        .execute(&CallDescriptor::new("users.get"), || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(
        *log.0.lock().unwrap(),
        vec![
            (CallPhase::Queued, 0),
            (CallPhase::Dispatched, 1),
            (CallPhase::Retrying, 2),
            (CallPhase::Dispatched, 2),
            (CallPhase::Succeeded, 2),
        ]
    );

    let stats = manager.metrics().stats("users.get").unwrap();
    assert_eq!(stats.phase_counts().get(&CallPhase::Dispatched), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_phase_reported_only_when_waiting() {
    let log = Arc::new(PhaseLog::default());
    let manager = manager(json!([
        { "name": "friends.get", "capacity": 1, "refill_per_sec": 2.0 }
    ]))
    .with_observer(log.clone());
    let descriptor = CallDescriptor::new("friends.get");

    for _ in 0..2 {
        manager
            .execute(&descriptor, || async { Ok::<_, ApiError>(()) })
            .await
            .unwrap();
    }

    let phases: Vec<CallPhase> = log.0.lock().unwrap().iter().map(|(p, _)| *p).collect();
    assert_eq!(
        phases,
        vec![
            CallPhase::Queued,
            CallPhase::Dispatched,
            CallPhase::Succeeded,
            CallPhase::Queued,
            CallPhase::RateLimited,
            CallPhase::Dispatched,
            CallPhase::Succeeded,
        ]
    );
    assert_eq!(
        *manager.metrics().recent(1)[0].wait(),
        Duration::from_millis(500)
    );
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot_lists_configured_and_active_methods() {
    let manager = manager(json!([{ "name": "users.get", "capacity": 5 }]));

    manager
        .execute(&CallDescriptor::new("friends.get"), || async {
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap();

    let snapshot = manager.metrics_snapshot();
    assert!(snapshot.all_reachable());

    let friends = snapshot.method("friends.get").unwrap();
    assert_eq!(*friends.success_count(), 1);
    assert_eq!(*friends.circuit_state(), CircuitState::Closed);
    assert_eq!(*friends.tokens_available(), Some(2.0));

    let users = snapshot.method("users.get").unwrap();
    assert_eq!(*users.success_count(), 0);
    assert_eq!(*users.tokens_available(), None);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_reports_open_circuit_of_a_finer_key() {
    let manager = manager(json!([{
        "name": "groups.getMembers",
        "failure_threshold": 1,
        "max_attempts": 1
    }]));

    manager
        .execute(&CallDescriptor::new("groups.getMembers"), || async {
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap();
    let err = manager
        .execute(
            &CallDescriptor::new("groups.getMembers").with_key("groups.getMembers:42"),
            || async { Err::<(), _>(unavailable()) },
        )
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Upstream);

    let snapshot = manager.metrics_snapshot();
    let members = snapshot.method("groups.getMembers").unwrap();
    assert_eq!(*members.circuit_state(), CircuitState::Open);
    assert!(!snapshot.all_reachable());
    // Default capacity is 3; each key spent one token.
    assert_eq!(*members.tokens_available(), Some(2.0));
}

#[tokio::test(start_paused = true)]
async fn test_batchable_descriptor_through_execute_is_dispatched_alone() {
    let manager = manager(json!([]));
    let calls = Arc::new(AtomicU32::new(0));
    let descriptor = CallDescriptor::new("users.get").with_batchable(true);

    let value = manager
        .execute(&descriptor, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ApiError>("alone")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "alone");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*manager.metrics().stats("users.get").unwrap().batches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_manager_from_configuration_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gatekeeper.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[defaults.rate_limit]
capacity = 4

[[methods]]
name = "users.get"
capacity = 7
max_batch_size = 100
"#
    )
    .unwrap();

    let manager = RequestManager::new(GatekeeperConfig::from_file(&path).unwrap());

    let users = manager.config().for_method("users.get");
    assert_eq!(*users.rate_limit().capacity(), 7);
    assert_eq!(*users.batch().max_batch_size(), 100);
    assert_eq!(*manager.config().for_method("photos.get").rate_limit().capacity(), 4);
}
