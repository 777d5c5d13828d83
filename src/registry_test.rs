use super::*;
use serde_json::json;

fn registration(timeout_ms: u64) -> Registration {
    Registration {
        timeout: Duration::from_millis(timeout_ms),
        generation: 1,
        notify_disconnect: false,
    }
}

fn response(id: &str, payload: serde_json::Value) -> Frame {
    Frame::request("testConnection", id, payload)
}

#[tokio::test]
async fn resolve_delivers_the_response_frame_unchanged() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(1_000));
    let id = call.id().to_owned();

    let frame = response(&id, json!({"ok": true, "latency": [1, 2, 3]}));
    assert!(registry.resolve(&id, frame.clone()));

    let received = call.wait().await.expect("call should resolve");
    assert_eq!(received, frame);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn resolve_unknown_id_is_a_noop() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(1_000));

    assert!(!registry.resolve("nope", response("nope", json!(null))));
    assert!(registry.is_pending(call.id()));
}

#[tokio::test]
async fn duplicate_response_settles_only_once() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(1_000));
    let id = call.id().to_owned();

    assert!(registry.resolve(&id, response(&id, json!(1))));
    assert!(!registry.resolve(&id, response(&id, json!(2))));

    let received = call.wait().await.expect("resolve");
    assert_eq!(received.payload, json!(1));
}

#[tokio::test]
async fn error_response_rejects_with_remote_error() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(1_000));
    let id = call.id().to_owned();

    let req = response(&id, json!({}));
    registry.resolve(&id, req.reply_error("bad credentials"));

    let err = call.wait().await.expect_err("remote error");
    assert!(matches!(
        err,
        ClientError::Remote { ref kind, ref message } if kind == "testConnection" && message == "bad credentials"
    ));
}

#[tokio::test]
async fn cancel_rejects_and_removes_entry() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(1_000));
    let id = call.id().to_owned();

    assert!(registry.cancel(&id));
    assert!(!registry.cancel(&id));
    assert!(!registry.resolve(&id, response(&id, json!(null))));

    let err = call.wait().await.expect_err("cancelled");
    assert!(matches!(err, ClientError::Cancelled { request_id } if request_id == id));
}

#[tokio::test(start_paused = true)]
async fn timeout_rejects_within_window() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(5_000));
    let id = call.id().to_owned();

    let started = tokio::time::Instant::now();
    let err = call.wait().await.expect_err("should time out");
    let elapsed = started.elapsed();

    assert!(matches!(err, ClientError::Timeout { timeout_ms: 5_000, .. }));
    assert!(elapsed >= Duration::from_millis(5_000));
    assert!(elapsed < Duration::from_millis(5_100));
    assert!(!registry.is_pending(&id));
}

#[tokio::test(start_paused = true)]
async fn response_after_timeout_is_ignored() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(100));
    let id = call.id().to_owned();

    let err = call.wait().await.expect_err("timeout");
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert!(!registry.resolve(&id, response(&id, json!("late"))));
}

#[tokio::test(start_paused = true)]
async fn resolve_before_deadline_disarms_timer() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(100));
    let id = call.id().to_owned();
    registry.resolve(&id, response(&id, json!("fast")));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let frame = call.wait().await.expect("resolved before timeout");
    assert_eq!(frame.payload, json!("fast"));
}

#[tokio::test]
async fn concurrent_requests_never_cross_resolve() {
    let registry = CorrelationRegistry::new();
    let calls: Vec<PendingCall> = (0..8).map(|_| registry.register(registration(10_000))).collect();
    let ids: Vec<String> = calls.iter().map(|c| c.id().to_owned()).collect();

    // Resolve only #5; everything else must stay pending.
    registry.resolve(&ids[5], response(&ids[5], json!(5)));
    for (index, id) in ids.iter().enumerate() {
        assert_eq!(registry.is_pending(id), index != 5, "request {index}");
    }

    // Resolve the rest in reverse order.
    for (index, id) in ids.iter().enumerate().rev() {
        if index != 5 {
            registry.resolve(id, response(id, json!(index)));
        }
    }

    for (index, call) in calls.into_iter().enumerate() {
        let frame = call.wait().await.expect("resolved");
        assert_eq!(frame.payload, json!(index));
    }
}

#[tokio::test]
async fn ids_are_unique_among_outstanding_requests() {
    let registry = CorrelationRegistry::new();
    let calls: Vec<PendingCall> = (0..64).map(|_| registry.register(registration(10_000))).collect();
    let mut ids: Vec<&str> = calls.iter().map(PendingCall::id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 64);
    assert_eq!(registry.len(), 64);
}

#[tokio::test]
async fn dropping_call_cancels_entry() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(10_000));
    let id = call.id().to_owned();

    drop(call);
    assert!(!registry.is_pending(&id));
}

#[tokio::test]
async fn disconnect_only_settles_opted_in_requests_of_that_generation() {
    let registry = CorrelationRegistry::new();
    let quiet = registry.register(registration(10_000));
    let notified = registry.register(Registration {
        notify_disconnect: true,
        ..registration(10_000)
    });
    let other_generation = registry.register(Registration {
        notify_disconnect: true,
        generation: 2,
        ..registration(10_000)
    });

    assert_eq!(registry.disconnect(1), 1);
    assert!(registry.is_pending(quiet.id()));
    assert!(registry.is_pending(other_generation.id()));

    let err = notified.wait().await.expect_err("disconnected");
    assert!(matches!(err, ClientError::Disconnected { .. }));
}

#[tokio::test]
async fn invalidate_before_supersedes_older_generations() {
    let registry = CorrelationRegistry::new();
    let stale = registry.register(registration(10_000));
    let current = registry.register(Registration {
        generation: 2,
        ..registration(10_000)
    });

    assert_eq!(registry.invalidate_before(2), 1);
    assert!(registry.is_pending(current.id()));

    let err = stale.wait().await.expect_err("superseded");
    assert!(matches!(err, ClientError::Superseded { generation: 1, .. }));
}

#[test]
fn register_outside_runtime_still_tracks_entry() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(10));
    assert!(registry.is_pending(call.id()));
    assert!(registry.cancel(call.id()));
}

#[tokio::test]
async fn retag_moves_request_out_of_invalidated_generation() {
    let registry = CorrelationRegistry::new();
    let call = registry.register(registration(10_000));

    assert!(registry.retag(call.id(), 2));
    assert!(!registry.retag("unknown", 2));
    assert_eq!(registry.invalidate_before(2), 0);
    assert!(registry.is_pending(call.id()));
}
