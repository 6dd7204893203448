//! Unit tests for the correlation table

use super::*;
use nmmes_rpc_proto::{ErrorCode, ErrorDetails};
use proptest::prelude::*;
use serde_json::json;
use tokio::time::Instant;
use tokio_test::{assert_pending, task};

const WINDOW: Duration = Duration::from_millis(10_000);

#[test]
fn test_ids_start_at_one() {
    let table = CorrelationTable::default();
    assert_eq!(table.next_id(), 1);
    assert_eq!(table.next_id(), 2);
    assert_eq!(table.next_id(), 3);
}

#[tokio::test]
async fn test_resolve_delivers_result() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "math.add", WINDOW);

    assert_eq!(table.len(), 1);
    assert!(table.resolve(id, vec![json!(3)]));
    assert!(table.is_empty());

    assert_eq!(pending.await.unwrap(), vec![json!(3)]);
}

#[tokio::test]
async fn test_reject_delivers_error() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "math.add", WINDOW);

    assert!(table.reject(id, RpcError::ConnectionLost));
    assert!(matches!(pending.await, Err(RpcError::ConnectionLost)));
}

#[tokio::test]
async fn test_settle_maps_unregistered_namespace() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "foo.bar", WINDOW);

    table.settle(id, Outcome::Error(ErrorDetails::unregistered("foo.bar")));
    match pending.await {
        Err(RpcError::UnregisteredNamespace { namespace }) => assert_eq!(namespace, "foo.bar"),
        other => panic!("Unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_settle_keeps_handler_errors() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "user.get", WINDOW);

    table.settle(id, Outcome::Error(ErrorDetails::new(ErrorCode::HandlerFailed, "no such user")));
    match pending.await {
        Err(RpcError::Remote(details)) => assert_eq!(details.message, "no such user"),
        other => panic!("Unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_unknown_ids_are_ignored() {
    let table = CorrelationTable::new(&EndpointConfig::default().with_log_unknown_responses(true));
    assert!(!table.resolve(42, vec![]));
    assert!(!table.reject(42, RpcError::ConnectionLost));
    assert!(table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_at_window() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let start = Instant::now();
    let pending = table.register(id, "slow", Duration::from_millis(500));

    match pending.await {
        Err(RpcError::Timeout { namespace, duration }) => {
            assert_eq!(namespace, "slow");
            assert_eq!(duration, Duration::from_millis(500));
        }
        other => panic!("Unexpected outcome: {:?}", other),
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(510));
    assert!(table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_timeout() {
    let table = CorrelationTable::default();
    let first = table.next_id();
    let second = table.next_id();
    let timed_out = table.register(first, "slow", Duration::from_millis(100));
    let waiting = table.register(second, "fast", WINDOW);

    assert!(timed_out.await.unwrap_err().is_timeout());

    // The late answer is dropped without touching the other call
    assert!(!table.resolve(first, vec![json!("late")]));
    assert_eq!(table.len(), 1);

    assert!(table.resolve(second, vec![json!("on time")]));
    assert_eq!(waiting.await.unwrap(), vec![json!("on time")]);
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "echo", WINDOW);

    assert!(table.resolve(id, vec![json!(1)]));
    assert!(!table.resolve(id, vec![json!(2)]));
    assert_eq!(pending.await.unwrap(), vec![json!(1)]);
}

#[tokio::test]
async fn test_out_of_order_responses() {
    let table = CorrelationTable::default();
    let ids: Vec<u64> = (0..3).map(|_| table.next_id()).collect();
    let calls: Vec<PendingCall> = ids.iter().map(|id| table.register(*id, "echo", WINDOW)).collect();

    for id in ids.iter().rev() {
        assert!(table.resolve(*id, vec![json!(id)]));
    }

    for (id, call) in ids.iter().zip(calls) {
        assert_eq!(call.await.unwrap(), vec![json!(id)]);
    }
}

#[tokio::test]
async fn test_reject_in_flight_spares_queued_calls() {
    let table = CorrelationTable::default();
    let sent = table.next_id();
    let queued = table.next_id();
    let sent_call = table.register(sent, "a", WINDOW);
    let queued_call = table.register(queued, "b", WINDOW);
    table.mark_sent(sent, 1);

    assert_eq!(table.reject_in_flight(1), 1);
    assert!(matches!(sent_call.await, Err(RpcError::ConnectionLost)));

    assert_eq!(table.len(), 1);
    assert!(table.resolve(queued, vec![]));
    assert!(queued_call.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sent_after_close_is_rejected() {
    let table = CorrelationTable::default();
    let stale = table.next_id();
    let fresh = table.next_id();
    let stale_call = table.register(stale, "a", WINDOW);
    let fresh_call = table.register(fresh, "b", WINDOW);

    // The close of transport 1 is seen before its sends are acknowledged
    assert_eq!(table.reject_in_flight(1), 0);
    table.mark_sent(stale, 1);
    table.mark_sent(fresh, 2);

    assert!(matches!(stale_call.await, Err(RpcError::ConnectionLost)));
    assert_eq!(table.len(), 1);

    // A later close of transport 2 still takes the call sent on it
    assert_eq!(table.reject_in_flight(2), 1);
    assert!(matches!(fresh_call.await, Err(RpcError::ConnectionLost)));
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_older_close_spares_newer_transport() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "a", WINDOW);
    table.mark_sent(id, 3);

    assert_eq!(table.reject_in_flight(2), 0);
    assert!(table.resolve(id, vec![json!("ok")]));
    assert_eq!(pending.await.unwrap(), vec![json!("ok")]);
}

#[tokio::test]
async fn test_unbounded_window_does_not_overflow() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let mut pending = task::spawn(table.register(id, "forever", Duration::MAX));

    assert_pending!(pending.poll());
    assert!(table.resolve(id, vec![json!(1)]));
    assert!(pending.is_woken());
    assert_eq!(pending.await.unwrap(), vec![json!(1)]);
}

#[tokio::test]
async fn test_reject_all() {
    let table = CorrelationTable::default();
    let a = table.register(table.next_id(), "a", WINDOW);
    let b = table.register(table.next_id(), "b", WINDOW);

    assert_eq!(table.reject_all(), 2);
    assert!(matches!(a.await, Err(RpcError::ConnectionLost)));
    assert!(matches!(b.await, Err(RpcError::ConnectionLost)));
}

#[tokio::test]
async fn test_dropped_call_removes_entry() {
    let table = CorrelationTable::default();
    let id = table.next_id();
    let pending = table.register(id, "gone", WINDOW);
    assert_eq!(pending.id(), id);
    assert_eq!(table.len(), 1);

    drop(pending);
    assert!(table.is_empty());
}

proptest! {
    #[test]
    fn test_ids_strictly_increase(count in 1usize..500) {
        let table = CorrelationTable::default();
        let ids: Vec<u64> = (0..count).map(|_| table.next_id()).collect();

        prop_assert_eq!(ids[0], 1);
        prop_assert!(ids.windows(2).all(|pair| pair[1] == pair[0] + 1));
    }

    #[test]
    fn test_concurrent_registration_keeps_entries_apart(count in 1usize..50) {
        tokio_test::block_on(async {
            let table = Arc::new(CorrelationTable::default());
            let mut tasks = Vec::new();
            for _ in 0..count {
                let table = table.clone();
                tasks.push(tokio::spawn(async move {
                    let id = table.next_id();
                    let pending = table.register(id, "echo", WINDOW);
                    tokio::task::yield_now().await;
                    table.resolve(id, vec![json!(id)]);
                    (id, pending.await)
                }));
            }

            for task in tasks {
                let (id, result) = task.await.unwrap();
                assert_eq!(result.unwrap(), vec![json!(id)]);
            }
            assert!(table.is_empty());
        });
    }
}
