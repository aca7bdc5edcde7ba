//! Handle lifecycle and timeout tests.
//!
//! These run against the scripted mock driver so timing is under the test's
//! control instead of the database's.

mod common;

use common::{MockState, max_open, mock_bridge, wait_until};
use sql_bridge::config::DEFAULT_MAX_OPEN_CONNS;
use sql_bridge::db::{CANCEL_GRACE, HandleState};
use sql_bridge::{ErrorKind, Value};
use std::time::{Duration, Instant};

// =========================================================================
// Close
// =========================================================================

#[tokio::test]
async fn test_close_waits_for_in_flight_call() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let call = {
        let db = db.clone();
        tokio::spawn(async move { db.exec("SLEEP 200", &[]).await })
    };
    wait_until(|| MockState::get(&state.active) == 1).await;
    assert_eq!(db.stats().in_flight, 1);

    db.close().await;

    // The pool was only closed after the call finished.
    assert!(state.closed.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(MockState::get(&state.completed_at_close), 1);
    assert_eq!(MockState::get(&state.cancelled), 0);
    call.await.unwrap().unwrap();
    assert_eq!(db.state(), HandleState::Closed);
}

#[tokio::test]
async fn test_calls_rejected_while_closing() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let call = {
        let db = db.clone();
        tokio::spawn(async move { db.query("SLEEP 300", &[]).await })
    };
    wait_until(|| MockState::get(&state.active) == 1).await;

    let closing = {
        let db = db.clone();
        tokio::spawn(async move { db.close().await })
    };
    wait_until(|| db.state() == HandleState::Closing).await;

    let err = db.query("ROWS 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandleClosed);
    let err = db.exec("ROWS 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandleClosed);

    closing.await.unwrap();
    assert!(call.await.unwrap().is_ok());
    assert_eq!(db.state(), HandleState::Closed);
    // Only the first call ever reached the pool.
    assert_eq!(MockState::get(&state.started), 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (bridge, _state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let other = db.clone();
    tokio::join!(db.close(), other.close());
    db.close().await;

    assert!(db.is_closed());
    let err = other.query("ROWS 1", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandleClosed);
}

// =========================================================================
// Timeouts
// =========================================================================

#[tokio::test]
async fn test_timeout_interrupts_call_and_releases_connection() {
    let (bridge, state) = mock_bridge();
    let db = bridge
        .open("mock", "mock://", Some(max_open(1)))
        .await
        .unwrap();

    let started = Instant::now();
    let err = db
        .query_with_timeout(Duration::from_millis(50), "SLEEP 10000", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.statement(), Some("SLEEP 10000"));
    assert!(started.elapsed() < Duration::from_secs(5));

    // The pool was told to stop and wound the call down itself.
    assert_eq!(MockState::get(&state.active), 0);
    assert_eq!(MockState::get(&state.interrupted), 1);
    assert_eq!(MockState::get(&state.cancelled), 0);
    assert_eq!(db.stats().in_flight, 0);

    // The single connection is free again, right away.
    let started = Instant::now();
    let rows = db.query("ROWS 2", &[]).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("n"), Some(&Value::Int(1)));

    db.close().await;
}

#[tokio::test]
async fn test_unresponsive_call_dropped_after_grace() {
    let (bridge, state) = mock_bridge();
    let db = bridge
        .open("mock", "mock://", Some(max_open(1)))
        .await
        .unwrap();

    let started = Instant::now();
    let err = db
        .exec_with_timeout(Duration::from_millis(20), "STALL 10000", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= CANCEL_GRACE);
    assert!(started.elapsed() < Duration::from_secs(5));

    // Ignoring the signal gets the call dropped instead.
    assert_eq!(MockState::get(&state.interrupted), 0);
    assert_eq!(MockState::get(&state.cancelled), 1);
    assert_eq!(MockState::get(&state.active), 0);
    assert!(db.query("ROWS 1", &[]).await.is_ok());

    db.close().await;
}

#[tokio::test]
async fn test_calls_without_deadline_are_not_interrupted() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    db.query("SLEEP 30", &[]).await.unwrap();
    db.query_with_timeout(Duration::from_secs(5), "SLEEP 30", &[])
        .await
        .unwrap();
    assert_eq!(MockState::get(&state.interrupted), 0);
    assert_eq!(MockState::get(&state.completed), 2);

    db.close().await;
}

#[tokio::test]
async fn test_zero_timeout_never_reaches_driver() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let err = db
        .exec_with_timeout(Duration::ZERO, "ROWS 1", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(MockState::get(&state.started), 0);

    db.close().await;
}

#[tokio::test]
async fn test_timeout_is_per_call() {
    let (bridge, _state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let (short, long) = tokio::join!(
        db.query_with_timeout(Duration::from_millis(20), "SLEEP 5000", &[]),
        db.query("SLEEP 100", &[]),
    );
    assert_eq!(short.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(long.is_ok());

    db.close().await;
}

#[tokio::test]
async fn test_timeout_while_waiting_for_connection() {
    let (bridge, state) = mock_bridge();
    let db = bridge
        .open("mock", "mock://", Some(max_open(1)))
        .await
        .unwrap();

    let holder = {
        let db = db.clone();
        tokio::spawn(async move { db.exec("SLEEP 300", &[]).await })
    };
    wait_until(|| MockState::get(&state.active) == 1).await;

    let started = Instant::now();
    let err = db
        .query_with_timeout(Duration::from_millis(30), "ROWS 1", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    // the waiter gives up without holding out for the connection
    assert!(started.elapsed() < Duration::from_millis(250));

    holder.await.unwrap().unwrap();
    assert_eq!(MockState::get(&state.started), 2);
    assert_eq!(MockState::get(&state.completed), 1);
    db.close().await;
}

// =========================================================================
// Results and errors
// =========================================================================

#[tokio::test]
async fn test_driver_error_is_annotated() {
    let (bridge, _state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let err = db.exec("FAIL", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Driver);
    assert_eq!(err.sql_state(), Some("XX000"));
    assert_eq!(err.statement(), Some("FAIL"));

    // A failed call leaves the handle usable.
    assert!(db.query("ROWS 1", &[]).await.is_ok());
    db.close().await;
}

#[tokio::test]
async fn test_unsupported_summary_fields() {
    let (bridge, _state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let summary = db.exec("UNSUPPORTED", &[]).await.unwrap();
    assert_eq!(
        summary.last_insert_id().unwrap_err().kind(),
        ErrorKind::Unsupported
    );
    assert_eq!(
        summary.rows_affected().unwrap_err().kind(),
        ErrorKind::Unsupported
    );

    let summary = db.exec("ROWS 0", &[]).await.unwrap();
    assert_eq!(summary.rows_affected().unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn test_invalid_argument_rejected_before_driver() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();

    let err = db
        .exec("ROWS 1", &[Value::Int(1), Value::Float(f64::NAN)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("position 2"));
    assert_eq!(MockState::get(&state.started), 0);

    db.close().await;
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test]
async fn test_default_options_use_bounded_pool() {
    let (bridge, state) = mock_bridge();
    let db = bridge.open("mock", "mock://", None).await.unwrap();
    assert_eq!(db.options().max_open(), None);
    assert_eq!(
        MockState::get(&state.max_open),
        DEFAULT_MAX_OPEN_CONNS as usize
    );
    db.close().await;

    let db = bridge
        .open("mock", "mock://", Some(max_open(7)))
        .await
        .unwrap();
    assert_eq!(MockState::get(&state.max_open), 7);
    db.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_open_bounds_concurrency() {
    let (bridge, state) = mock_bridge();
    let db = bridge
        .open("mock", "mock://", Some(max_open(2)))
        .await
        .unwrap();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.exec("SLEEP 20", &[]).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(MockState::get(&state.peak_active) <= 2);
    assert_eq!(MockState::get(&state.completed), 10);
    assert_eq!(db.stats().in_flight, 0);

    db.close().await;
}
