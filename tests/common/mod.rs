//! Shared fixtures for integration tests.
//!
//! - `sqlite_db`: a handle on a fresh SQLite file in a temp directory
//! - `mock_bridge`: a bridge whose only driver is `MockDriver`, which
//!   interprets tiny scripted statements (`SLEEP <ms>`, `STALL <ms>`,
//!   `ROWS <n>`, `FAIL`, `UNSUPPORTED`) and records what happened to each call.
//!   `SLEEP` stops early when its call is cancelled; `STALL` ignores that.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use sql_bridge::db::{CancelSignal, Driver, DriverRegistry, NativeParam, NativePool};
use sql_bridge::{
    Bridge, ConnectionOptions, DatabaseHandle, DbError, DbResult, ExecSummary, PoolStats, Row,
    TlsConfig, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

// =========================================================================
// SQLite
// =========================================================================

pub struct SqliteDb {
    pub db: DatabaseHandle,
    pub path: PathBuf,
    _dir: TempDir,
}

/// Open a handle on a new SQLite database file.
pub async fn sqlite_db(options: Option<ConnectionOptions>) -> SqliteDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let bridge = Bridge::with_default_drivers().unwrap();
    let db = bridge
        .open("sqlite3", path.to_str().unwrap(), options)
        .await
        .unwrap();
    SqliteDb {
        db,
        path,
        _dir: dir,
    }
}

/// Create `test_table` and insert name-1..name-5 / value-1..value-5.
pub async fn seed_test_table(db: &DatabaseHandle) {
    db.exec(
        "CREATE TABLE test_table (id integer PRIMARY KEY AUTOINCREMENT, name varchar NOT NULL, value varchar)",
        &[],
    )
    .await
    .unwrap();

    for i in 1..=5 {
        db.exec(
            "INSERT INTO test_table (name, value) VALUES (?, ?)",
            &[
                Value::from(format!("name-{}", i)),
                Value::from(format!("value-{}", i)),
            ],
        )
        .await
        .unwrap();
    }
}

pub fn max_open(n: u32) -> ConnectionOptions {
    ConnectionOptions {
        max_open_conns: Some(n),
        ..Default::default()
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =========================================================================
// Mock driver
// =========================================================================

/// What the mock pool observed.
#[derive(Debug, Default)]
pub struct MockState {
    /// Calls that reached the pool
    pub started: AtomicUsize,
    /// Calls currently holding a connection
    pub active: AtomicUsize,
    pub peak_active: AtomicUsize,
    pub completed: AtomicUsize,
    /// Calls dropped while holding a connection
    pub cancelled: AtomicUsize,
    /// Calls stopped early by their cancel signal
    pub interrupted: AtomicUsize,
    /// Open-connection cap the driver was handed on open
    pub max_open: AtomicUsize,
    pub closed: AtomicBool,
    pub completed_at_close: AtomicUsize,
}

impl MockState {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a> {
    state: &'a MockState,
    finished: bool,
}

impl<'a> ActiveGuard<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_active.fetch_max(now, Ordering::SeqCst);
        Self {
            state,
            finished: false,
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        if self.finished {
            self.state.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.state.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct MockPool {
    state: Arc<MockState>,
    connections: Semaphore,
}

impl MockPool {
    async fn run(&self, sql: &str, cancel: Option<&CancelSignal>) -> DbResult<Vec<Row>> {
        self.state.started.fetch_add(1, Ordering::SeqCst);
        let acquire = self.connections.acquire();
        let _conn = match cancel {
            Some(signal) => tokio::select! {
                permit = acquire => permit,
                () = signal.cancelled() => return Err(DbError::driver("mock cancelled", None)),
            },
            None => acquire.await,
        }
        .map_err(|_| DbError::HandleClosed)?;
        let mut guard = ActiveGuard::enter(&self.state);

        let mut parts = sql.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next().and_then(|n| n.parse::<u64>().ok()).unwrap_or(0);

        let result = match verb {
            "SLEEP" => {
                let sleep = tokio::time::sleep(Duration::from_millis(arg));
                match cancel {
                    Some(signal) => tokio::select! {
                        () = sleep => Ok(Vec::new()),
                        () = signal.cancelled() => {
                            self.state.interrupted.fetch_add(1, Ordering::SeqCst);
                            Err(DbError::driver("mock interrupted", Some("57014".to_string())))
                        }
                    },
                    None => {
                        sleep.await;
                        Ok(Vec::new())
                    }
                }
            }
            "STALL" => {
                tokio::time::sleep(Duration::from_millis(arg)).await;
                Ok(Vec::new())
            }
            "ROWS" => Ok((0..arg)
                .map(|i| [("n".to_string(), Value::Int(i as i64))].into_iter().collect())
                .collect()),
            "FAIL" => Err(DbError::driver("mock failure", Some("XX000".to_string()))),
            _ => Ok(Vec::new()),
        };
        guard.finished = true;
        result
    }
}

impl NativePool for MockPool {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        _params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<ExecSummary>> {
        Box::pin(async move {
            self.run(sql, cancel).await?;
            if sql == "UNSUPPORTED" {
                Ok(ExecSummary::new("mock", None, None))
            } else {
                Ok(ExecSummary::new("mock", None, Some(0)))
            }
        })
    }

    fn fetch_all<'a>(
        &'a self,
        sql: &'a str,
        _params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<Vec<Row>>> {
        Box::pin(self.run(sql, cancel))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let completed = self.state.completed.load(Ordering::SeqCst);
            self.state
                .completed_at_close
                .store(completed, Ordering::SeqCst);
            self.state.closed.store(true, Ordering::SeqCst);
            self.connections.close();
        })
    }

    fn stats(&self) -> PoolStats {
        let active = self.state.active.load(Ordering::SeqCst) as u32;
        PoolStats {
            open: active,
            idle: 0,
            in_use: active,
            in_flight: 0,
        }
    }
}

pub struct MockDriver {
    state: Arc<MockState>,
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(
        &self,
        _data_source: &str,
        options: &ConnectionOptions,
        _tls: &TlsConfig,
    ) -> DbResult<Arc<dyn NativePool>> {
        let max_open = options.max_open_or_default() as usize;
        self.state.max_open.store(max_open, Ordering::SeqCst);
        Ok(Arc::new(MockPool {
            state: Arc::clone(&self.state),
            connections: Semaphore::new(max_open),
        }))
    }
}

/// A bridge with a private registry holding only the mock driver.
pub fn mock_bridge() -> (Bridge, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let registry = Arc::new(DriverRegistry::new());
    registry
        .register(
            "mock",
            Arc::new(MockDriver {
                state: Arc::clone(&state),
            }),
        )
        .unwrap();
    (Bridge::with_registry(registry), state)
}
