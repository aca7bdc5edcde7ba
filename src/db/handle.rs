//! Database handles.
//!
//! A [`DatabaseHandle`] fronts one native pool. It is cheap to clone; every
//! clone refers to the same pool and lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! Open --close()--> Closing --in-flight calls drained--> Closed
//! ```
//!
//! Calls are admitted only while the handle is open. `close` stops admission
//! immediately, waits for admitted calls to finish, then closes the pool.
//! Admission bumps the in-flight count before it checks the state and
//! `close` flips the state before it reads the count, so a call either sees
//! the handle closing or is seen by `close`.

use crate::config::ConnectionOptions;
use crate::db::executor::{CallContext, CallExecutor};
use crate::db::registry::{DriverId, NativePool};
use crate::error::{DbError, DbResult};
use crate::models::{ExecSummary, PoolStats, Row, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closing,
    Closed,
}

impl HandleState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

struct HandleInner {
    executor: CallExecutor,
    options: ConnectionOptions,
    state: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl HandleInner {
    /// Admit one call, or fail if the handle is no longer open.
    fn enter(&self) -> DbResult<CallGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard { inner: self };
        if self.state.load(Ordering::SeqCst) != OPEN {
            return Err(DbError::HandleClosed);
        }
        Ok(guard)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.state.load(Ordering::SeqCst) == OPEN {
            warn!(
                driver = %self.executor.driver(),
                "Database handle dropped without close; connections are dropped unclosed"
            );
        }
    }
}

/// RAII marker for an admitted call.
///
/// Dropping it (on return, error, or cancellation) releases the call's slot
/// and wakes a pending `close` once the last one leaves.
struct CallGuard<'a> {
    inner: &'a HandleInner,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// A pooled handle to one data source.
#[derive(Clone)]
pub struct DatabaseHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("driver", self.driver())
            .field("state", &self.state())
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    pub(crate) fn new(
        driver: DriverId,
        pool: Arc<dyn NativePool>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                executor: CallExecutor::new(driver, pool),
                options,
                state: AtomicU8::new(OPEN),
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Run a statement that returns no rows.
    pub async fn exec(&self, statement: &str, args: &[Value]) -> DbResult<ExecSummary> {
        self.exec_inner(statement, args, None).await
    }

    /// Run a statement that returns no rows, giving up after `timeout`.
    pub async fn exec_with_timeout(
        &self,
        timeout: Duration,
        statement: &str,
        args: &[Value],
    ) -> DbResult<ExecSummary> {
        self.exec_inner(statement, args, Some(timeout)).await
    }

    /// Run a query and return every row.
    pub async fn query(&self, statement: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        self.query_inner(statement, args, None).await
    }

    /// Run a query and return every row, giving up after `timeout`.
    pub async fn query_with_timeout(
        &self,
        timeout: Duration,
        statement: &str,
        args: &[Value],
    ) -> DbResult<Vec<Row>> {
        self.query_inner(statement, args, Some(timeout)).await
    }

    async fn exec_inner(
        &self,
        statement: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> DbResult<ExecSummary> {
        let _guard = self.inner.enter()?;
        let ctx = CallContext::new(statement, timeout);
        self.inner.executor.exec(&ctx, args).await
    }

    async fn query_inner(
        &self,
        statement: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> DbResult<Vec<Row>> {
        let _guard = self.inner.enter()?;
        let ctx = CallContext::new(statement, timeout);
        self.inner.executor.query(&ctx, args).await
    }

    /// Stop accepting calls, wait for in-flight calls, then close the pool.
    ///
    /// Only the first call does the work. Later or concurrent calls return
    /// at once, possibly before the pool has finished closing.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(driver = %inner.executor.driver(), "Handle already closing");
            return;
        }

        info!(
            driver = %inner.executor.driver(),
            in_flight = inner.in_flight.load(Ordering::SeqCst),
            "Closing database handle"
        );

        loop {
            let mut drained = std::pin::pin!(inner.drained.notified());
            // register before checking, or a wakeup between the two is lost
            drained.as_mut().enable();
            if inner.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            drained.await;
        }

        inner.executor.pool().close().await;
        inner.state.store(CLOSED, Ordering::SeqCst);
        info!(driver = %inner.executor.driver(), "Database handle closed");
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_raw(self.inner.state.load(Ordering::SeqCst))
    }

    /// True once `close` has been called, even if it is still draining.
    pub fn is_closed(&self) -> bool {
        self.state() != HandleState::Open
    }

    /// Connection counts plus the calls currently running on this handle.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            ..self.inner.executor.pool().stats()
        }
    }

    pub fn driver(&self) -> &DriverId {
        self.inner.executor.driver()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }
}
