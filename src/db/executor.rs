//! Call execution engine.
//!
//! Runs one bridge call against a native pool:
//! - Marshals host arguments into native parameters
//! - Enforces the per-call deadline
//! - Annotates runtime failures with the statement that caused them
//!
//! On timeout the call's [`CancelSignal`] fires and the pool interrupts the
//! statement natively. The call then gets [`CANCEL_GRACE`] to wind down
//! before its future is dropped; the pools return the checked-out connection
//! from their drop path too, so a timed-out call never leaks a connection.

use crate::db::cancel::{CANCEL_GRACE, CancelSignal};
use crate::db::marshal::marshal_args;
use crate::db::registry::{DriverId, NativePool};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{ExecSummary, Row, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Per-call state: the statement and its deadline.
#[derive(Debug)]
pub struct CallContext<'a> {
    statement: &'a str,
    timeout: Option<Duration>,
    started: Instant,
}

impl<'a> CallContext<'a> {
    /// Start a call. A `None` timeout lets it run until the driver returns.
    pub fn new(statement: &'a str, timeout: Option<Duration>) -> Self {
        Self {
            statement,
            timeout,
            started: Instant::now(),
        }
    }

    pub fn statement(&self) -> &'a str {
        self.statement
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Signal for the native call, present only when there is a deadline.
    fn cancel_signal(&self) -> Option<CancelSignal> {
        self.timeout.map(|_| CancelSignal::new())
    }

    /// Drive `fut` to completion or until the deadline passes.
    ///
    /// An already-expired deadline fails without polling `fut` at all. On
    /// expiry `signal` fires and `fut` is polled for up to [`CANCEL_GRACE`]
    /// more so the pool can interrupt the statement and release its
    /// connection cleanly. The call fails with `Timeout` either way.
    async fn run<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = DbResult<T>>,
        signal: Option<&CancelSignal>,
    ) -> DbResult<T> {
        let (Some(limit), Some(remaining)) = (self.timeout, self.remaining()) else {
            return fut.await;
        };
        if remaining.is_zero() {
            return Err(DbError::timeout(operation, limit));
        }

        let mut fut = std::pin::pin!(fut);
        if let Ok(result) = timeout(remaining, fut.as_mut()).await {
            return result;
        }

        if let Some(signal) = signal {
            signal.cancel();
            if timeout(CANCEL_GRACE, fut).await.is_err() {
                warn!(
                    sql = %self.statement,
                    grace_ms = CANCEL_GRACE.as_millis() as u64,
                    "Interrupted call did not finish in time; dropping it"
                );
            }
        }
        Err(DbError::timeout(operation, limit))
    }

    /// Attach the statement to failures that happened while running it.
    fn annotate(&self, err: DbError) -> DbError {
        match err.kind() {
            // not about the statement text
            ErrorKind::HandleClosed | ErrorKind::InvalidArgument => err,
            _ => err.in_statement(self.statement),
        }
    }
}

/// Executes calls against one native pool.
#[derive(Debug)]
pub struct CallExecutor {
    driver: DriverId,
    pool: Arc<dyn NativePool>,
}

impl CallExecutor {
    pub fn new(driver: DriverId, pool: Arc<dyn NativePool>) -> Self {
        Self { driver, pool }
    }

    pub fn driver(&self) -> &DriverId {
        &self.driver
    }

    pub fn pool(&self) -> &Arc<dyn NativePool> {
        &self.pool
    }

    /// Run a statement that returns no rows.
    pub async fn exec(&self, ctx: &CallContext<'_>, args: &[Value]) -> DbResult<ExecSummary> {
        let params = marshal_args(args)?;

        debug!(
            driver = %self.driver,
            sql = %ctx.statement,
            params = params.len(),
            timeout = ?ctx.timeout,
            "Executing statement"
        );

        let signal = ctx.cancel_signal();
        let result = ctx
            .run(
                "exec",
                self.pool.execute(ctx.statement, &params, signal.as_ref()),
                signal.as_ref(),
            )
            .await;
        match result {
            Ok(summary) => {
                debug!(
                    driver = %self.driver,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Statement completed"
                );
                Ok(summary)
            }
            Err(e) => Err(self.failed(ctx, e)),
        }
    }

    /// Run a query and return every row.
    pub async fn query(&self, ctx: &CallContext<'_>, args: &[Value]) -> DbResult<Vec<Row>> {
        let params = marshal_args(args)?;

        debug!(
            driver = %self.driver,
            sql = %ctx.statement,
            params = params.len(),
            timeout = ?ctx.timeout,
            "Executing query"
        );

        let signal = ctx.cancel_signal();
        let result = ctx
            .run(
                "query",
                self.pool.fetch_all(ctx.statement, &params, signal.as_ref()),
                signal.as_ref(),
            )
            .await;
        match result {
            Ok(rows) => {
                debug!(
                    driver = %self.driver,
                    rows = rows.len(),
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Query completed"
                );
                Ok(rows)
            }
            Err(e) => Err(self.failed(ctx, e)),
        }
    }

    fn failed(&self, ctx: &CallContext<'_>, err: DbError) -> DbError {
        if err.kind() == ErrorKind::Timeout {
            warn!(
                driver = %self.driver,
                elapsed_ms = ctx.elapsed().as_millis() as u64,
                error = %err,
                "Call timed out"
            );
        } else {
            debug!(driver = %self.driver, error = %err, "Call failed");
        }
        ctx.annotate(err)
    }
}
