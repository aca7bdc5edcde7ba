//! Connection pool management.
//!
//! The built-in drivers use database-specific sqlx pools (MySqlPool, PgPool,
//! SqlitePool) to keep full type support, wrapped in [`SqlxPool`] so the
//! bridge can drive them through [`NativePool`].
//!
//! # Pool settings
//!
//! `ConnectionOptions` map onto sqlx's `PoolOptions`:
//!
//! | option              | sqlx                                   |
//! |---------------------|----------------------------------------|
//! | `max_open_conns`    | `max_connections`                      |
//! | `conn_max_idle_time`| `idle_timeout`                         |
//! | `conn_max_lifetime` | `max_lifetime`                         |
//! | `acquire_timeout`   | `acquire_timeout`                      |
//! | `max_idle_conns`    | `after_release` hook, see [`IdleGauge`]|
//!
//! Pools are created lazily: no connection is attempted until the first call.

use crate::config::ConnectionOptions;
use crate::db::DatabaseType;
use crate::db::cancel::CancelSignal;
use crate::db::marshal::{NativeParam, RowToValues, validate_params};
use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::registry::NativePool;
use crate::error::{DbError, DbResult};
use crate::models::{ExecSummary, PoolStats, Row};
use futures_util::future::BoxFuture;
use sqlx::pool::{PoolConnection, PoolOptions};
use sqlx::{
    Connection, Executor, MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions,
    postgres::PgConnectOptions, sqlite::SqliteConnectOptions,
};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySql,
            DbPool::Postgres(_) => DatabaseType::Postgres,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Connections open (idle or checked out) and connections idle.
    fn counts(&self) -> (u32, usize) {
        impl_db_dispatch!(self, {
            MySql(p) => (p.size(), p.num_idle()),
            Postgres(p) => (p.size(), p.num_idle()),
            SQLite(p) => (p.size(), p.num_idle()),
        })
    }

    fn idle_counter(&self) -> IdleCounter {
        let pool = self.clone();
        Box::new(move || pool.counts().1)
    }
}

// =============================================================================
// Idle Connection Cap
// =============================================================================

type IdleCounter = Box<dyn Fn() -> usize + Send + Sync>;

/// Reports the pool's idle count to its own `after_release` hook.
///
/// sqlx has no idle-connection cap, so a released connection is kept only
/// while fewer than `max_idle_conns` others sit idle. The hook is installed
/// before the pool exists, hence the late-bound counter. The counter holds a
/// pool clone; [`SqlxPool`] detaches it on close and on drop so the pool
/// does not keep itself alive.
#[derive(Clone, Default)]
pub struct IdleGauge(Arc<RwLock<Option<IdleCounter>>>);

impl IdleGauge {
    fn attach(&self, counter: IdleCounter) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(counter);
    }

    fn detach(&self) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether one more connection may go idle.
    pub fn admits_idle(&self, max_idle: usize) -> bool {
        let counter = self.0.read().unwrap_or_else(PoisonError::into_inner);
        counter.as_ref().is_none_or(|idle| idle() < max_idle)
    }
}

impl std::fmt::Debug for IdleGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self
            .0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("IdleGauge")
            .field("attached", &attached)
            .finish()
    }
}

/// Build sqlx pool options from connection options.
fn pool_options<DB: sqlx::Database>(
    options: &ConnectionOptions,
    gauge: &IdleGauge,
) -> PoolOptions<DB> {
    let max_idle = options.max_idle_or_default() as usize;
    let gauge = gauge.clone();

    PoolOptions::<DB>::new()
        .min_connections(0)
        .max_connections(options.max_open_or_default())
        .acquire_timeout(options.acquire_timeout_or_default())
        .idle_timeout(options.idle_timeout())
        .max_lifetime(options.max_lifetime())
        .after_release(move |_conn, _meta| {
            let keep = gauge.admits_idle(max_idle);
            Box::pin(async move { Ok(keep) })
        })
}

// =============================================================================
// Native Pool Wrapper
// =============================================================================

/// A sqlx pool driven through [`NativePool`].
#[derive(Debug)]
pub struct SqlxPool {
    pool: DbPool,
    gauge: IdleGauge,
    acquire_timeout: Duration,
}

impl SqlxPool {
    pub fn mysql(connect: MySqlConnectOptions, options: &ConnectionOptions) -> Self {
        let gauge = IdleGauge::default();
        let pool = pool_options::<sqlx::MySql>(options, &gauge).connect_lazy_with(connect);
        Self::attach(DbPool::MySql(pool), gauge, options)
    }

    pub fn postgres(connect: PgConnectOptions, options: &ConnectionOptions) -> Self {
        let gauge = IdleGauge::default();
        let pool = pool_options::<sqlx::Postgres>(options, &gauge).connect_lazy_with(connect);
        Self::attach(DbPool::Postgres(pool), gauge, options)
    }

    pub fn sqlite(connect: SqliteConnectOptions, options: &ConnectionOptions) -> Self {
        let gauge = IdleGauge::default();
        let pool = pool_options::<sqlx::Sqlite>(options, &gauge).connect_lazy_with(connect);
        Self::attach(DbPool::SQLite(pool), gauge, options)
    }

    fn attach(pool: DbPool, gauge: IdleGauge, options: &ConnectionOptions) -> Self {
        gauge.attach(pool.idle_counter());
        debug!(
            db_type = %pool.db_type(),
            max_open = options.max_open_or_default(),
            max_idle = options.max_idle_or_default(),
            idle_timeout = ?options.idle_timeout(),
            max_lifetime = ?options.max_lifetime(),
            "Created lazy connection pool"
        );
        Self {
            pool,
            gauge,
            acquire_timeout: options.acquire_timeout_or_default(),
        }
    }

    pub fn db_pool(&self) -> &DbPool {
        &self.pool
    }

    /// sqlx reports acquire timeouts without the configured duration.
    fn with_acquire_timeout(&self, err: DbError) -> DbError {
        match err {
            DbError::Timeout { operation, .. } => DbError::timeout(operation, self.acquire_timeout),
            other => other,
        }
    }
}

impl NativePool for SqlxPool {
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<ExecSummary>> {
        Box::pin(async move {
            validate_params(self.pool.db_type(), params)?;
            let result = impl_db_dispatch!(&self.pool, {
                MySql(p) => mysql::execute(p, sql, params, cancel).await,
                Postgres(p) => postgres::execute(p, sql, params, cancel).await,
                SQLite(p) => sqlite::execute(p, sql, params, cancel).await,
            });
            result.map_err(|e| self.with_acquire_timeout(e))
        })
    }

    fn fetch_all<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<Vec<Row>>> {
        Box::pin(async move {
            validate_params(self.pool.db_type(), params)?;
            let result = impl_db_dispatch!(&self.pool, {
                MySql(p) => mysql::fetch_all(p, sql, params, cancel).await,
                Postgres(p) => postgres::fetch_all(p, sql, params, cancel).await,
                SQLite(p) => sqlite::fetch_all(p, sql, params, cancel).await,
            });
            result.map_err(|e| self.with_acquire_timeout(e))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            self.gauge.detach();
        })
    }

    fn stats(&self) -> PoolStats {
        let (open, idle) = self.pool.counts();
        let idle = u32::try_from(idle).unwrap_or(u32::MAX).min(open);
        PoolStats {
            open,
            idle,
            in_use: open - idle,
            in_flight: 0,
        }
    }
}

impl Drop for SqlxPool {
    fn drop(&mut self) {
        self.gauge.detach();
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn collect_rows<R: RowToValues>(rows: &[R]) -> DbResult<Vec<Row>> {
    rows.iter().map(RowToValues::to_row).collect()
}

fn cancelled_error() -> DbError {
    DbError::driver("call cancelled", None)
}

/// Check a connection out, giving up if the call is cancelled first.
async fn acquire<DB: sqlx::Database>(
    pool: &sqlx::Pool<DB>,
    cancel: Option<&CancelSignal>,
) -> DbResult<PoolConnection<DB>> {
    let Some(signal) = cancel else {
        return Ok(pool.acquire().await?);
    };
    tokio::select! {
        conn = pool.acquire() => Ok(conn?),
        () = signal.cancelled() => Err(cancelled_error()),
    }
}

/// Run `work`; if `cancel` fires first, run `interrupt` and then let `work`
/// finish, which it does promptly once the statement has been interrupted.
async fn interruptible<T>(
    work: impl Future<Output = Result<T, sqlx::Error>>,
    cancel: Option<&CancelSignal>,
    interrupt: impl Future<Output = ()>,
) -> DbResult<T> {
    let Some(signal) = cancel else {
        return Ok(work.await?);
    };
    if signal.is_cancelled() {
        return Err(cancelled_error());
    }
    let mut work = std::pin::pin!(work);
    tokio::select! {
        biased;
        result = &mut work => Ok(result?),
        () = signal.cancelled() => {
            interrupt.await;
            Ok(work.await?)
        }
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Without params, statements go through the unprepared path so that
// multi-statement scripts and statements the server refuses to prepare
// still run.

mod mysql {
    use super::*;
    use sqlx::MySql;
    use sqlx::mysql::{MySqlConnection, MySqlQueryResult, MySqlRow};

    const DRIVER: &str = "mysql";

    /// Check a connection out; under a deadline also learn its thread id.
    async fn checkout(
        pool: &MySqlPool,
        cancel: Option<&CancelSignal>,
    ) -> DbResult<(PoolConnection<MySql>, Option<u64>)> {
        let mut conn = acquire(pool, cancel).await?;
        let id = match cancel {
            Some(_) => Some(
                sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
                    .fetch_one(&mut *conn)
                    .await?,
            ),
            None => None,
        };
        Ok((conn, id))
    }

    /// Abort the running statement of thread `id` from a side connection;
    /// the pooled one is busy and the pool may have no other to spare.
    async fn kill_query(pool: &MySqlPool, id: Option<u64>) {
        let Some(id) = id else { return };
        let options = pool.connect_options();
        let result = async {
            let mut side = MySqlConnection::connect_with(&options).await?;
            side.execute(format!("KILL QUERY {}", id).as_str()).await?;
            side.close().await
        }
        .await;
        match result {
            Ok(()) => debug!(connection_id = id, "Killed MySQL query"),
            Err(e) => warn!(connection_id = id, error = %e, "Failed to kill MySQL query"),
        }
    }

    pub async fn execute(
        pool: &MySqlPool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<ExecSummary> {
        let (mut conn, id) = checkout(pool, cancel).await?;
        let interrupt = kill_query(pool, id);
        let result: MySqlQueryResult = if params.is_empty() {
            interruptible((&mut *conn).execute(sql), cancel, interrupt).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            interruptible(query.execute(&mut *conn), cancel, interrupt).await?
        };

        Ok(ExecSummary::new(
            DRIVER,
            i64::try_from(result.last_insert_id()).ok(),
            Some(result.rows_affected()),
        ))
    }

    pub async fn fetch_all(
        pool: &MySqlPool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<Vec<Row>> {
        let (mut conn, id) = checkout(pool, cancel).await?;
        let interrupt = kill_query(pool, id);
        let rows: Vec<MySqlRow> = if params.is_empty() {
            interruptible((&mut *conn).fetch_all(sql), cancel, interrupt).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            interruptible(query.fetch_all(&mut *conn), cancel, interrupt).await?
        };
        collect_rows(&rows)
    }
}

mod postgres {
    use super::*;
    use sqlx::Postgres;
    use sqlx::postgres::{PgArguments, PgConnection, PgQueryResult, PgRow};
    use sqlx::query::Query;

    const DRIVER: &str = "postgres";

    /// Check a connection out; under a deadline also learn its backend pid.
    async fn checkout(
        pool: &PgPool,
        cancel: Option<&CancelSignal>,
    ) -> DbResult<(PoolConnection<Postgres>, Option<i32>)> {
        let mut conn = acquire(pool, cancel).await?;
        let pid = match cancel {
            Some(_) => Some(
                sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
                    .fetch_one(&mut *conn)
                    .await?,
            ),
            None => None,
        };
        Ok((conn, pid))
    }

    /// Cancel the running statement of backend `pid` from a side connection.
    async fn cancel_backend(pool: &PgPool, pid: Option<i32>) {
        let Some(pid) = pid else { return };
        let options = pool.connect_options();
        let result = async {
            let mut side = PgConnection::connect_with(&options).await?;
            sqlx::query("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .execute(&mut side)
                .await?;
            side.close().await
        }
        .await;
        match result {
            Ok(()) => debug!(pid, "Cancelled PostgreSQL backend"),
            Err(e) => warn!(pid, error = %e, "Failed to cancel PostgreSQL backend"),
        }
    }

    /// Bind every argument onto `sql`.
    ///
    /// NULL is sent untyped, so a statement prepared with one has that
    /// parameter's type inferred by the server. Such statements are not
    /// cached: a later call with a typed value in that slot prepares afresh.
    fn bind_all<'q>(sql: &'q str, params: &'q [NativeParam]) -> Query<'q, Postgres, PgArguments> {
        let has_null = params.iter().any(|p| matches!(p, NativeParam::Null));
        let mut query = sqlx::query(sql).persistent(!has_null);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        query
    }

    pub async fn execute(
        pool: &PgPool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<ExecSummary> {
        let (mut conn, pid) = checkout(pool, cancel).await?;
        let interrupt = cancel_backend(pool, pid);
        let result: PgQueryResult = if params.is_empty() {
            interruptible((&mut *conn).execute(sql), cancel, interrupt).await?
        } else {
            let query = bind_all(sql, params);
            interruptible(query.execute(&mut *conn), cancel, interrupt).await?
        };

        // the protocol has no generated-key field; use RETURNING instead
        Ok(ExecSummary::new(DRIVER, None, Some(result.rows_affected())))
    }

    pub async fn fetch_all(
        pool: &PgPool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<Vec<Row>> {
        let (mut conn, pid) = checkout(pool, cancel).await?;
        let interrupt = cancel_backend(pool, pid);
        let rows: Vec<PgRow> = if params.is_empty() {
            interruptible((&mut *conn).fetch_all(sql), cancel, interrupt).await?
        } else {
            let query = bind_all(sql, params);
            interruptible(query.fetch_all(&mut *conn), cancel, interrupt).await?
        };
        collect_rows(&rows)
    }
}

mod sqlite {
    use super::*;
    use sqlx::Sqlite;
    use sqlx::sqlite::{SqliteQueryResult, SqliteRow};

    const DRIVER: &str = "sqlite3";

    /// VM instructions between checks of the cancel signal.
    const PROGRESS_OPS: i32 = 1000;

    /// Check a connection out; under a deadline also arm a progress handler
    /// that aborts the running statement with SQLITE_INTERRUPT once the
    /// signal fires. The handler runs on the connection's worker thread.
    async fn checkout(
        pool: &SqlitePool,
        cancel: Option<&CancelSignal>,
    ) -> DbResult<PoolConnection<Sqlite>> {
        let mut conn = acquire(pool, cancel).await?;
        if let Some(signal) = cancel {
            let signal = signal.clone();
            let mut handle = conn.lock_handle().await?;
            handle.set_progress_handler(PROGRESS_OPS, move || !signal.is_cancelled());
        }
        Ok(conn)
    }

    /// Disarm the handler before the connection goes back to the pool.
    async fn checkin(conn: &mut PoolConnection<Sqlite>, cancel: Option<&CancelSignal>) {
        if cancel.is_none() {
            return;
        }
        match conn.lock_handle().await {
            Ok(mut handle) => handle.remove_progress_handler(),
            Err(e) => warn!(error = %e, "Failed to remove SQLite progress handler"),
        }
    }

    pub async fn execute(
        pool: &SqlitePool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<ExecSummary> {
        let mut conn = checkout(pool, cancel).await?;
        let result: DbResult<SqliteQueryResult> = if params.is_empty() {
            interruptible((&mut *conn).execute(sql), cancel, async {}).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            interruptible(query.execute(&mut *conn), cancel, async {}).await
        };
        checkin(&mut conn, cancel).await;
        let result = result?;

        Ok(ExecSummary::new(
            DRIVER,
            Some(result.last_insert_rowid()),
            Some(result.rows_affected()),
        ))
    }

    pub async fn fetch_all(
        pool: &SqlitePool,
        sql: &str,
        params: &[NativeParam],
        cancel: Option<&CancelSignal>,
    ) -> DbResult<Vec<Row>> {
        let mut conn = checkout(pool, cancel).await?;
        let rows: DbResult<Vec<SqliteRow>> = if params.is_empty() {
            interruptible((&mut *conn).fetch_all(sql), cancel, async {}).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            interruptible(query.fetch_all(&mut *conn), cancel, async {}).await
        };
        checkin(&mut conn, cancel).await;
        collect_rows(&rows?)
    }
}
