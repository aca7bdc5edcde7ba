//! Database dispatch macros for reducing code duplication.
//!
//! The built-in drivers share one pool wrapper; these macros expand the
//! per-backend match arms at compile time.

/// Database backend behind a built-in driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Driver name the backend is registered under.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::SQLite => "sqlite3",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySql => f.write_str("MySQL"),
            Self::Postgres => f.write_str("PostgreSQL"),
            Self::SQLite => f.write_str("SQLite"),
        }
    }
}

/// Macro for generating database dispatch match arms.
///
/// This macro generates match arms for `DbPool` variants, reducing the need
/// to manually write repetitive match statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(&self.pool, {
///     MySql(p) => mysql::execute(p, sql, params).await,
///     Postgres(p) => postgres::execute(p, sql, params).await,
///     SQLite(p) => sqlite::execute(p, sql, params).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
