//! SQL Bridge Library
//!
//! A driver-agnostic bridge between an embedding runtime and SQL databases
//! (SQLite, PostgreSQL, MySQL): pluggable driver registry, pooled handles,
//! value marshaling, per-call timeouts and a small error taxonomy.
//!
//! ```ignore
//! let bridge = Bridge::with_default_drivers()?;
//! let db = bridge.open("sqlite3", "./test.db", None).await?;
//! db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[]).await?;
//! let rows = db.query("SELECT * FROM t WHERE name = ?", &["name-2".into()]).await?;
//! db.close().await;
//! ```

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use bridge::Bridge;
pub use config::{ConnectionOptions, TlsConfig, TlsVersion};
pub use db::{DatabaseHandle, DriverId};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::{ExecSummary, PoolStats, Row, Value};
