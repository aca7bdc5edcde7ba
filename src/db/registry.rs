//! Driver registry.
//!
//! Drivers are plugged in at startup by registering a [`Driver`] under a
//! [`DriverId`]. `open` later resolves the id back to the driver, which builds
//! the native pool for a data source.
//!
//! # Initialization contract
//!
//! Register every driver (for the built-ins, call [`install_default_drivers`])
//! before the first `open` that names it. Registration takes the write lock;
//! lookups only take the shared read lock, so concurrent `open` calls never
//! wait on one another once registration has settled.

use crate::config::{ConnectionOptions, TlsConfig};
use crate::db::cancel::CancelSignal;
use crate::db::marshal::NativeParam;
use crate::error::{DbError, DbResult};
use crate::models::{ExecSummary, PoolStats, Row};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::{debug, info};

/// Opaque, process-wide name of a registered driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(Arc<str>);

impl DriverId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DriverId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&DriverId> for DriverId {
    fn from(id: &DriverId) -> Self {
        id.clone()
    }
}

/// A native connection pool as seen by the bridge.
///
/// Implementations check a connection out per call and must hand it back on
/// every exit path, including when the returned future is dropped early.
///
/// Calls with a deadline carry a [`CancelSignal`]. Once it fires, the pool
/// interrupts the running statement natively and completes the future
/// promptly (with whatever error the interruption produced), leaving the
/// connection reusable.
pub trait NativePool: Send + Sync + std::fmt::Debug {
    /// Run a statement that returns no rows.
    fn execute<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<ExecSummary>>;

    /// Run a query and materialize every row.
    fn fetch_all<'a>(
        &'a self,
        sql: &'a str,
        params: &'a [NativeParam],
        cancel: Option<&'a CancelSignal>,
    ) -> BoxFuture<'a, DbResult<Vec<Row>>>;

    /// Close all connections. Called exactly once, after in-flight calls drain.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Current connection counts. `in_flight` is filled in by the handle.
    fn stats(&self) -> PoolStats;
}

/// Factory for native pools of one database product.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Build a pool for `data_source` with `options` applied.
    ///
    /// Must not perform network I/O: connectivity problems surface on the
    /// first call. Only configuration errors (a malformed data source) fail
    /// here. Called from within a Tokio runtime.
    fn open(
        &self,
        data_source: &str,
        options: &ConnectionOptions,
        tls: &TlsConfig,
    ) -> DbResult<Arc<dyn NativePool>>;
}

/// Mapping from driver ids to drivers.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<DriverId, Arc<dyn Driver>>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers())
            .finish()
    }
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `id`.
    ///
    /// Registering the same driver instance again is a no-op; a different
    /// driver under a taken id fails with `DriverConflict`.
    pub fn register(&self, id: impl Into<DriverId>, driver: Arc<dyn Driver>) -> DbResult<DriverId> {
        let id = id.into();
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = drivers.get(&id) {
            if Arc::ptr_eq(existing, &driver) {
                debug!(driver = %id, "Driver already registered");
                return Ok(id);
            }
            return Err(DbError::driver_conflict(id.as_str()));
        }

        drivers.insert(id.clone(), driver);
        info!(driver = %id, "Registered driver");
        Ok(id)
    }

    /// Look up the driver registered under `id`.
    pub fn resolve(&self, id: &DriverId) -> DbResult<Arc<dyn Driver>> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        drivers
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::unknown_driver(id.as_str()))
    }

    pub fn is_registered(&self, id: &DriverId) -> bool {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        drivers.contains_key(id)
    }

    /// Registered driver ids, sorted.
    pub fn drivers(&self) -> Vec<DriverId> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = drivers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

static GLOBAL_REGISTRY: LazyLock<Arc<DriverRegistry>> =
    LazyLock::new(|| Arc::new(DriverRegistry::new()));

/// The process-wide registry.
pub fn global() -> Arc<DriverRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

/// Register a driver in the process-wide registry.
pub fn register_driver(id: impl Into<DriverId>, driver: Arc<dyn Driver>) -> DbResult<DriverId> {
    GLOBAL_REGISTRY.register(id, driver)
}

/// Register the built-in sqlx drivers (`sqlite3`, `postgres`, `mysql`) in the
/// process-wide registry. Safe to call any number of times.
pub fn install_default_drivers() -> DbResult<()> {
    install_builtin_drivers(&GLOBAL_REGISTRY)
}

/// Register the built-in sqlx drivers in `registry`.
pub fn install_builtin_drivers(registry: &DriverRegistry) -> DbResult<()> {
    for (name, driver) in crate::db::drivers::builtin() {
        registry.register(name, driver)?;
    }
    Ok(())
}
