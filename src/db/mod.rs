//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Driver registry and the driver/pool capability traits
//! - Built-in sqlx drivers for SQLite, PostgreSQL and MySQL
//! - Connection pool wrapper applying `ConnectionOptions`
//! - Call execution with per-call timeouts and native cancellation
//! - Value marshaling in both directions
//! - Database handles with a drain-then-close lifecycle

#[macro_use]
pub mod macros;
pub mod cancel;
pub mod drivers;
pub mod executor;
pub mod handle;
pub mod marshal;
pub mod params;
pub mod pool;
pub mod registry;

pub use cancel::{CANCEL_GRACE, CancelSignal};
pub use executor::{CallContext, CallExecutor};
pub use handle::{DatabaseHandle, HandleState};
pub use macros::DatabaseType;
pub use marshal::{NativeParam, RowToValues, TypeCategory, categorize_type, to_native};
pub use pool::{DbPool, IdleGauge, SqlxPool};
pub use registry::{
    Driver, DriverId, DriverRegistry, NativePool, install_default_drivers, register_driver,
};
