//! Call result models.

use crate::error::{DbError, DbResult};
use serde::Serialize;

/// Outcome of a statement that returns no rows.
///
/// Drivers differ in what they report; each accessor fails with
/// `Unsupported` on its own when the driver cannot provide that figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSummary {
    driver: String,
    last_insert_id: Option<i64>,
    rows_affected: Option<u64>,
}

impl ExecSummary {
    pub fn new(
        driver: impl Into<String>,
        last_insert_id: Option<i64>,
        rows_affected: Option<u64>,
    ) -> Self {
        Self {
            driver: driver.into(),
            last_insert_id,
            rows_affected,
        }
    }

    /// Key generated by the statement (e.g. an autoincrement id).
    pub fn last_insert_id(&self) -> DbResult<i64> {
        self.last_insert_id
            .ok_or_else(|| DbError::unsupported(&self.driver, "last insert id"))
    }

    /// Rows changed by the statement.
    pub fn rows_affected(&self) -> DbResult<u64> {
        self.rows_affected
            .ok_or_else(|| DbError::unsupported(&self.driver, "rows affected"))
    }
}

/// Serializable view used by the CLI; unsupported figures become `null`.
impl Serialize for ExecSummary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("ExecSummary", 2)?;
        s.serialize_field("last_insert_id", &self.last_insert_id)?;
        s.serialize_field("rows_affected", &self.rows_affected)?;
        s.end()
    }
}

/// Snapshot of a handle's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently open, idle or in use
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
    /// Bridge calls currently running on the handle
    pub in_flight: usize,
}
