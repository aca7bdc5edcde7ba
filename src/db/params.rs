//! Parameter binding utilities for database queries.
//!
//! Binds [`NativeParam`] values to database-specific query objects. Callers
//! run `marshal::validate_params` first, so every value reaching a binder is
//! representable by that backend.

use crate::db::marshal::NativeParam;
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite, Type};

/// A PostgreSQL NULL of no particular type.
///
/// Binding `None::<T>` would declare the parameter as `T` and the server
/// would then refuse it for columns of any other type. Declaring oid 0
/// (unspecified) lets the server infer the type from the statement.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PgNull;

impl Type<Postgres> for PgNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl Encode<'_, Postgres> for PgNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q NativeParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        NativeParam::Null => query.bind(None::<String>),
        NativeParam::Bool(v) => query.bind(*v),
        NativeParam::Int(v) => query.bind(*v),
        NativeParam::UInt(v) => query.bind(*v),
        NativeParam::Float(v) => query.bind(*v),
        NativeParam::Text(v) => query.bind(v.as_str()),
        NativeParam::Bytes(v) => query.bind(v.as_slice()),
        NativeParam::Timestamp(v) => query.bind(*v),
        NativeParam::Date(v) => query.bind(*v),
        NativeParam::Time(v) => query.bind(*v),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q NativeParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        NativeParam::Null => query.bind(PgNull),
        NativeParam::Bool(v) => query.bind(*v),
        NativeParam::Int(v) => query.bind(*v),
        // rejected earlier by validate_params
        NativeParam::UInt(v) => query.bind(i64::try_from(*v).unwrap_or(i64::MAX)),
        NativeParam::Float(v) => query.bind(*v),
        NativeParam::Text(v) => query.bind(v.as_str()),
        NativeParam::Bytes(v) => query.bind(v.as_slice()),
        NativeParam::Timestamp(v) => query.bind(*v),
        NativeParam::Date(v) => query.bind(*v),
        NativeParam::Time(v) => query.bind(*v),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q NativeParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        NativeParam::Null => query.bind(None::<String>),
        NativeParam::Bool(v) => query.bind(*v),
        NativeParam::Int(v) => query.bind(*v),
        NativeParam::UInt(v) => query.bind(i64::try_from(*v).unwrap_or(i64::MAX)),
        NativeParam::Float(v) => query.bind(*v),
        NativeParam::Text(v) => query.bind(v.as_str()),
        NativeParam::Bytes(v) => query.bind(v.as_slice()),
        NativeParam::Timestamp(v) => query.bind(*v),
        NativeParam::Date(v) => query.bind(*v),
        NativeParam::Time(v) => query.bind(*v),
    }
}
