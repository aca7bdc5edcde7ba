//! Value marshaling between host values and native driver values.
//!
//! # Architecture
//!
//! Outgoing arguments are narrowed by [`to_native`] into [`NativeParam`]s,
//! which the per-database binders in `params` hand to sqlx.
//!
//! Incoming rows use a two-phase approach:
//! 1. `TypeCategory` classifies the column's reported type name
//! 2. Database-specific decoders extract the value for that category
//!
//! SQL NULL is detected before classification, so every decoder only ever
//! sees non-null values. A column whose type has no category is an
//! `UnsupportedType` error; a decode failure is a `ConversionError`. Either
//! fails the whole row, and with it the whole call.

use crate::db::DatabaseType;
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row as SqlxRow, Type, TypeInfo, ValueRef};

// =============================================================================
// Outgoing Values
// =============================================================================

/// Argument value in the form the native drivers bind.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeParam {
    Null,
    Bool(bool),
    Int(i64),
    /// Only for unsigned values above `i64::MAX`.
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl NativeParam {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Timestamp(_) => "timestamp",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
        }
    }
}

/// -2^63 and 2^63, both exactly representable as f64.
const I64_MIN_AS_F64: f64 = -9_223_372_036_854_775_808.0;
const I64_END_AS_F64: f64 = 9_223_372_036_854_775_808.0;

/// Narrow a host value to the native argument form.
///
/// Integral floats inside the i64 range become integers, since hosts that
/// only have one number type hand every integer over as a float. Unsigned
/// values that fit an i64 become signed. Non-finite floats are rejected.
pub fn to_native(value: &Value) -> Result<NativeParam, String> {
    let param = match value {
        Value::Null => NativeParam::Null,
        Value::Bool(v) => NativeParam::Bool(*v),
        Value::Int(v) => NativeParam::Int(*v),
        Value::UInt(v) => i64::try_from(*v).map_or(NativeParam::UInt(*v), NativeParam::Int),
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(format!("non-finite float {} cannot be bound", v));
            }
            if v.fract() == 0.0 && (I64_MIN_AS_F64..I64_END_AS_F64).contains(v) {
                NativeParam::Int(*v as i64)
            } else {
                NativeParam::Float(*v)
            }
        }
        Value::Text(v) => NativeParam::Text(v.clone()),
        Value::Bytes(v) => NativeParam::Bytes(v.clone()),
        Value::Timestamp(v) => NativeParam::Timestamp(*v),
        Value::Date(v) => NativeParam::Date(*v),
        Value::Time(v) => NativeParam::Time(*v),
    };
    Ok(param)
}

/// Marshal statement arguments, reporting the 1-based position of the first
/// one that cannot be converted.
pub fn marshal_args(args: &[Value]) -> DbResult<Vec<NativeParam>> {
    args.iter()
        .enumerate()
        .map(|(idx, value)| {
            to_native(value).map_err(|message| DbError::invalid_argument(idx + 1, message))
        })
        .collect()
}

/// Check that every parameter can be bound by `db`.
///
/// MySQL is the only backend with unsigned 64-bit integers.
pub(crate) fn validate_params(db: DatabaseType, params: &[NativeParam]) -> DbResult<()> {
    if db == DatabaseType::MySql {
        return Ok(());
    }
    match params
        .iter()
        .position(|p| matches!(p, NativeParam::UInt(_)))
    {
        Some(idx) => Err(DbError::invalid_argument(
            idx + 1,
            format!("{} cannot bind integers above {}", db, i64::MAX),
        )),
        None => Ok(()),
    }
}

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    UnsignedInteger,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    /// Instant with a known zone
    Timestamp,
    /// Wall-clock date and time, taken as UTC
    DateTime,
    Date,
    Time,
    /// Result of a function returning nothing (PostgreSQL `void`)
    Void,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let upper = type_name.trim().to_ascii_uppercase();

    if let Some(base) = upper.strip_suffix(" UNSIGNED") {
        return match categorize_type(base, db) {
            TypeCategory::Integer => TypeCategory::UnsignedInteger,
            other => other,
        };
    }

    match upper.as_str() {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "INT2" | "INT4"
        | "INT8" | "YEAR" => TypeCategory::Integer,
        "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
            TypeCategory::Float
        }
        "DECIMAL" | "NUMERIC" => TypeCategory::Decimal,
        "BOOL" | "BOOLEAN" => TypeCategory::Boolean,
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" | "TINYTEXT" | "MEDIUMTEXT"
        | "LONGTEXT" | "ENUM" | "SET" | "UNKNOWN" => TypeCategory::Text,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BYTEA" => {
            TypeCategory::Binary
        }
        "JSON" | "JSONB" => TypeCategory::Json,
        "UUID" => TypeCategory::Uuid,
        "TIMESTAMPTZ" => TypeCategory::Timestamp,
        // MySQL TIMESTAMP is stored as UTC; Postgres TIMESTAMP has no zone
        "TIMESTAMP" if db == DatabaseType::MySql => TypeCategory::Timestamp,
        "TIMESTAMP" | "DATETIME" => TypeCategory::DateTime,
        "DATE" => TypeCategory::Date,
        "TIME" => TypeCategory::Time,
        "VOID" if db == DatabaseType::Postgres => TypeCategory::Void,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Raw MySQL DECIMAL value, kept as its exact decimal string.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Row Conversion
// =============================================================================

/// Convert a native row into a host [`Row`], column order preserved.
pub trait RowToValues {
    fn to_row(&self) -> DbResult<Row>;
}

fn get<'r, R, T>(row: &'r R, idx: usize, column: &str) -> DbResult<T>
where
    R: SqlxRow,
    T: Decode<'r, R::Database> + Type<R::Database>,
    usize: ColumnIndex<R>,
{
    row.try_get::<T, _>(idx)
        .map_err(|e| DbError::conversion(column, e.to_string()))
}

fn is_null_at<R>(row: &R, idx: usize, column: &str) -> DbResult<bool>
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
{
    row.try_get_raw(idx)
        .map(|raw| raw.is_null())
        .map_err(|e| DbError::conversion(column, e.to_string()))
}

fn convert_row<R>(
    row: &R,
    db: DatabaseType,
    decode: impl Fn(&R, usize, &str, &str, TypeCategory) -> DbResult<Value>,
) -> DbResult<Row>
where
    R: SqlxRow,
    usize: ColumnIndex<R>,
{
    let columns = row.columns();
    let mut out = Row::with_capacity(columns.len());
    for (idx, col) in columns.iter().enumerate() {
        let name = col.name();
        let value = if is_null_at(row, idx, name)? {
            Value::Null
        } else {
            let type_name = col.type_info().name();
            decode(row, idx, name, type_name, categorize_type(type_name, db))?
        };
        out.push(name, value);
    }
    Ok(out)
}

impl RowToValues for MySqlRow {
    fn to_row(&self) -> DbResult<Row> {
        convert_row(self, DatabaseType::MySql, mysql::decode_column)
    }
}

impl RowToValues for PgRow {
    fn to_row(&self) -> DbResult<Row> {
        convert_row(self, DatabaseType::Postgres, postgres::decode_column)
    }
}

impl RowToValues for SqliteRow {
    fn to_row(&self) -> DbResult<Row> {
        convert_row(self, DatabaseType::SQLite, sqlite::decode_column)
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        column: &str,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let value = match category {
            TypeCategory::Integer => decode_integer(row, idx, column)?,
            TypeCategory::UnsignedInteger => Value::from(get::<_, u64>(row, idx, column)?),
            TypeCategory::Float => decode_float(row, idx, column)?,
            TypeCategory::Decimal => Value::Text(get::<_, RawDecimal>(row, idx, column)?.0),
            TypeCategory::Boolean => Value::Bool(get(row, idx, column)?),
            TypeCategory::Text | TypeCategory::Uuid => Value::Text(get(row, idx, column)?),
            TypeCategory::Binary => Value::Bytes(get(row, idx, column)?),
            TypeCategory::Json => {
                Value::Text(get::<_, serde_json::Value>(row, idx, column)?.to_string())
            }
            TypeCategory::Timestamp => Value::Timestamp(get(row, idx, column)?),
            TypeCategory::DateTime => {
                Value::Timestamp(get::<_, NaiveDateTime>(row, idx, column)?.and_utc())
            }
            TypeCategory::Date => Value::Date(get(row, idx, column)?),
            TypeCategory::Time => Value::Time(get(row, idx, column)?),
            TypeCategory::Void => Value::Null,
            TypeCategory::Unknown => return Err(DbError::unsupported_type(column, type_name)),
        };
        Ok(value)
    }

    fn decode_integer(row: &MySqlRow, idx: usize, column: &str) -> DbResult<Value> {
        match row.try_get::<i64, _>(idx) {
            Ok(v) => Ok(Value::Int(v)),
            // YEAR and friends only decode as unsigned
            Err(first) => row
                .try_get::<u64, _>(idx)
                .map(Value::from)
                .map_err(|_| DbError::conversion(column, first.to_string())),
        }
    }

    fn decode_float(row: &MySqlRow, idx: usize, column: &str) -> DbResult<Value> {
        match row.try_get::<f64, _>(idx) {
            Ok(v) => Ok(Value::Float(v)),
            Err(first) => row
                .try_get::<f32, _>(idx)
                .map(|v| Value::Float(v.into()))
                .map_err(|_| DbError::conversion(column, first.to_string())),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::types::{BigDecimal, Uuid};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        column: &str,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let value = match category {
            TypeCategory::Integer => match type_name {
                "INT2" => Value::Int(get::<_, i16>(row, idx, column)?.into()),
                "INT4" => Value::Int(get::<_, i32>(row, idx, column)?.into()),
                _ => Value::Int(get(row, idx, column)?),
            },
            TypeCategory::Float => match type_name {
                "FLOAT4" => Value::Float(get::<_, f32>(row, idx, column)?.into()),
                _ => Value::Float(get(row, idx, column)?),
            },
            TypeCategory::Decimal => {
                Value::Text(get::<_, BigDecimal>(row, idx, column)?.to_string())
            }
            TypeCategory::Boolean => Value::Bool(get(row, idx, column)?),
            TypeCategory::Text => Value::Text(get(row, idx, column)?),
            TypeCategory::Binary => Value::Bytes(get(row, idx, column)?),
            TypeCategory::Json => {
                Value::Text(get::<_, serde_json::Value>(row, idx, column)?.to_string())
            }
            TypeCategory::Uuid => Value::Text(get::<_, Uuid>(row, idx, column)?.to_string()),
            TypeCategory::Timestamp => Value::Timestamp(get(row, idx, column)?),
            TypeCategory::DateTime => {
                Value::Timestamp(get::<_, NaiveDateTime>(row, idx, column)?.and_utc())
            }
            TypeCategory::Date => Value::Date(get(row, idx, column)?),
            TypeCategory::Time => Value::Time(get(row, idx, column)?),
            // the server sends an empty value, not NULL
            TypeCategory::Void => Value::Null,
            TypeCategory::UnsignedInteger | TypeCategory::Unknown => {
                return Err(DbError::unsupported_type(column, type_name));
            }
        };
        Ok(value)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        column: &str,
        type_name: &str,
        category: TypeCategory,
    ) -> DbResult<Value> {
        let value = match category {
            TypeCategory::Integer => Value::Int(get(row, idx, column)?),
            TypeCategory::Float => Value::Float(get(row, idx, column)?),
            TypeCategory::Boolean => Value::Bool(get(row, idx, column)?),
            TypeCategory::Text => Value::Text(get(row, idx, column)?),
            TypeCategory::Binary => Value::Bytes(get(row, idx, column)?),
            TypeCategory::DateTime | TypeCategory::Timestamp => decode_datetime(row, idx, column)?,
            TypeCategory::Date => Value::Date(get(row, idx, column)?),
            TypeCategory::Time => Value::Time(get(row, idx, column)?),
            // NUMERIC affinity and untyped expressions: go by what is stored
            _ => decode_storage_class(row, idx, column, type_name)?,
        };
        Ok(value)
    }

    fn decode_datetime(row: &SqliteRow, idx: usize, column: &str) -> DbResult<Value> {
        match row.try_get::<DateTime<Utc>, _>(idx) {
            Ok(v) => Ok(Value::Timestamp(v)),
            Err(first) => row
                .try_get::<NaiveDateTime, _>(idx)
                .map(|v| Value::Timestamp(v.and_utc()))
                .map_err(|_| DbError::conversion(column, first.to_string())),
        }
    }

    fn decode_storage_class(
        row: &SqliteRow,
        idx: usize,
        column: &str,
        type_name: &str,
    ) -> DbResult<Value> {
        let raw = row
            .try_get_raw(idx)
            .map_err(|e| DbError::conversion(column, e.to_string()))?;
        let storage = raw.type_info().name().to_string();

        match storage.as_str() {
            "INTEGER" => Ok(Value::Int(get(row, idx, column)?)),
            "REAL" => Ok(Value::Float(get(row, idx, column)?)),
            "TEXT" => Ok(Value::Text(get(row, idx, column)?)),
            "BLOB" => Ok(Value::Bytes(get(row, idx, column)?)),
            _ => Err(DbError::unsupported_type(column, type_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySql),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INT8", DatabaseType::Postgres),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTEGER", DatabaseType::SQLite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT UNSIGNED", DatabaseType::MySql),
            TypeCategory::UnsignedInteger
        );
    }

    #[test]
    fn test_categorize_type_is_not_substring_based() {
        // would match "int" by substring
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::Postgres),
            TypeCategory::Unknown
        );
        assert_eq!(
            categorize_type("POINT", DatabaseType::Postgres),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::Postgres),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::Postgres),
            TypeCategory::DateTime
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::MySql),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::DateTime
        );
        assert_eq!(
            categorize_type("DATE", DatabaseType::MySql),
            TypeCategory::Date
        );
    }

    #[test]
    fn test_categorize_type_misc() {
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::Postgres),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("jsonb", DatabaseType::Postgres),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("BYTEA", DatabaseType::Postgres),
            TypeCategory::Binary
        );
        assert_eq!(
            categorize_type("NULL", DatabaseType::SQLite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_void() {
        assert_eq!(
            categorize_type("VOID", DatabaseType::Postgres),
            TypeCategory::Void
        );
        // a SQLite column may be declared with any name; keep its data
        assert_eq!(
            categorize_type("void", DatabaseType::SQLite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_to_native_narrows_integral_floats() {
        assert_eq!(to_native(&Value::Float(2.0)).unwrap(), NativeParam::Int(2));
        assert_eq!(
            to_native(&Value::Float(2.5)).unwrap(),
            NativeParam::Float(2.5)
        );
        // 2^63 does not fit
        assert_eq!(
            to_native(&Value::Float(9_223_372_036_854_775_808.0)).unwrap(),
            NativeParam::Float(9_223_372_036_854_775_808.0)
        );
        assert_eq!(
            to_native(&Value::Float(-9_223_372_036_854_775_808.0)).unwrap(),
            NativeParam::Int(i64::MIN)
        );
    }

    #[test]
    fn test_to_native_unsigned() {
        assert_eq!(to_native(&Value::UInt(7)).unwrap(), NativeParam::Int(7));
        assert_eq!(
            to_native(&Value::UInt(u64::MAX)).unwrap(),
            NativeParam::UInt(u64::MAX)
        );
    }

    #[test]
    fn test_to_native_passthrough() {
        assert_eq!(to_native(&Value::Null).unwrap(), NativeParam::Null);
        assert_eq!(
            to_native(&Value::from("name-1")).unwrap(),
            NativeParam::Text("name-1".to_string())
        );
        assert_eq!(
            to_native(&Value::Bytes(vec![0, 1])).unwrap(),
            NativeParam::Bytes(vec![0, 1])
        );
    }

    #[test]
    fn test_marshal_args_reports_position() {
        let err = marshal_args(&[Value::Int(1), Value::Float(f64::NAN)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(matches!(err, DbError::InvalidArgument { position: 2, .. }));
    }

    #[test]
    fn test_validate_params_unsigned() {
        let params = [NativeParam::Int(1), NativeParam::UInt(u64::MAX)];
        assert!(validate_params(DatabaseType::MySql, &params).is_ok());

        let err = validate_params(DatabaseType::Postgres, &params).unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { position: 2, .. }));
        assert!(validate_params(DatabaseType::SQLite, &params).is_err());
    }
}
