//! Row decoding into JSON maps.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies a column's declared type into a logical category
//! 2. Driver-specific decoders try the concrete Rust types for that category in order
//!
//! Values that cannot be decoded become `null` rather than failing the whole row.

use crate::models::{DatabaseType, JsonRow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Temporal,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked before floats since "numeric" overlaps
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores floats
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    // Before the "int" check: "interval" and "point" are neither
    if lower.contains("interval") || lower == "point" {
        return TypeCategory::Text;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    // SQLite has no temporal storage class; its values are plain text
    if db != DatabaseType::SQLite
        && (lower.starts_with("timestamp")
            || lower == "datetime"
            || lower == "date"
            || lower.starts_with("time"))
    {
        return TypeCategory::Temporal;
    }

    TypeCategory::Text
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// Keeps the exact database representation instead of rounding through f64.
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

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn binary_value(bytes: Vec<u8>) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Try each listed type in order; the first compatible one wins.
/// A NULL value short-circuits to `JsonValue::Null`.
macro_rules! decode_first {
    ($row:expr, $idx:expr, { $($ty:ty => $map:expr),+ $(,)? }) => {{
        let mut decoded: Option<JsonValue> = None;
        $(
            if decoded.is_none() {
                match $row.try_get::<Option<$ty>, _>($idx) {
                    Ok(Some(v)) => decoded = Some(($map)(v)),
                    Ok(None) => decoded = Some(JsonValue::Null),
                    Err(_) => {}
                }
            }
        )+
        decoded.unwrap_or(JsonValue::Null)
    }};
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_row(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::MySQL);
                (col.name().to_string(), mysql::decode_column(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name(), DatabaseType::PostgreSQL);
                (col.name().to_string(), postgres::decode_column(self, idx, category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_row(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::SQLite);
                (col.name().to_string(), sqlite::decode_column(self, idx, category))
            })
            .collect()
    }
}

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_first!(row, idx, {
                RawDecimal => |v: RawDecimal| JsonValue::String(v.0),
            }),
            TypeCategory::Integer => decode_first!(row, idx, {
                i64 => JsonValue::from,
                u64 => JsonValue::from,
                i32 => JsonValue::from,
                u32 => JsonValue::from,
                i16 => JsonValue::from,
                u16 => JsonValue::from,
                i8 => JsonValue::from,
                u8 => JsonValue::from,
            }),
            TypeCategory::Boolean => decode_first!(row, idx, { bool => JsonValue::Bool }),
            TypeCategory::Float => decode_first!(row, idx, {
                f64 => float_value,
                f32 => |v: f32| float_value(v.into()),
            }),
            TypeCategory::Binary => decode_first!(row, idx, { Vec<u8> => binary_value }),
            TypeCategory::Json => decode_first!(row, idx, { JsonValue => |v: JsonValue| v }),
            TypeCategory::Temporal => decode_first!(row, idx, {
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
                NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string()),
                NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string()),
                String => JsonValue::String,
            }),
            TypeCategory::Text => decode_first!(row, idx, {
                String => JsonValue::String,
                Vec<u8> => binary_value,
            }),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => decode_first!(row, idx, {
                RawDecimal => |v: RawDecimal| JsonValue::String(v.0),
            }),
            TypeCategory::Integer => decode_first!(row, idx, {
                i64 => JsonValue::from,
                i32 => JsonValue::from,
                i16 => JsonValue::from,
            }),
            TypeCategory::Boolean => decode_first!(row, idx, { bool => JsonValue::Bool }),
            TypeCategory::Float => decode_first!(row, idx, {
                f64 => float_value,
                f32 => |v: f32| float_value(v.into()),
            }),
            TypeCategory::Binary => decode_first!(row, idx, { Vec<u8> => binary_value }),
            TypeCategory::Json => decode_first!(row, idx, { JsonValue => |v: JsonValue| v }),
            TypeCategory::Temporal => decode_first!(row, idx, {
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
                NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string()),
                NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string()),
            }),
            TypeCategory::Text => decode_first!(row, idx, { String => JsonValue::String }),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => decode_first!(row, idx, {
                i64 => JsonValue::from,
                f64 => float_value,
                String => JsonValue::String,
            }),
            TypeCategory::Boolean => decode_first!(row, idx, { bool => JsonValue::Bool }),
            TypeCategory::Float | TypeCategory::Decimal => decode_first!(row, idx, {
                f64 => float_value,
                i64 => JsonValue::from,
            }),
            TypeCategory::Binary => decode_first!(row, idx, { Vec<u8> => binary_value }),
            // Expression columns report "NULL" as their declared type, so try
            // every storage class
            _ => decode_first!(row, idx, {
                i64 => JsonValue::from,
                f64 => float_value,
                String => JsonValue::String,
                Vec<u8> => binary_value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INT8", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTEGER", DatabaseType::SQLite),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySQL),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::PostgreSQL),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySQL),
            TypeCategory::Temporal
        );
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_categorize_type_misc() {
        assert_eq!(
            categorize_type("jsonb", DatabaseType::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("BYTEA", DatabaseType::PostgreSQL),
            TypeCategory::Binary
        );
        assert_eq!(
            categorize_type("BOOLEAN", DatabaseType::SQLite),
            TypeCategory::Boolean
        );
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySQL),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_non_finite_floats_become_strings() {
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
        assert_eq!(float_value(f64::NAN), JsonValue::String("NaN".to_string()));
    }

    #[test]
    fn test_binary_is_base64() {
        assert_eq!(
            binary_value(b"hello world".to_vec()),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
    }
}
