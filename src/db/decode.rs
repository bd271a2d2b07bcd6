//! Row to JSON conversion.
//!
//! Conversion runs in two phases: [`categorize_type`] classifies the column's
//! declared type, then a per-database decoder extracts the value. Values that
//! cannot be decoded become `null` and are logged rather than failing the
//! whole result.

use crate::models::DatabaseType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first since "numeric" also reads as a float
    if lower.contains("decimal") || lower.contains("numeric") {
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    // "interval" and "point" would otherwise match "int"
    if lower.contains("int") && !lower.contains("interval") && !lower.contains("point") {
        return TypeCategory::Integer;
    }
    if lower.contains("serial") || lower == "tiny" || lower == "year" {
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
    // SQLite stores temporal values as text; let the text decoder handle them
    if db != DatabaseType::SQLite {
        match lower.as_str() {
            "date" => return TypeCategory::Date,
            "time" => return TypeCategory::Time,
            "timestamptz" => return TypeCategory::TimestampTz,
            "timestamp" | "datetime" => {
                // MySQL TIMESTAMP is stored in UTC
                return if db == DatabaseType::MySQL && lower == "timestamp" {
                    TypeCategory::TimestampTz
                } else {
                    TypeCategory::Timestamp
                };
            }
            _ => {}
        }
    }
    TypeCategory::Text
}

/// Binary payloads are returned base64-encoded.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

// =============================================================================
// Decimal Support
// =============================================================================

/// DECIMAL/NUMERIC kept as its exact textual representation.
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
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        pg_numeric::decode(value).map(RawDecimal)
    }
}

/// PostgreSQL sends NUMERIC in binary as base-10000 digit groups.
mod pg_numeric {
    use sqlx::ValueRef;
    use sqlx::postgres::{PgValueFormat, PgValueRef};

    const SIGN_NEG: u16 = 0x4000;
    const SIGN_NAN: u16 = 0xC000;

    pub fn decode(value: PgValueRef<'_>) -> Result<String, sqlx::error::BoxDynError> {
        if value.format() == PgValueFormat::Text {
            return Ok(value.as_str()?.to_string());
        }
        let bytes = value.as_bytes()?;
        if value.is_null() || bytes.len() < 8 {
            return Err("invalid NUMERIC payload".into());
        }
        let read = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let ndigits = read(0) as usize;
        let weight = read(2) as i16 as i32;
        let sign = read(4);
        let dscale = read(6) as usize;
        if sign == SIGN_NAN {
            return Ok("NaN".to_string());
        }
        if bytes.len() < 8 + ndigits * 2 {
            return Err("truncated NUMERIC payload".into());
        }
        let digits: Vec<u16> = (0..ndigits).map(|i| read(8 + i * 2)).collect();

        let mut int_part = String::new();
        for pos in 0..=weight.max(0) {
            let group = if pos <= weight {
                digits.get(pos as usize).copied().unwrap_or(0)
            } else {
                0
            };
            if int_part.is_empty() {
                if group != 0 || pos == weight.max(0) {
                    int_part.push_str(&group.to_string());
                }
            } else {
                int_part.push_str(&format!("{group:04}"));
            }
        }
        if weight < 0 {
            int_part = "0".to_string();
        }

        let mut frac = String::new();
        let mut group_index = weight + 1;
        while frac.len() < dscale {
            let group = if group_index < 0 {
                0
            } else {
                digits.get(group_index as usize).copied().unwrap_or(0)
            };
            frac.push_str(&format!("{group:04}"));
            group_index += 1;
        }
        frac.truncate(dscale);

        let mut out = String::new();
        if sign == SIGN_NEG {
            out.push('-');
        }
        out.push_str(&int_part);
        if dscale > 0 {
            out.push('.');
            out.push_str(&frac);
        }
        Ok(out)
    }
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Convert a database row into a JSON object keyed by column name.
pub trait RowToJson {
    fn to_json(&self) -> JsonValue;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowToJson for $row {
            fn to_json(&self) -> JsonValue {
                let map: Map<String, JsonValue> = self
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $db);
                        (
                            col.name().to_string(),
                            $decoder(self, idx, type_name, category),
                        )
                    })
                    .collect();
                JsonValue::Object(map)
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

/// Decode `idx` as `T`, mapping NULL and decode failures to `null`.
fn get<'r, R, T>(row: &'r R, idx: usize, convert: impl FnOnce(T) -> JsonValue) -> JsonValue
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(Some(v)) => convert(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::warn!(column = idx, error = %e, "Failed to decode column");
            JsonValue::Null
        }
    }
}

/// Probe integer widths from narrowest to widest.
fn first_integer<'r, R>(row: &'r R, idx: usize) -> Option<JsonValue>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    i32: Decode<'r, R::Database> + Type<R::Database>,
    i16: Decode<'r, R::Database> + Type<R::Database>,
{
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return Some(v.map(JsonValue::from).unwrap_or(JsonValue::Null));
    }
    None
}

fn naive_timestamp(v: NaiveDateTime) -> JsonValue {
    v.format("%Y-%m-%dT%H:%M:%S%.f").to_string().into()
}

fn text_or_json(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => get::<_, RawDecimal>(row, idx, |v| JsonValue::String(v.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => get::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Float => get::<_, f64>(row, idx, float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx, |v| v),
            TypeCategory::Date => get::<_, NaiveDate>(row, idx, |v| v.to_string().into()),
            TypeCategory::Time => get::<_, NaiveTime>(row, idx, |v| v.to_string().into()),
            TypeCategory::Timestamp => get::<_, NaiveDateTime>(row, idx, naive_timestamp),
            TypeCategory::TimestampTz => {
                get::<_, DateTime<Utc>>(row, idx, |v| v.to_rfc3339().into())
            }
            TypeCategory::Text => decode_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Some(v) = first_integer(row, idx) {
            return v;
        }
        // BIGINT UNSIGNED and narrower unsigned columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        get::<_, i8>(row, idx, JsonValue::from)
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        match row.try_get::<Option<String>, _>(idx) {
            Ok(v) => v.map(|s| text_or_json(s, type_name)).unwrap_or(JsonValue::Null),
            // ENUM/SET/BIT and friends arrive as bytes
            Err(_) => get::<_, Vec<u8>>(row, idx, |bytes| match String::from_utf8(bytes) {
                Ok(s) => JsonValue::String(s),
                Err(e) => encode_binary(e.as_bytes()),
            }),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => get::<_, RawDecimal>(row, idx, |v| JsonValue::String(v.0)),
            TypeCategory::Integer => first_integer(row, idx).unwrap_or(JsonValue::Null),
            TypeCategory::Boolean => get::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Float => match row.try_get::<Option<f64>, _>(idx) {
                Ok(v) => v.map(float_value).unwrap_or(JsonValue::Null),
                Err(_) => get::<_, f32>(row, idx, |v| float_value(v as f64)),
            },
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            TypeCategory::Json => get::<_, JsonValue>(row, idx, |v| v),
            TypeCategory::Date => get::<_, NaiveDate>(row, idx, |v| v.to_string().into()),
            TypeCategory::Time => get::<_, NaiveTime>(row, idx, |v| v.to_string().into()),
            TypeCategory::Timestamp => get::<_, NaiveDateTime>(row, idx, naive_timestamp),
            TypeCategory::TimestampTz => {
                get::<_, DateTime<Utc>>(row, idx, |v| v.to_rfc3339().into())
            }
            TypeCategory::Text => decode_text(row, idx, type_name),
        }
    }

    fn decode_text(row: &PgRow, idx: usize, type_name: &str) -> JsonValue {
        if type_name.eq_ignore_ascii_case("uuid") {
            return get::<_, sqlx::types::Uuid>(row, idx, |v| v.to_string().into());
        }
        get::<_, String>(row, idx, JsonValue::String)
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Boolean => get::<_, bool>(row, idx, JsonValue::Bool),
            TypeCategory::Binary => get::<_, Vec<u8>>(row, idx, |v| encode_binary(&v)),
            _ => decode_dynamic(row, idx, type_name),
        }
    }

    /// SQLite columns are dynamically typed: the declared type is only an
    /// affinity, so decode by the storage class the value actually has.
    fn decode_dynamic(row: &SqliteRow, idx: usize, type_name: &str) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(float_value).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(|s| text_or_json(s, type_name)).unwrap_or(JsonValue::Null);
        }
        get::<_, Vec<u8>>(row, idx, |v| encode_binary(&v))
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
            categorize_type("INTEGER", DatabaseType::SQLite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            TypeCategory::Text
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
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::MySQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(encode_binary(b"hello world"), JsonValue::from("aGVsbG8gd29ybGQ="));
        assert_eq!(encode_binary(&[0xFF, 0xFE, 0x00, 0x01]), JsonValue::from("//4AAQ=="));
        assert_eq!(encode_binary(&[]), JsonValue::from(""));
    }

    #[test]
    fn test_float_value_non_finite() {
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
        assert_eq!(float_value(f64::NAN), JsonValue::from("NaN"));
    }

    #[tokio::test]
    async fn test_sqlite_row_to_json() {
        use sqlx::Connection;

        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE t (id INTEGER, name TEXT, score REAL, flag BOOLEAN, raw BLOB, note TEXT)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query("INSERT INTO t VALUES (1, 'ada', 9.5, 1, x'0102', NULL)")
            .execute(&mut conn)
            .await
            .unwrap();

        let row = sqlx::query("SELECT * FROM t").fetch_one(&mut conn).await.unwrap();
        assert_eq!(
            row.to_json(),
            serde_json::json!({
                "id": 1,
                "name": "ada",
                "score": 9.5,
                "flag": true,
                "raw": "AQI=",
                "note": null,
            })
        );

        let row = sqlx::query("SELECT 1 + 1 AS two, NULL AS nothing")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(row.to_json(), serde_json::json!({"two": 2, "nothing": null}));
    }
}
