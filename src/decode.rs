//! Conversions between SQLite values and JSON

use base64::Engine;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Row, Sqlite, TypeInfo, Value, ValueRef};

use crate::Error;

/// A decoded row, keyed by column name in select order
pub type JsonRow = IndexMap<String, JsonValue>;

/// Convert a SQLite value to a JSON value.
///
/// BLOB values are returned as base64-encoded strings since JSON has no
/// native binary type. Dates and times stay in SQLite's text form.
pub fn to_json(value: SqliteValueRef) -> Result<JsonValue, Error> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let owned = value.to_owned();
   let type_name = value.type_info().name().to_string();

   let result = match type_name.as_str() {
      "INTEGER" | "NUMERIC" => owned.try_decode::<i64>().map(JsonValue::from).ok(),
      "BOOLEAN" => owned.try_decode::<bool>().map(JsonValue::Bool).ok(),
      "REAL" => owned.try_decode::<f64>().map(JsonValue::from).ok(),
      "BLOB" => owned
         .try_decode::<Vec<u8>>()
         .map(|blob| JsonValue::String(base64_encode(&blob)))
         .ok(),
      "TEXT" | "DATE" | "TIME" | "DATETIME" => owned.try_decode::<String>().map(JsonValue::String).ok(),
      "NULL" => Some(JsonValue::Null),
      // For unknown types, try to decode as text
      other => match owned.try_decode::<String>() {
         Ok(text) => Some(JsonValue::String(text)),
         Err(_) => {
            return Err(Error::UnsupportedDatatype(format!(
               "Unknown SQLite type: {other}"
            )));
         }
      },
   };

   Ok(result.unwrap_or(JsonValue::Null))
}

/// Decode every column of `row` into a [`JsonRow`].
pub fn decode_row(row: &SqliteRow) -> Result<JsonRow, Error> {
   let mut decoded = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let value = to_json(row.try_get_raw(i)?)?;
      decoded.insert(column.name().to_string(), value);
   }
   Ok(decoded)
}

pub(crate) fn decode_rows(rows: &[SqliteRow]) -> Result<Vec<JsonRow>, Error> {
   rows.iter().map(decode_row).collect()
}

/// Bind a JSON value to a query, preserving integer precision where possible.
///
/// Arrays and objects are bound as JSON text.
pub fn bind_value<'a>(
   query: Query<'a, Sqlite, SqliteArguments<'a>>,
   value: JsonValue,
) -> Query<'a, Sqlite, SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else {
            // u64 beyond i64::MAX and real numbers
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other @ (JsonValue::Array(_) | JsonValue::Object(_)) => query.bind(other),
   }
}

pub(crate) fn bind_all<'a>(
   query: Query<'a, Sqlite, SqliteArguments<'a>>,
   values: Vec<JsonValue>,
) -> Query<'a, Sqlite, SqliteArguments<'a>> {
   values.into_iter().fold(query, bind_value)
}

fn base64_encode(data: &[u8]) -> String {
   base64::engine::general_purpose::STANDARD.encode(data)
}
