//! Translation between internal records and the remote wire shape.
//!
//! Remote rows use snake_case column names, ISO-8601 timestamps and carry
//! `label_ids` as a serialized JSON array. Internal records use camelCase
//! fields, epoch-millisecond timestamps and a sorted JSON array of ids. Every
//! value that enters the crate, whether from the remote backend or from a UI
//! mutation payload, passes through [`normalize_value`] so that watermark and
//! dirty comparisons always operate on one representation.
//!
//! Numeric timestamps are read as epoch milliseconds.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::record::{Fields, Record, Timestamp};
use crate::registry::{Column, ColumnKind, Table};

/// Normalize one field value to its internal representation.
pub fn normalize_value(column: &Column, value: &Value) -> Result<Value, StoreError> {
    if value.is_null() {
        if column.kind == ColumnKind::IdList {
            return Ok(Value::Array(Vec::new()));
        }
        return Ok(Value::Null);
    }
    let invalid = || {
        StoreError::validation(format!(
            "invalid value {value} for {} ({:?})",
            column.field, column.kind
        ))
    };
    match column.kind {
        ColumnKind::Text => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(invalid()),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) => n.as_i64().map(Value::from).ok_or_else(invalid),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        ColumnKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        ColumnKind::Timestamp => parse_timestamp(value)
            .map(|ts| ts.map(Value::from).unwrap_or(Value::Null))
            .map_err(|_| invalid()),
        ColumnKind::IdList => parse_id_list(value).map(id_list_value).map_err(|_| invalid()),
    }
}

/// Parse a timestamp given as epoch milliseconds (number or numeric string)
/// or as an ISO-8601 / RFC 3339 string. Naive date-times are taken as UTC and
/// bare dates as midnight UTC.
pub fn parse_timestamp(value: &Value) -> Result<Option<Timestamp>, StoreError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                Ok(Some(ms))
            } else if let Some(ms) = n.as_f64() {
                Ok(Some(ms.round() as i64))
            } else {
                Err(StoreError::validation(format!("timestamp out of range: {n}")))
            }
        }
        Value::String(s) => parse_timestamp_str(s).map(Some),
        other => Err(StoreError::validation(format!("not a timestamp: {other}"))),
    }
}

fn parse_timestamp_str(s: &str) -> Result<Timestamp, StoreError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    // Postgres timestamptz text output: "2024-05-01 10:00:00+00"
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.timestamp_millis());
    }
    if let Some(midnight) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc().timestamp_millis());
    }
    Err(StoreError::validation(format!("unparseable timestamp {s:?}")))
}

/// Format epoch milliseconds as an RFC 3339 UTC string with millisecond
/// precision.
pub fn format_timestamp(ms: Timestamp) -> Result<String, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| StoreError::validation(format!("timestamp out of range: {ms}")))
}

/// Parse a set of ids from a JSON array, or from a string holding a
/// serialized JSON array. Duplicates collapse; order is not significant.
pub fn parse_id_list(value: &Value) -> Result<BTreeSet<String>, StoreError> {
    match value {
        Value::Null => Ok(BTreeSet::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(StoreError::validation(format!("not an id: {other}"))),
            })
            .collect(),
        Value::String(s) if s.trim().is_empty() => Ok(BTreeSet::new()),
        Value::String(s) => {
            let inner: Value = serde_json::from_str(s)?;
            match inner {
                Value::Array(_) => parse_id_list(&inner),
                other => Err(StoreError::validation(format!(
                    "expected a JSON array of ids, got {other}"
                ))),
            }
        }
        other => Err(StoreError::validation(format!("not an id list: {other}"))),
    }
}

fn id_list_value(ids: BTreeSet<String>) -> Value {
    Value::Array(ids.into_iter().map(Value::String).collect())
}

/// Encode one normalized internal value for the wire.
fn encode_value(column: &Column, value: &Value) -> Result<Value, StoreError> {
    match column.kind {
        ColumnKind::Timestamp => match value.as_i64() {
            Some(ms) => format_timestamp(ms).map(Value::String),
            None => Ok(Value::Null),
        },
        ColumnKind::IdList => {
            let ids: Vec<String> = parse_id_list(value)?.into_iter().collect();
            Ok(Value::String(serde_json::to_string(&ids)?))
        }
        _ => Ok(value.clone()),
    }
}

/// Encode an internal record (or patch) as a snake_case wire row. Local-only
/// fields and fields outside the schema are dropped.
pub fn to_wire(table: Table, fields: &Fields) -> Result<Map<String, Value>, StoreError> {
    let meta = table.meta();
    let mut row = Map::new();
    for (field, value) in fields {
        let Some(column) = meta.field(field) else {
            log::debug!("Dropping unknown field {field} on {table}");
            continue;
        };
        if column.local_only {
            continue;
        }
        let normalized = normalize_value(column, value)?;
        row.insert(column.column.to_string(), encode_value(column, &normalized)?);
    }
    Ok(row)
}

/// Decode a wire row into a canonical internal record. Unknown columns are
/// ignored; absent columns become nulls.
pub fn from_wire(table: Table, row: &Value) -> Result<Record, StoreError> {
    let Value::Object(row) = row else {
        return Err(StoreError::validation(format!(
            "expected a {table} row object, got {row}"
        )));
    };
    let meta = table.meta();
    let mut fields = Fields::new();
    for (name, value) in row {
        match meta.column(name) {
            Some(column) if !column.local_only => {
                fields.insert(column.field.to_string(), value.clone());
            }
            _ => log::debug!("Ignoring remote column {name} on {table}"),
        }
    }
    meta.canonicalize(&fields)
}
