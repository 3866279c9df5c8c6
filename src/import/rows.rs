//! Row materialisation: arrow record batches → column/value maps.
//!
//! A row group comes out of the parquet reader as arrow arrays; the importer
//! works on plain per-row maps so that predicate evaluation, JSON cleaning,
//! and primary-key dedupe stay independent of arrow. Arrays and objects are
//! stored in the exports as JSON text, so the only structured decode is the
//! configured JSON column list.

use std::collections::HashMap;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Date64Type, Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type,
    Int64Type, Int8Type, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, ArrayRef, BinaryViewArray, RecordBatch, StringViewArray};
use arrow_schema::{DataType, TimeUnit};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Columns whose textual content is JSON and must be decoded before insert.
pub const JSON_COLUMNS: &[&str] = &[
    "embeds",
    "mentions",
    "mentions_positions",
    "verified_addresses",
];

#[derive(Debug, Error)]
#[error("decode failed for column {column}: {message}")]
pub struct DecodeFailed {
    pub column: String,
    pub message: String,
}

/// One cell crossing the arrow → postgres boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Timestamp view of the value, accepting epoch-second integers (the v2
    /// exports carry some timestamps that way).
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Int(secs) => DateTime::from_timestamp(*secs, 0),
            _ => None,
        }
    }
}

pub type Row = HashMap<String, Value>;

fn decode_failed(column: &str, message: impl Into<String>) -> DecodeFailed {
    DecodeFailed {
        column: column.to_string(),
        message: message.into(),
    }
}

fn timestamp_value(column: &str, unit: &TimeUnit, raw: i64) -> Result<Value, DecodeFailed> {
    let ts = match unit {
        TimeUnit::Second => DateTime::from_timestamp(raw, 0),
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(raw),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(raw),
        TimeUnit::Nanosecond => DateTime::from_timestamp(
            raw.div_euclid(1_000_000_000),
            raw.rem_euclid(1_000_000_000) as u32,
        ),
    };
    ts.map(Value::Timestamp)
        .ok_or_else(|| decode_failed(column, format!("timestamp out of range: {raw}")))
}

fn cell_value(column: &str, array: &ArrayRef, row: usize) -> Result<Value, DecodeFailed> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),

        DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(row) as i64),
        DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(row) as i64),
        DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(row) as i64),
        DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(row) as i64),
        DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(row) as i64),
        DataType::UInt64 => {
            let raw = array.as_primitive::<UInt64Type>().value(row);
            i64::try_from(raw)
                .map(Value::Int)
                .map_err(|_| decode_failed(column, format!("uint64 out of range: {raw}")))?
        }

        DataType::Float32 => Value::Float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Decimal128(_, scale) => {
            let raw = array.as_primitive::<Decimal128Type>().value(row);
            Value::Float(raw as f64 / 10f64.powi(*scale as i32))
        }

        DataType::Utf8 => Value::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Utf8View => {
            let view = array
                .as_any()
                .downcast_ref::<StringViewArray>()
                .ok_or_else(|| decode_failed(column, "expected string view array"))?;
            Value::Text(view.value(row).to_string())
        }

        DataType::Binary => Value::Bytes(array.as_binary::<i32>().value(row).to_vec()),
        DataType::LargeBinary => Value::Bytes(array.as_binary::<i64>().value(row).to_vec()),
        DataType::BinaryView => {
            let view = array
                .as_any()
                .downcast_ref::<BinaryViewArray>()
                .ok_or_else(|| decode_failed(column, "expected binary view array"))?;
            Value::Bytes(view.value(row).to_vec())
        }

        DataType::Timestamp(unit, _tz) => {
            let raw = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
                TimeUnit::Millisecond => {
                    array.as_primitive::<TimestampMillisecondType>().value(row)
                }
                TimeUnit::Microsecond => {
                    array.as_primitive::<TimestampMicrosecondType>().value(row)
                }
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
            };
            timestamp_value(column, unit, raw)?
        }
        DataType::Date32 => {
            let days = array.as_primitive::<Date32Type>().value(row);
            timestamp_value(column, &TimeUnit::Second, days as i64 * 86_400)?
        }
        DataType::Date64 => {
            let millis = array.as_primitive::<Date64Type>().value(row);
            timestamp_value(column, &TimeUnit::Millisecond, millis)?
        }

        other => {
            return Err(decode_failed(
                column,
                format!("unsupported arrow type: {other:?}"),
            ))
        }
    };

    Ok(value)
}

/// Materialise a record batch into per-row maps.
pub fn materialize_batch(batch: &RecordBatch) -> Result<Vec<Row>, DecodeFailed> {
    let schema = batch.schema();
    let mut rows = Vec::with_capacity(batch.num_rows());

    for ri in 0..batch.num_rows() {
        let mut row = Row::with_capacity(batch.num_columns());
        for (ci, field) in schema.fields().iter().enumerate() {
            let value = cell_value(field.name(), batch.column(ci), ri)?;
            row.insert(field.name().to_string(), value);
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Decode the configured JSON columns in place. Text and bytes become
/// structured JSON; the first parse error aborts the group.
pub fn clean_json_columns(rows: &mut [Row]) -> Result<(), DecodeFailed> {
    for row in rows.iter_mut() {
        for &column in JSON_COLUMNS {
            let Some(value) = row.get_mut(column) else {
                continue;
            };
            let parsed = match value {
                Value::Text(text) => serde_json::from_str(text)
                    .map_err(|e| decode_failed(column, e.to_string()))?,
                Value::Bytes(bytes) => serde_json::from_slice(bytes)
                    .map_err(|e| decode_failed(column, e.to_string()))?,
                _ => continue,
            };
            *value = Value::Json(parsed);
        }
    }
    Ok(())
}

fn encode_key_part(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("n:"),
        Value::Bool(b) => out.push_str(if *b { "b:1" } else { "b:0" }),
        Value::Int(i) => {
            out.push_str("i:");
            out.push_str(&i.to_string());
        }
        Value::Float(f) => {
            out.push_str("f:");
            out.push_str(&f.to_bits().to_string());
        }
        Value::Text(s) => {
            out.push_str("t:");
            out.push_str(s);
        }
        Value::Bytes(b) => {
            out.push_str("y:");
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
        }
        Value::Timestamp(ts) => {
            out.push_str("ts:");
            out.push_str(&ts.timestamp_micros().to_string());
        }
        Value::Json(j) => {
            out.push_str("j:");
            out.push_str(&j.to_string());
        }
    }
}

fn pk_key(row: &Row, primary_key: &[String]) -> String {
    let mut key = String::new();
    for col in primary_key {
        encode_key_part(row.get(col).unwrap_or(&Value::Null), &mut key);
        key.push('\u{1f}');
    }
    key
}

/// Keep only the last row per primary-key tuple. A multi-row upsert cannot
/// touch the same key twice in one statement, so duplicates inside a row
/// group must collapse before insert. Returns the surviving rows and the
/// number dropped.
pub fn dedupe_last_by_pk(rows: Vec<Row>, primary_key: &[String]) -> (Vec<Row>, usize) {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut kept: Vec<Option<Row>> = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;

    for row in rows {
        let key = pk_key(&row, primary_key);
        match positions.get(&key) {
            Some(&at) => {
                kept[at] = Some(row);
                dropped += 1;
            }
            None => {
                positions.insert(key, kept.len());
                kept.push(Some(row));
            }
        }
    }

    (kept.into_iter().flatten().collect(), dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use arrow_array::{Int64Array, StringArray, TimestampMicrosecondArray};
    use arrow_schema::{Field, Schema};

    fn sample_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("text", DataType::Utf8, true),
            Field::new(
                "updated_at",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("hello"), None])),
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(1_000_000i64),
                    Some(2_000_000i64),
                ])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_materialize_batch() {
        let rows = materialize_batch(&sample_batch()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], Value::Int(1));
        assert_eq!(rows[0]["text"], Value::Text("hello".to_string()));
        assert_eq!(rows[1]["text"], Value::Null);

        let ts = rows[0]["updated_at"].as_timestamp().unwrap();
        assert_eq!(ts.timestamp(), 1);
    }

    #[test]
    fn test_as_timestamp_accepts_epoch_ints() {
        let ts = Value::Int(500).as_timestamp().unwrap();
        assert_eq!(ts.timestamp(), 500);
        assert!(Value::Text("nope".to_string()).as_timestamp().is_none());
    }

    #[test]
    fn test_clean_json_columns() {
        let mut rows = vec![Row::from([
            ("embeds".to_string(), Value::Text("[{\"url\":\"x\"}]".to_string())),
            ("other".to_string(), Value::Text("not json".to_string())),
        ])];
        clean_json_columns(&mut rows).unwrap();

        assert!(matches!(rows[0]["embeds"], Value::Json(_)));
        // Non-JSON columns are left alone.
        assert_eq!(rows[0]["other"], Value::Text("not json".to_string()));
    }

    #[test]
    fn test_clean_json_columns_reports_column() {
        let mut rows = vec![Row::from([(
            "mentions".to_string(),
            Value::Text("{broken".to_string()),
        )])];
        let err = clean_json_columns(&mut rows).unwrap_err();
        assert_eq!(err.column, "mentions");
    }

    #[test]
    fn test_dedupe_last_wins() {
        let pk = vec!["id".to_string()];
        let rows = vec![
            Row::from([
                ("id".to_string(), Value::Int(1)),
                ("v".to_string(), Value::Text("old".to_string())),
            ]),
            Row::from([
                ("id".to_string(), Value::Int(2)),
                ("v".to_string(), Value::Text("only".to_string())),
            ]),
            Row::from([
                ("id".to_string(), Value::Int(1)),
                ("v".to_string(), Value::Text("new".to_string())),
            ]),
        ];

        let (kept, dropped) = dedupe_last_by_pk(rows, &pk);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        let one = kept.iter().find(|r| r["id"] == Value::Int(1)).unwrap();
        assert_eq!(one["v"], Value::Text("new".to_string()));
    }

    #[test]
    fn test_dedupe_composite_key_no_false_collisions() {
        let pk = vec!["a".to_string(), "b".to_string()];
        let rows = vec![
            Row::from([
                ("a".to_string(), Value::Text("x".to_string())),
                ("b".to_string(), Value::Text("y".to_string())),
            ]),
            Row::from([
                ("a".to_string(), Value::Text("xy".to_string())),
                ("b".to_string(), Value::Text("".to_string())),
            ]),
        ];
        let (kept, dropped) = dedupe_last_by_pk(rows, &pk);
        assert_eq!(dropped, 0);
        assert_eq!(kept.len(), 2);
    }
}
