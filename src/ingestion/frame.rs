//! DataFrame ingestion - polars frames as records
//!
//! Column names are made warehouse-safe first; list columns become `Array`
//! values and temporal columns become timestamps, so the normalizer sees the
//! same shapes it sees for JSON payloads.

use crate::error::Result;
use crate::record::{NdArray, Record, Value};
use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;

lazy_static! {
    static ref SEPARATORS: Regex = Regex::new(r"[-\s/]").expect("valid separator pattern");
    static ref ILLEGAL: Regex = Regex::new(r"[^a-zA-Z0-9_]").expect("valid illegal-character pattern");
}

/// Warehouse-safe column name: `#` -> `Number`, separators -> `_`, everything else non-alphanumeric dropped
pub fn clean_column_name(name: &str) -> String {
    let name = name.replace('#', "Number");
    let name = SEPARATORS.replace_all(&name, "_");
    ILLEGAL.replace_all(&name, "").into_owned()
}

/// One record per row, columns in frame order
pub fn dataframe_to_records(frame: &DataFrame) -> Result<Vec<Record>> {
    let columns = frame.get_columns();
    let names: Vec<String> = columns.iter().map(|s| clean_column_name(s.name())).collect();
    let mut records = Vec::with_capacity(frame.height());
    for row in 0..frame.height() {
        let mut record = Record::with_capacity(columns.len());
        for (series, name) in columns.iter().zip(&names) {
            record.push(name.clone(), any_value_to_value(series.get(row)?)?);
        }
        records.push(record);
    }
    Ok(records)
}

fn any_value_to_value(value: AnyValue<'_>) -> Result<Value> {
    Ok(match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::Text(s.to_string()),
        AnyValue::StringOwned(s) => Value::Text(s.to_string()),
        AnyValue::Int32(i) => Value::Int(i64::from(i)),
        AnyValue::Int64(i) => Value::Int(i),
        AnyValue::UInt32(i) => Value::Int(i64::from(i)),
        AnyValue::UInt64(i) => i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64)),
        AnyValue::Float32(f) => Value::Float(f64::from(f)),
        AnyValue::Float64(f) => Value::Float(f),
        AnyValue::Date(days) => NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Value::Timestamp(dt.and_utc()))
            .unwrap_or(Value::Null),
        AnyValue::Datetime(v, unit, _) => datetime_value(v, unit),
        AnyValue::List(series) => {
            let mut items = Vec::with_capacity(series.len());
            for idx in 0..series.len() {
                items.push(any_value_to_value(series.get(idx)?)?);
            }
            Value::Array(NdArray::from_vec(items))
        }
        other => Value::Text(other.to_string()),
    })
}

// 1970-01-01 counted from 0001-01-01 (day 1)
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn datetime_value(v: i64, unit: TimeUnit) -> Value {
    let (per_second, nanos_per_unit) = match unit {
        TimeUnit::Nanoseconds => (1_000_000_000, 1),
        TimeUnit::Microseconds => (1_000_000, 1_000),
        TimeUnit::Milliseconds => (1_000, 1_000_000),
    };
    let secs = v.div_euclid(per_second);
    let nanos = (v.rem_euclid(per_second) * nanos_per_unit) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(Value::Timestamp)
        .unwrap_or(Value::Null)
}
