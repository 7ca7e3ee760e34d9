//! Schema Enforcer - coerces records to exactly match a table schema
//!
//! The schema is authoritative: declared fields that are absent become null,
//! undeclared fields are dropped. A value that cannot be cast degrades to null
//! and never aborts the batch.

use crate::record::{Record, Value};
use crate::schema::{FieldSchema, FieldType, TableSchema};
use tracing::debug;

/// Enforce `schema` on every record
pub fn enforce(records: &[Record], schema: &TableSchema) -> Vec<Record> {
    records
        .iter()
        .map(|record| enforce_record(record, &schema.fields))
        .collect()
}

/// Enforce one level of fields on a record
pub fn enforce_record(record: &Record, fields: &[FieldSchema]) -> Record {
    let mut out = Record::with_capacity(fields.len());
    for field in fields {
        let value = match record.get_ignore_case(&field.name) {
            None | Some(Value::Null) => Value::Null,
            Some(value) => conform(value, field),
        };
        out.push(field.name.clone(), value);
    }
    out
}

fn conform(value: &Value, field: &FieldSchema) -> Value {
    match (field.field_type, value) {
        (FieldType::Record, Value::Record(record)) => {
            let nested = Value::Record(enforce_record(record, &field.fields));
            if field.is_repeated() {
                Value::List(vec![nested])
            } else {
                nested
            }
        }
        (FieldType::Record, Value::List(items)) => Value::List(conform_record_items(items, field)),
        (FieldType::Record, Value::Array(array)) => {
            Value::List(conform_record_items(&array.clone().into_nested(), field))
        }
        (FieldType::Record, scalar) => {
            let synthesized = Value::Record(synthesize_record(scalar, &field.fields));
            if field.is_repeated() {
                Value::List(vec![synthesized])
            } else {
                synthesized
            }
        }
        (FieldType::String, _) if field.is_repeated() => Value::List(
            as_elements(value)
                .into_iter()
                .filter_map(|item| item.to_text().map(Value::Text))
                .collect(),
        ),
        (FieldType::String, Value::Text(_)) => value.clone(),
        (FieldType::String, other) => other.to_text().map(Value::Text).unwrap_or(Value::Null),
        (_, _) if field.is_repeated() => Value::List(
            as_elements(value)
                .into_iter()
                .filter(|item| !item.is_null())
                .collect(),
        ),
        _ => value.clone(),
    }
}

fn conform_record_items(items: &[Value], field: &FieldSchema) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::Null => None,
            Value::Record(record) => Some(Value::Record(enforce_record(record, &field.fields))),
            scalar => Some(Value::Record(synthesize_record(scalar, &field.fields))),
        })
        .collect()
}

fn as_elements(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        Value::Array(array) => array.clone().into_nested(),
        other => vec![other.clone()],
    }
}

/// Build a record from a raw value by casting it into every child's type
fn synthesize_record(value: &Value, fields: &[FieldSchema]) -> Record {
    fields
        .iter()
        .map(|child| (child.name.clone(), cast_value(value, child)))
        .collect()
}

/// Best-effort cast of a raw value into a declared field; `Null` on failure
pub fn cast_value(value: &Value, field: &FieldSchema) -> Value {
    let cast = match field.field_type {
        FieldType::String => value.to_text().map(Value::Text),
        FieldType::Float => match value {
            Value::Int(i) => Some(Value::Float(*i as f64)),
            Value::Float(f) => Some(Value::Float(*f)),
            Value::Bool(b) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::Text(s) => s.trim().parse::<f64>().ok().map(Value::Float),
            _ => None,
        },
        FieldType::Integer => match value {
            Value::Int(i) => Some(Value::Int(*i)),
            Value::Float(f) if f.is_finite() => Some(Value::Int(f.trunc() as i64)),
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::Text(s) => s.trim().parse::<i64>().ok().map(Value::Int),
            _ => None,
        },
        FieldType::Boolean => Some(Value::Bool(truthy(value))),
        FieldType::Record => Some(Value::Record(synthesize_record(value, &field.fields))),
        FieldType::Numeric | FieldType::BigNumeric => match value {
            Value::Int(_) | Value::Float(_) => Some(value.clone()),
            Value::Text(s) => s.trim().parse::<f64>().ok().map(|_| Value::Text(s.trim().to_string())),
            _ => None,
        },
        FieldType::Json => Some(value.clone()),
        FieldType::Bytes
        | FieldType::Date
        | FieldType::Time
        | FieldType::Datetime
        | FieldType::Geography
        | FieldType::Interval
        | FieldType::Range => match value {
            Value::Record(_) | Value::List(_) | Value::Array(_) => None,
            scalar => Some(scalar.clone()),
        },
        FieldType::Timestamp => Some(value.clone()),
    };
    cast.unwrap_or_else(|| {
        if !value.is_null() {
            debug!("Cannot cast {} value to {} for '{}'", value.kind(), field.field_type, field.name);
        }
        Value::Null
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Text(s) => !s.is_empty(),
        Value::Timestamp(_) => true,
        Value::Record(r) => !r.is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::Array(a) => a.size() > 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(json: serde_json::Value) -> Record {
        Record::from_json(json).unwrap()
    }

    fn schema(json: serde_json::Value) -> TableSchema {
        TableSchema::from_json(json).unwrap()
    }

    #[test]
    fn test_repeated_string_elements_are_stringified() {
        let s = schema(json!([{"name": "tags", "type": "STRING", "mode": "REPEATED"}]));
        let out = enforce(&[record(json!({"tags": [1, 2]}))], &s);
        assert_eq!(out[0].to_json(), json!({"tags": ["1", "2"]}));

        let single = enforce(&[record(json!({"tags": "solo"}))], &s);
        assert_eq!(single[0].to_json(), json!({"tags": ["solo"]}));
    }

    #[test]
    fn test_field_set_matches_schema() {
        let s = schema(json!([
            {"name": "id", "type": "INTEGER"},
            {"name": "meta", "type": "RECORD", "fields": [
                {"name": "a", "type": "STRING"},
                {"name": "b", "type": "INTEGER"}
            ]},
            {"name": "missing", "type": "BOOLEAN"}
        ]));
        let out = enforce(&[record(json!({"id": 1, "extra": "x", "meta": {"a": "v", "z": 1}}))], &s);
        assert_eq!(
            out[0].to_json(),
            json!({"id": 1, "meta": {"a": "v", "b": null}, "missing": null})
        );
    }

    #[test]
    fn test_nulls_preserved_for_every_type() {
        let s = schema(json!([
            {"name": "s", "type": "STRING"},
            {"name": "r", "type": "RECORD", "fields": [{"name": "a", "type": "STRING"}]},
            {"name": "t", "type": "STRING", "mode": "REPEATED"}
        ]));
        let out = enforce(&[record(json!({"s": null, "r": null, "t": null}))], &s);
        assert!(out[0].iter().all(|(_, v)| v.is_null()));
    }

    #[test]
    fn test_scalar_synthesized_into_record() {
        let s = schema(json!([
            {"name": "price", "type": "RECORD", "fields": [
                {"name": "amount", "type": "FLOAT"},
                {"name": "label", "type": "STRING"},
                {"name": "units", "type": "INTEGER"}
            ]}
        ]));
        let out = enforce(&[record(json!({"price": "12.5"}))], &s);
        assert_eq!(
            out[0].to_json(),
            json!({"price": {"amount": 12.5, "label": "12.5", "units": null}})
        );
    }

    #[test]
    fn test_repeated_records_recurse() {
        let s = schema(json!([
            {"name": "lines", "type": "RECORD", "mode": "REPEATED", "fields": [
                {"name": "sku", "type": "STRING"}
            ]}
        ]));
        let out = enforce(&[record(json!({"lines": [{"sku": 7, "qty": 1}, null, {"sku": "b"}]}))], &s);
        assert_eq!(out[0].to_json(), json!({"lines": [{"sku": "7"}, {"sku": "b"}]}));
    }

    #[test]
    fn test_repeated_scalars_are_wrapped() {
        let s = schema(json!([
            {"name": "n", "type": "INTEGER", "mode": "REPEATED"},
            {"name": "f", "type": "FLOAT", "mode": "REPEATED"},
            {"name": "b", "type": "BOOLEAN", "mode": "REPEATED"}
        ]));
        let out = enforce(
            &[
                record(json!({"n": 5, "f": [1.5, null], "b": true})),
                record(json!({"n": [1, 2], "f": 2.5, "b": null})),
            ],
            &s,
        );
        assert_eq!(out[0].to_json(), json!({"n": [5], "f": [1.5], "b": [true]}));
        assert_eq!(out[1].to_json(), json!({"n": [1, 2], "f": [2.5], "b": null}));
    }

    #[test]
    fn test_fields_match_case_insensitively() {
        let s = schema(json!([{"name": "Id", "type": "INTEGER"}]));
        let out = enforce(&[record(json!({"Id": 1})), record(json!({"id": 2}))], &s);
        assert_eq!(out[1].to_json(), json!({"Id": 2}));
    }

    #[test]
    fn test_existing_table_types_pass_through() {
        let s = schema(json!([
            {"name": "d", "type": "DATE", "mode": "REQUIRED"},
            {"name": "amount", "type": "NUMERIC"},
            {"name": "doc", "type": "JSON"}
        ]));
        let out = enforce(&[record(json!({"d": "2024-03-01", "amount": "12.50", "doc": {"k": 1}}))], &s);
        assert_eq!(
            out[0].to_json(),
            json!({"d": "2024-03-01", "amount": "12.50", "doc": {"k": 1}})
        );
    }

    #[test]
    fn test_string_column_serializes_containers() {
        let s = schema(json!([
            {"name": "payload", "type": "STRING"},
            {"name": "count", "type": "STRING"},
            {"name": "n", "type": "INTEGER"}
        ]));
        let out = enforce(&[record(json!({"payload": {"k": [1]}, "count": 3, "n": "kept"}))], &s);
        assert_eq!(
            out[0].to_json(),
            json!({"payload": "{\"k\":[1]}", "count": "3", "n": "kept"})
        );
    }
}
