//! Schema Inference - Deterministic schema detection from normalized records

use crate::record::{Record, Value};
use crate::schema::{FieldMode, FieldSchema, FieldType, TableSchema};
use itertools::Itertools;
use tracing::{debug, info};

/// What has been observed for a field so far
#[derive(Clone, Copy, Debug, PartialEq)]
enum Observed {
    /// Only nulls
    Nothing,
    Scalar(FieldType),
    Record,
}

/// Accumulated shape of one field across the sample
#[derive(Clone, Debug)]
struct FieldShape {
    name: String,
    observed: Observed,
    repeated: bool,
    children: Vec<FieldShape>,
}

impl FieldShape {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            observed: Observed::Nothing,
            repeated: false,
            children: Vec::new(),
        }
    }

    fn observe(&mut self, value: &Value) {
        match value {
            Value::List(items) => {
                self.repeated = true;
                items.iter().for_each(|item| self.observe_element(item));
            }
            Value::Array(array) if array.ndim() > 0 => {
                self.repeated = true;
                array.items().iter().for_each(|item| self.observe_element(item));
            }
            other => self.observe_element(other),
        }
    }

    // Nested lists are flattened into the element type.
    fn observe_element(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Bool(_) => self.observe_scalar(FieldType::Boolean),
            Value::Int(_) => self.observe_scalar(FieldType::Integer),
            Value::Float(_) => self.observe_scalar(FieldType::Float),
            Value::Text(_) => self.observe_scalar(FieldType::String),
            Value::Timestamp(_) => self.observe_scalar(FieldType::Timestamp),
            Value::Record(record) => {
                self.observed = Observed::Record;
                observe_record(&mut self.children, record);
            }
            Value::List(items) => items.iter().for_each(|item| self.observe_element(item)),
            Value::Array(array) => array.items().iter().for_each(|item| self.observe_element(item)),
        }
    }

    fn observe_scalar(&mut self, field_type: FieldType) {
        self.observed = match self.observed {
            Observed::Nothing => Observed::Scalar(field_type),
            Observed::Scalar(prev) if prev == field_type => Observed::Scalar(prev),
            Observed::Scalar(_) => Observed::Scalar(FieldType::String),
            Observed::Record => Observed::Record,
        };
    }

    fn finish(&self, forced_type: Option<FieldType>) -> FieldSchema {
        let mode = if self.repeated {
            FieldMode::Repeated
        } else {
            FieldMode::Nullable
        };
        let leaf = |t: FieldType| forced_type.unwrap_or(t);
        let mut field = match self.observed {
            Observed::Record if !self.children.is_empty() => FieldSchema::record(
                self.name.clone(),
                self.children.iter().map(|c| c.finish(forced_type)).collect(),
            ),
            Observed::Record | Observed::Nothing => FieldSchema::new(self.name.clone(), leaf(FieldType::String)),
            Observed::Scalar(t) => FieldSchema::new(self.name.clone(), leaf(t)),
        };
        field.mode = mode;
        field
    }
}

fn observe_record(shapes: &mut Vec<FieldShape>, record: &Record) {
    for (name, value) in record.iter() {
        // first-seen spelling wins
        let idx = match shapes.iter().position(|s| s.name.eq_ignore_ascii_case(name)) {
            Some(idx) => idx,
            None => {
                shapes.push(FieldShape::new(name));
                shapes.len() - 1
            }
        };
        shapes[idx].observe(value);
    }
}

/// Schema Inference Engine
#[derive(Clone, Debug, Default)]
pub struct SchemaInference {
    forced_type: Option<FieldType>,
}

impl SchemaInference {
    pub fn new() -> Self {
        Self { forced_type: None }
    }

    /// Override every inferred scalar leaf with one type
    pub fn with_forced_type(forced_type: Option<FieldType>) -> Self {
        Self { forced_type }
    }

    /// Minimal schema able to represent every record, in first-seen field order
    pub fn infer(&self, records: &[Record]) -> TableSchema {
        let mut shapes: Vec<FieldShape> = Vec::new();
        for record in records {
            observe_record(&mut shapes, record);
        }
        let schema = TableSchema::new(shapes.iter().map(|s| s.finish(self.forced_type)).collect());
        debug!(
            "Inferred {} field(s) from {} record(s): {}",
            schema.len(),
            records.len(),
            schema.names().iter().join(", ")
        );
        schema
    }

    /// Superset of both schemas; conflicting types widen to STRING
    pub fn merge(&self, existing: &TableSchema, incoming: &TableSchema) -> TableSchema {
        TableSchema::new(merge_fields(&existing.fields, &incoming.fields))
    }

    /// Merge `existing` with the schema inferred from `records`
    pub fn widen(&self, existing: &TableSchema, records: &[Record]) -> TableSchema {
        let widened = self.merge(existing, &self.infer(records));
        let added: Vec<&str> = widened
            .names()
            .into_iter()
            .filter(|name| !existing.contains(name))
            .collect();
        info!(
            "🧩 Widened schema: {} -> {} field(s){}",
            existing.len(),
            widened.len(),
            if added.is_empty() {
                String::new()
            } else {
                format!(", added [{}]", added.iter().join(", "))
            }
        );
        widened
    }
}

fn merge_fields(existing: &[FieldSchema], incoming: &[FieldSchema]) -> Vec<FieldSchema> {
    let mut merged = existing.to_vec();
    for field in incoming {
        // column names are case-insensitive in the warehouse
        match merged
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(&field.name))
        {
            Some(current) => merge_field(current, field),
            None => merged.push(field.clone()),
        }
    }
    merged
}

fn merge_field(current: &mut FieldSchema, incoming: &FieldSchema) {
    if incoming.is_repeated() {
        current.mode = FieldMode::Repeated;
    }
    match (current.field_type, incoming.field_type) {
        (FieldType::Record, FieldType::Record) => {
            current.fields = merge_fields(&current.fields, &incoming.fields);
        }
        (a, b) if a == b => {}
        // values of these types are only ever seen as text or numbers
        (existing, _) if !existing.is_inferable() => {}
        _ => {
            current.field_type = FieldType::String;
            current.fields.clear();
        }
    }
}
