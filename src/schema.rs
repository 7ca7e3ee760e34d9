//! Table Schema - column/type/nesting contract a load batch must conform to

use crate::error::{LoadError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Column type
///
/// Inference only produces STRING, INTEGER, FLOAT, BOOLEAN, TIMESTAMP and
/// RECORD. The rest exist so that schemas read from existing tables are
/// written back with the types they were read with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    BigNumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Json,
    Interval,
    Range,
    Record,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Datetime => "DATETIME",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
            FieldType::Interval => "INTERVAL",
            FieldType::Range => "RANGE",
            FieldType::Record => "RECORD",
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::Record)
    }

    /// Types schema inference can produce from raw values
    pub fn is_inferable(&self) -> bool {
        matches!(
            self,
            FieldType::String
                | FieldType::Integer
                | FieldType::Float
                | FieldType::Boolean
                | FieldType::Timestamp
                | FieldType::Record
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = LoadError;

    /// Accepts the warehouse's legacy and standard-SQL spellings.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => Ok(FieldType::String),
            "BYTES" => Ok(FieldType::Bytes),
            "INTEGER" | "INT64" => Ok(FieldType::Integer),
            "FLOAT" | "FLOAT64" => Ok(FieldType::Float),
            "NUMERIC" | "DECIMAL" => Ok(FieldType::Numeric),
            "BIGNUMERIC" | "BIGDECIMAL" => Ok(FieldType::BigNumeric),
            "BOOLEAN" | "BOOL" => Ok(FieldType::Boolean),
            "TIMESTAMP" => Ok(FieldType::Timestamp),
            "DATE" => Ok(FieldType::Date),
            "TIME" => Ok(FieldType::Time),
            "DATETIME" => Ok(FieldType::Datetime),
            "GEOGRAPHY" => Ok(FieldType::Geography),
            "JSON" => Ok(FieldType::Json),
            "INTERVAL" => Ok(FieldType::Interval),
            "RANGE" => Ok(FieldType::Range),
            "RECORD" | "STRUCT" => Ok(FieldType::Record),
            other => Err(LoadError::Schema(format!("unsupported field type '{}'", other))),
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Column mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldMode {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NULLABLE" | "" => Ok(FieldMode::Nullable),
            "REQUIRED" => Ok(FieldMode::Required),
            "REPEATED" => Ok(FieldMode::Repeated),
            other => Err(LoadError::Schema(format!("unsupported field mode '{}'", other))),
        }
    }
}

impl Serialize for FieldMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One column, possibly nested
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub mode: FieldMode,

    /// Children, non-empty only for RECORD
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,

    /// Attributes carried through untouched (description, precision, policy tags, ...)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn record(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Record,
            mode: FieldMode::Nullable,
            fields,
            extra: serde_json::Map::new(),
        }
    }

    pub fn repeated(mut self) -> Self {
        self.mode = FieldMode::Repeated;
        self
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }

    pub fn is_record(&self) -> bool {
        self.field_type == FieldType::Record
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Ordered sequence of columns
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter()
    }

    /// Check RECORD children and per-level name uniqueness (case-insensitive)
    pub fn validate(&self) -> Result<()> {
        validate_level(&self.fields, "")
    }

    /// Parse the warehouse's JSON schema shape: either `{"fields": [...]}` or a bare array
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let schema = match json {
            serde_json::Value::Array(_) => TableSchema::new(serde_json::from_value(json)?),
            other => serde_json::from_value(other)?,
        };
        schema.validate()?;
        Ok(schema)
    }
}

fn validate_level(fields: &[FieldSchema], path: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        let full = if path.is_empty() {
            field.name.clone()
        } else {
            format!("{}.{}", path, field.name)
        };
        if !seen.insert(field.name.to_ascii_lowercase()) {
            return Err(LoadError::Schema(format!("duplicate field '{}'", full)));
        }
        match (field.field_type, field.fields.is_empty()) {
            (FieldType::Record, true) => {
                return Err(LoadError::Schema(format!("RECORD field '{}' has no children", full)));
            }
            (FieldType::Record, false) => validate_level(&field.fields, &full)?,
            (_, false) => {
                return Err(LoadError::Schema(format!(
                    "{} field '{}' cannot have children",
                    field.field_type, full
                )));
            }
            (_, true) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_warehouse_schema_json() {
        let schema = TableSchema::from_json(json!({
            "fields": [
                {"name": "id", "type": "INT64", "mode": "REQUIRED"},
                {"name": "tags", "type": "STRING", "mode": "REPEATED"},
                {"name": "meta", "type": "STRUCT", "fields": [
                    {"name": "source", "type": "STRING"}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(schema.names(), vec!["id", "tags", "meta"]);
        assert_eq!(schema.fields[0].field_type, FieldType::Integer);
        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert!(schema.fields[1].is_repeated());
        assert_eq!(schema.fields[2].field("source").unwrap().field_type, FieldType::String);
    }

    #[test]
    fn test_serializes_without_empty_children() {
        let schema = TableSchema::new(vec![FieldSchema::new("x", FieldType::Float)]);
        assert_eq!(
            serde_json::to_value(&schema).unwrap(),
            json!({"fields": [{"name": "x", "type": "FLOAT", "mode": "NULLABLE"}]})
        );
    }

    #[test]
    fn test_validate_rejects_broken_schemas() {
        let empty_record = TableSchema::new(vec![FieldSchema::record("r", vec![])]);
        assert!(empty_record.validate().is_err());

        let duplicate = TableSchema::new(vec![
            FieldSchema::new("a", FieldType::String),
            FieldSchema::new("a", FieldType::Integer),
        ]);
        assert!(duplicate.validate().is_err());

        let case_duplicate = TableSchema::new(vec![
            FieldSchema::new("Id", FieldType::Integer),
            FieldSchema::new("id", FieldType::Integer),
        ]);
        assert!(case_duplicate.validate().is_err());

        assert!("VECTOR".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_existing_table_schema_written_back_unchanged() {
        let raw = json!({
            "fields": [
                {"name": "d", "type": "DATE", "mode": "REQUIRED", "description": "order day"},
                {"name": "n", "type": "NUMERIC", "mode": "NULLABLE", "precision": "10", "scale": "2"},
                {"name": "blob", "type": "BYTES", "mode": "NULLABLE"},
                {"name": "geo", "type": "GEOGRAPHY", "mode": "NULLABLE"},
                {"name": "doc", "type": "JSON", "mode": "NULLABLE"},
                {"name": "at", "type": "DATETIME", "mode": "NULLABLE"},
                {"name": "meta", "type": "RECORD", "mode": "REPEATED", "fields": [
                    {"name": "t", "type": "TIME", "mode": "REQUIRED"}
                ]}
            ]
        });
        let schema = TableSchema::from_json(raw.clone()).unwrap();
        assert_eq!(schema.fields[0].field_type, FieldType::Date);
        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert_eq!(schema.fields[1].field_type, FieldType::Numeric);
        assert_eq!(schema.fields[2].field_type, FieldType::Bytes);
        assert_eq!(serde_json::to_value(&schema).unwrap(), raw);
    }
}
