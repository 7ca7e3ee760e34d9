//! Record Normalizer - deterministic pre-load cleanup
//!
//! Strips duplicate and illegal field names and canonicalizes timestamps,
//! numeric and container values into load-ready scalars. Pure and total.

use crate::record::{iso_timestamp, NdArray, Record, Value};
use std::collections::HashSet;
use tracing::debug;

/// Field coerced to an integer unless the platform is exempt
pub const VERSION_FIELD: &str = "version";

/// Platforms whose `version` field is an opaque string
pub const VERSION_EXEMPT_PLATFORMS: [&str; 2] = ["masonhub", "shopify"];

/// Record Normalizer
#[derive(Clone, Debug, Default)]
pub struct RecordNormalizer {
    platform: Option<String>,
}

impl RecordNormalizer {
    pub fn new(platform: Option<&str>) -> Self {
        Self {
            platform: platform.map(|p| p.to_string()),
        }
    }

    pub fn normalize(&self, records: &[Record]) -> Vec<Record> {
        records.iter().map(|r| self.normalize_record(r)).collect()
    }

    /// Clean names, drop case-insensitive duplicates and canonicalize values
    pub fn normalize_record(&self, record: &Record) -> Record {
        let mut out = Record::with_capacity(record.len());
        let mut seen = HashSet::new();
        for (name, value) in record.iter() {
            let cleaned = clean_field_name(name);
            if !seen.insert(cleaned.to_lowercase()) {
                debug!("Dropping duplicate field '{}'", name);
                continue;
            }
            let value = self.canonicalize(&cleaned, value);
            out.push(cleaned, value);
        }
        out
    }

    fn coerces_version(&self, name: &str) -> bool {
        name == VERSION_FIELD
            && !self
                .platform
                .as_deref()
                .map(|p| VERSION_EXEMPT_PLATFORMS.contains(&p))
                .unwrap_or(false)
    }

    fn canonicalize(&self, name: &str, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        if self.coerces_version(name) {
            if let Some(version) = version_number(value) {
                return Value::Int(version);
            }
        }

        match value {
            Value::Timestamp(t) => Value::Text(iso_timestamp(t)),
            Value::Record(r) if r.is_empty() => Value::Null,
            Value::Record(r) => Value::Record(self.normalize_record(r)),
            Value::Array(array) => self.canonicalize_array(array),
            Value::List(items) => {
                if items.is_empty() || (items.len() == 1 && items[0].is_empty_record()) {
                    Value::Null
                } else if items.iter().all(Value::is_record) {
                    Value::List(items.iter().map(|item| self.normalize_item(item)).collect())
                } else {
                    Value::List(items.iter().map(scrub).collect())
                }
            }
            Value::Text(s) => Value::Text(strip_carriage_returns(s)),
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => value.clone(),
        }
    }

    fn canonicalize_array(&self, array: &NdArray) -> Value {
        if array.size() == 0 {
            return Value::Null;
        }
        if array.ndim() == 0 {
            return scrub(&array.clone().into_item());
        }
        if array.items().iter().all(Value::is_record) {
            return Value::List(array.items().iter().map(|item| self.normalize_item(item)).collect());
        }
        Value::List(array.clone().into_nested().iter().map(scrub).collect())
    }

    fn normalize_item(&self, item: &Value) -> Value {
        match item {
            Value::Record(r) => Value::Record(self.normalize_record(r)),
            other => scrub(other),
        }
    }
}

/// Normalize a batch for the given source platform
pub fn normalize(records: &[Record], platform: Option<&str>) -> Vec<Record> {
    RecordNormalizer::new(platform).normalize(records)
}

/// Remove characters the warehouse rejects in column names
pub fn clean_field_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\r' | ' ' | '$' | '\u{feff}' | '"'))
        .map(|c| if c == '-' { '_' } else { c })
        .collect()
}

fn strip_carriage_returns(s: &str) -> String {
    s.replace('\r', "")
}

// Name cleanup without value canonicalization, for containers left as-is.
fn scrub(value: &Value) -> Value {
    match value {
        Value::Text(s) => Value::Text(strip_carriage_returns(s)),
        Value::List(items) => Value::List(items.iter().map(scrub).collect()),
        Value::Record(r) => {
            let mut out = Record::with_capacity(r.len());
            let mut seen = HashSet::new();
            for (name, inner) in r.iter() {
                let cleaned = clean_field_name(name);
                if seen.insert(cleaned.to_lowercase()) {
                    out.push(cleaned, scrub(inner));
                }
            }
            Value::Record(out)
        }
        other => other.clone(),
    }
}

/// Integer reading of a numeric literal, `None` when it is not one
fn version_number(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
        Value::Text(s) => {
            let trimmed = s.trim();
            trimmed.parse::<i64>().ok().or_else(|| {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}
