//! In-memory warehouse
//!
//! Keeps datasets and tables in process and rejects loads the way the remote
//! service does: undeclared fields, values that do not fit their column type,
//! nulls inside repeated fields and APPEND schemas that disagree with the
//! table. Every submission is recorded, and rejections can be scripted.

use crate::error::{LoadError, Result};
use crate::record::{Record, Value};
use crate::schema::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::warehouse::{LoadJob, LoadJobResult, TableRef, Warehouse, WriteDisposition};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Rows and schema of one in-memory table
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryTable {
    pub schema: TableSchema,
    pub rows: Vec<Record>,
}

#[derive(Default)]
struct MemoryState {
    datasets: HashSet<String>,
    tables: HashMap<TableRef, MemoryTable>,
    submissions: Vec<LoadJob>,
    scripted_rejections: VecDeque<String>,
    refuse_dataset_creation: bool,
    refused_schema_updates: HashSet<TableRef>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, dataset: &str) -> Self {
        self.state().datasets.insert(dataset.to_string());
        self
    }

    /// Pre-existing table (and its dataset)
    pub fn with_table(self, table: TableRef, schema: TableSchema) -> Self {
        {
            let mut state = self.state();
            state.datasets.insert(table.dataset.clone());
            state.tables.insert(
                table,
                MemoryTable {
                    schema,
                    rows: Vec::new(),
                },
            );
        }
        self
    }

    /// Reject the next load submission with `reason`, regardless of its content
    pub fn reject_next_load(&self, reason: &str) {
        self.state().scripted_rejections.push_back(reason.to_string());
    }

    pub fn refuse_dataset_creation(&self) {
        self.state().refuse_dataset_creation = true;
    }

    pub fn refuse_schema_update(&self, table: &TableRef) {
        self.state().refused_schema_updates.insert(table.clone());
    }

    /// Every load job submitted so far, in order
    pub fn submissions(&self) -> Vec<LoadJob> {
        self.state().submissions.clone()
    }

    pub fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.state().tables.get(table).cloned()
    }

    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.state().datasets.contains(dataset)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn rejection(message: String) -> LoadError {
    LoadError::Api {
        status: 400,
        message,
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.state().datasets.contains(dataset))
    }

    async fn create_dataset(&self, dataset: &str) -> Result<()> {
        let mut state = self.state();
        if state.refuse_dataset_creation {
            return Err(LoadError::Api {
                status: 403,
                message: format!("Access Denied: cannot create dataset {}", dataset),
            });
        }
        state.datasets.insert(dataset.to_string());
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        Ok(self.state().tables.get(table).map(|t| t.schema.clone()))
    }

    async fn update_table_schema(&self, table: &TableRef, schema: &TableSchema) -> Result<()> {
        let mut state = self.state();
        if state.refused_schema_updates.contains(table) {
            return Err(rejection(format!("Schema update refused for {}", table)));
        }
        match state.tables.get_mut(table) {
            Some(existing) => {
                existing.schema = schema.clone();
                Ok(())
            }
            None => Err(LoadError::NotFound(format!("Table {}", table))),
        }
    }

    async fn load(&self, job: &LoadJob) -> Result<LoadJobResult> {
        let mut state = self.state();
        state.submissions.push(job.clone());

        if !state.datasets.contains(&job.destination.dataset) {
            return Err(LoadError::NotFound(format!("Dataset {}", job.destination.dataset)));
        }
        if let Some(reason) = state.scripted_rejections.pop_front() {
            return Err(rejection(reason));
        }
        job.schema.validate()?;

        for (idx, row) in job.rows.iter().enumerate() {
            validate_row(row, &job.schema.fields, "")
                .map_err(|reason| rejection(format!("Error while reading data, row {}: {}", idx, reason)))?;
        }

        let existing = state.tables.get(&job.destination).cloned();
        let table = match (job.write_disposition, existing) {
            (WriteDisposition::Append, Some(mut table)) => {
                check_append_schema(&table.schema.fields, &job.schema.fields, "")
                    .map_err(|reason| rejection(format!("Provided Schema does not match Table {}. {}", job.destination, reason)))?;
                table.rows.extend(job.rows.iter().cloned());
                table
            }
            _ => MemoryTable {
                schema: job.schema.clone(),
                rows: job.rows.clone(),
            },
        };
        debug!("Loaded {} row(s) into {}", job.rows.len(), job.destination);
        state.tables.insert(job.destination.clone(), table);

        Ok(LoadJobResult {
            job_id: job.job_id.clone(),
            output_rows: job.rows.len() as u64,
        })
    }
}

fn field_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn validate_row(record: &Record, fields: &[FieldSchema], path: &str) -> std::result::Result<(), String> {
    for field in fields.iter().filter(|f| f.mode == FieldMode::Required) {
        if record.get(&field.name).map_or(true, Value::is_null) {
            return Err(format!("Missing required field: {}", field_path(path, &field.name)));
        }
    }
    for (name, value) in record.iter() {
        let full = field_path(path, name);
        let field = fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| format!("no such field: {}", full))?;
        if value.is_null() {
            continue;
        }
        if field.is_repeated() {
            let items = value
                .as_list()
                .ok_or_else(|| format!("array specified for non-repeated field: {} expected array, got {}", full, value.kind()))?;
            for item in items {
                if item.is_null() {
                    return Err(format!("null value in repeated field: {}", full));
                }
                validate_value(item, field, &full)?;
            }
        } else {
            validate_value(value, field, &full)?;
        }
    }
    Ok(())
}

fn validate_value(value: &Value, field: &FieldSchema, full: &str) -> std::result::Result<(), String> {
    let fits = match (field.field_type, value) {
        (FieldType::Record, Value::Record(nested)) => return validate_row(nested, &field.fields, full),
        (FieldType::String, Value::Text(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)) => true,
        (FieldType::Integer, Value::Int(_)) => true,
        (FieldType::Integer, Value::Text(s)) => s.trim().parse::<i64>().is_ok(),
        (FieldType::Float, Value::Int(_) | Value::Float(_)) => true,
        (FieldType::Float, Value::Text(s)) => s.trim().parse::<f64>().is_ok(),
        (FieldType::Boolean, Value::Bool(_)) => true,
        (FieldType::Boolean, Value::Text(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "false"),
        (FieldType::Timestamp, Value::Timestamp(_) | Value::Int(_)) => true,
        (FieldType::Timestamp, Value::Text(s)) => parses_as_timestamp(s),
        (FieldType::Numeric | FieldType::BigNumeric, Value::Int(_) | Value::Float(_)) => true,
        (FieldType::Numeric | FieldType::BigNumeric, Value::Text(s)) => s.trim().parse::<f64>().is_ok(),
        (FieldType::Date, Value::Text(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
        (FieldType::Datetime, Value::Text(s)) => parses_as_timestamp(s),
        (FieldType::Time, Value::Text(s)) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f").is_ok(),
        (FieldType::Bytes | FieldType::Geography | FieldType::Interval | FieldType::Range, Value::Text(_)) => true,
        (FieldType::Json, _) => true,
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(format!(
            "could not convert {} value to {} for field: {}",
            value.kind(),
            field.field_type,
            full
        ))
    }
}

fn parses_as_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

// Every column the job declares must already exist on the table with the same shape.
fn check_append_schema(
    table: &[FieldSchema],
    job: &[FieldSchema],
    path: &str,
) -> std::result::Result<(), String> {
    for field in job {
        let full = field_path(path, &field.name);
        let current = table
            .iter()
            .find(|f| f.name == field.name)
            .ok_or_else(|| format!("Field {} is missing in the table schema", full))?;
        if current.field_type != field.field_type || current.mode != field.mode {
            return Err(format!(
                "Field {} has changed type from {} {} to {} {}",
                full, current.mode, current.field_type, field.mode, field.field_type
            ));
        }
        if field.is_record() {
            check_append_schema(&current.fields, &field.fields, &full)?;
        }
    }
    Ok(())
}
