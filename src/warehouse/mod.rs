//! Warehouse boundary - the remote calls the load pipeline depends on
//!
//! Implementations:
//! - RestWarehouse: warehouse REST API over HTTP
//! - MemoryWarehouse: in-process tables, used by tests and dry runs

pub mod memory;
pub mod rest;

pub use memory::MemoryWarehouse;
pub use rest::RestWarehouse;

use crate::error::{LoadError, Result};
use crate::record::Record;
use crate::schema::TableSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Suffix marking a temporary staging table
pub const TEMP_SUFFIX: &str = "_temp";

/// Transient network retries per remote call, distinct from schema widening
pub const DEFAULT_NUM_RETRIES: u32 = 10;

/// Dataset + table identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Same dataset, different table
    pub fn sibling(&self, table: impl Into<String>) -> Self {
        Self::new(self.dataset.clone(), table)
    }

    pub fn is_temporary(&self) -> bool {
        self.table.len() > TEMP_SUFFIX.len() && self.table.ends_with(TEMP_SUFFIX)
    }

    /// Permanent counterpart of a temporary staging table
    pub fn permanent(&self) -> Option<TableRef> {
        if self.is_temporary() {
            let name = &self.table[..self.table.len() - TEMP_SUFFIX.len()];
            Some(self.sibling(name))
        } else {
            None
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Whether a load replaces or adds to existing rows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteDisposition {
    #[default]
    #[serde(rename = "WRITE_TRUNCATE")]
    Truncate,
    #[serde(rename = "WRITE_APPEND")]
    Append,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Truncate => "WRITE_TRUNCATE",
            WriteDisposition::Append => "WRITE_APPEND",
        }
    }
}

impl FromStr for WriteDisposition {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WRITE_TRUNCATE" | "TRUNCATE" => Ok(WriteDisposition::Truncate),
            "WRITE_APPEND" | "APPEND" => Ok(WriteDisposition::Append),
            other => Err(LoadError::Config(format!("unknown write disposition '{}'", other))),
        }
    }
}

/// Loads always create the destination table when missing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateDisposition {
    #[default]
    #[serde(rename = "CREATE_IF_NEEDED")]
    CreateIfNeeded,
}

impl CreateDisposition {
    pub fn as_str(&self) -> &'static str {
        "CREATE_IF_NEEDED"
    }
}

/// One bulk load submission
#[derive(Clone, Debug)]
pub struct LoadJob {
    pub job_id: String,
    pub destination: TableRef,
    pub schema: TableSchema,
    pub write_disposition: WriteDisposition,
    pub create_disposition: CreateDisposition,
    pub rows: Vec<Record>,
    pub num_retries: u32,
}

impl LoadJob {
    pub fn new(
        destination: TableRef,
        schema: TableSchema,
        write_disposition: WriteDisposition,
        rows: Vec<Record>,
    ) -> Self {
        Self {
            job_id: format!("load_{}", Uuid::new_v4().simple()),
            destination,
            schema,
            write_disposition,
            create_disposition: CreateDisposition::CreateIfNeeded,
            rows,
            num_retries: DEFAULT_NUM_RETRIES,
        }
    }

    pub fn with_num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    /// Rows as newline-delimited JSON, the load wire format
    pub fn to_ndjson(&self) -> Result<String> {
        let mut body = String::new();
        for row in &self.rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Completed load job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadJobResult {
    pub job_id: String,
    pub output_rows: u64,
}

/// Remote warehouse operations used by the load pipeline
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool>;

    async fn create_dataset(&self, dataset: &str) -> Result<()>;

    /// Schema of an existing table, `None` when the table does not exist
    async fn table_schema(&self, table: &TableRef) -> Result<Option<TableSchema>>;

    /// Replace a table's schema in place
    async fn update_table_schema(&self, table: &TableRef, schema: &TableSchema) -> Result<()>;

    /// Submit a load job and wait for it to finish
    async fn load(&self, job: &LoadJob) -> Result<LoadJobResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_tables() {
        let temp = TableRef::new("sales", "orders_temp");
        assert!(temp.is_temporary());
        assert_eq!(temp.permanent(), Some(TableRef::new("sales", "orders")));

        let plain = TableRef::new("sales", "orders");
        assert!(!plain.is_temporary());
        assert_eq!(plain.permanent(), None);
        assert!(!TableRef::new("sales", "_temp").is_temporary());
    }

    #[test]
    fn test_write_disposition_parsing() {
        assert_eq!("WRITE_APPEND".parse::<WriteDisposition>().unwrap(), WriteDisposition::Append);
        assert_eq!("truncate".parse::<WriteDisposition>().unwrap(), WriteDisposition::Truncate);
        assert!("WRITE_EMPTY".parse::<WriteDisposition>().is_err());
    }
}
