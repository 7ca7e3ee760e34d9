pub mod config;
pub mod error;
pub mod ingestion;
pub mod record;
pub mod schema;
pub mod warehouse;

pub use config::WarehouseConfig;
pub use error::{LoadError, Result};
pub use ingestion::{LoadOrchestrator, LoadOutcome, LoadRequest, LoadStatus, SchemaInference};
pub use record::{NdArray, Record, Value};
pub use schema::{FieldMode, FieldSchema, FieldType, TableSchema};
pub use warehouse::{MemoryWarehouse, RestWarehouse, TableRef, Warehouse, WriteDisposition};
