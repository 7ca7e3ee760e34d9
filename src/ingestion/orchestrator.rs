//! Load Orchestrator - resolves destination and schema, loads, widens once on rejection
//!
//! State machine per call:
//! resolve dataset -> resolve schema -> normalize + enforce -> attempt 1
//! -> (rejected) widen + re-enforce -> attempt 2 -> propagate widened schema.
//! Two concurrent loads that widen the same table are not coordinated;
//! callers serialize writes to one destination.

use crate::error::{LoadError, Result};
use crate::ingestion::frame::dataframe_to_records;
use crate::ingestion::normalizer::RecordNormalizer;
use crate::ingestion::schema_enforcer::enforce;
use crate::ingestion::schema_inference::SchemaInference;
use crate::record::{iso_timestamp, Record, Value};
use crate::schema::{FieldType, TableSchema};
use crate::warehouse::{LoadJob, TableRef, Warehouse, WriteDisposition, DEFAULT_NUM_RETRIES};
use chrono::Utc;
use polars::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Field stamped on every record when `include_loaded_at` is set
pub const LOADED_AT_FIELD: &str = "loaded_at";

/// Parameters of a single load call
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub destination: TableRef,
    pub write_disposition: WriteDisposition,
    /// Source platform, used by normalization
    pub platform: Option<String>,
    /// Table whose schema the load should reuse
    pub base_table: Option<String>,
    /// Infer from data even when a table schema exists
    pub force_schema: bool,
    /// Uniform scalar type for inferred leaves
    pub force_type: Option<FieldType>,
    pub include_loaded_at: bool,
}

impl LoadRequest {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            destination: TableRef::new(dataset, table),
            write_disposition: WriteDisposition::Truncate,
            platform: None,
            base_table: None,
            force_schema: false,
            force_type: None,
            include_loaded_at: false,
        }
    }

    pub fn append(mut self) -> Self {
        self.write_disposition = WriteDisposition::Append;
        self
    }

    pub fn with_write_disposition(mut self, write_disposition: WriteDisposition) -> Self {
        self.write_disposition = write_disposition;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_base_table(mut self, base_table: impl Into<String>) -> Self {
        self.base_table = Some(base_table.into());
        self
    }

    pub fn force_schema(mut self, force_type: Option<FieldType>) -> Self {
        self.force_schema = true;
        self.force_type = force_type;
        self
    }

    pub fn with_force_type(mut self, force_type: Option<FieldType>) -> Self {
        self.force_type = force_type;
        self
    }

    pub fn with_loaded_at(mut self) -> Self {
        self.include_loaded_at = true;
        self
    }
}

/// Where the load schema came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SchemaSource {
    /// Inferred because the caller forced it
    Forced,
    BaseTable(String),
    /// Permanent counterpart of a temporary table
    PermanentTable(String),
    /// The destination table itself
    ExistingTable,
    /// No table matched
    Inferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    Loaded,
    /// Loaded on the second attempt with a widened schema
    SchemaWidened,
    /// Debug mode: nothing was submitted
    DryRun,
}

/// Best-effort secondary operation that failed without failing the load
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadWarning {
    pub table: TableRef,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadOutcome {
    pub destination: TableRef,
    pub status: LoadStatus,
    pub schema_source: SchemaSource,
    /// Schema of the last submission, or the resolved schema in debug mode
    pub schema: TableSchema,
    pub rows: usize,
    pub attempts: u8,
    pub warnings: Vec<LoadWarning>,
}

#[derive(Clone, Debug)]
pub struct LoaderOptions {
    /// Stop after enforcement and report the schema
    pub debug: bool,
    /// Transient network retries handed to every load job
    pub num_retries: u32,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            debug: false,
            num_retries: DEFAULT_NUM_RETRIES,
        }
    }
}

/// Load Orchestrator
pub struct LoadOrchestrator {
    warehouse: Arc<dyn Warehouse>,
    options: LoaderOptions,
}

impl LoadOrchestrator {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self::with_options(warehouse, LoaderOptions::default())
    }

    pub fn with_options(warehouse: Arc<dyn Warehouse>, options: LoaderOptions) -> Self {
        Self { warehouse, options }
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Load a polars frame through the same pipeline as JSON records
    pub async fn load_dataframe(&self, frame: &DataFrame, request: &LoadRequest) -> Result<LoadOutcome> {
        let records = dataframe_to_records(frame)?;
        info!("📂 Converted frame with {} row(s) and {} column(s)", frame.height(), frame.width());
        self.load_records(records, request).await
    }

    pub async fn load_records(&self, mut records: Vec<Record>, request: &LoadRequest) -> Result<LoadOutcome> {
        let destination = &request.destination;
        info!("🚀 Loading {} record(s) into {}", records.len(), destination);

        self.ensure_dataset(&destination.dataset).await?;

        if request.include_loaded_at {
            let now = iso_timestamp(&Utc::now());
            for record in &mut records {
                record.insert(LOADED_AT_FIELD, Value::Text(now.clone()));
            }
        }

        let normalized = RecordNormalizer::new(request.platform.as_deref()).normalize(&records);
        let inference = SchemaInference::with_forced_type(request.force_type);
        let (schema, schema_source) = self.resolve_schema(&normalized, request, &inference).await?;
        let rows = enforce(&normalized, &schema);

        if self.options.debug {
            let widened = inference.widen(&schema, &normalized);
            info!("🔍 Debug mode, not loading {}. Resolved schema from {:?}", destination, schema_source);
            debug!("Widened schema would be: {}", serde_json::to_string(&widened)?);
            return Ok(LoadOutcome {
                destination: destination.clone(),
                status: LoadStatus::DryRun,
                schema_source,
                schema,
                rows: rows.len(),
                attempts: 0,
                warnings: Vec::new(),
            });
        }

        let row_count = rows.len();
        let first = LoadJob::new(destination.clone(), schema.clone(), request.write_disposition, rows)
            .with_num_retries(self.options.num_retries);
        let first_error = match self.warehouse.load(&first).await {
            Ok(result) => {
                info!("✅ Loaded {} row(s) into {} (job {})", result.output_rows, destination, result.job_id);
                return Ok(LoadOutcome {
                    destination: destination.clone(),
                    status: LoadStatus::Loaded,
                    schema_source,
                    schema,
                    rows: row_count,
                    attempts: 1,
                    warnings: Vec::new(),
                });
            }
            Err(err) => err,
        };

        warn!("⚠️  Load into {} failed, widening schema: {}", destination, first_error);
        let mut warnings = Vec::new();
        let widened = inference.widen(&schema, &normalized);
        let rows = enforce(&normalized, &widened);

        if request.write_disposition == WriteDisposition::Append {
            self.push_schema(destination, &widened, &mut warnings).await;
        }

        let second = LoadJob::new(destination.clone(), widened.clone(), request.write_disposition, rows)
            .with_num_retries(self.options.num_retries);
        match self.warehouse.load(&second).await {
            Ok(result) => {
                info!(
                    "✅ Loaded {} row(s) into {} with widened schema (job {})",
                    result.output_rows, destination, result.job_id
                );
            }
            Err(err) => {
                return Err(LoadError::Rejected {
                    destination: destination.to_string(),
                    attempts: 2,
                    reason: err.to_string(),
                });
            }
        }

        if let Some(related) = self.related_table(request) {
            self.push_schema(&related, &widened, &mut warnings).await;
        }

        Ok(LoadOutcome {
            destination: destination.clone(),
            status: LoadStatus::SchemaWidened,
            schema_source,
            schema: widened,
            rows: row_count,
            attempts: 2,
            warnings,
        })
    }

    async fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        let exists = self
            .warehouse
            .dataset_exists(dataset)
            .await
            .map_err(|err| destination_error(dataset, err))?;
        if exists {
            debug!("Dataset {} found", dataset);
            return Ok(());
        }
        warn!("⚠️  Dataset {} not found, creating it", dataset);
        self.warehouse
            .create_dataset(dataset)
            .await
            .map_err(|err| destination_error(dataset, err))?;
        info!("✅ Dataset {} created", dataset);
        Ok(())
    }

    /// Pick the load schema: forced, base table, permanent table, destination, inferred
    async fn resolve_schema(
        &self,
        records: &[Record],
        request: &LoadRequest,
        inference: &SchemaInference,
    ) -> Result<(TableSchema, SchemaSource)> {
        let destination = &request.destination;
        if request.force_schema {
            info!("📋 Forcing schema generation for {}", destination);
            return Ok((inference.infer(records), SchemaSource::Forced));
        }

        if let Some(base) = &request.base_table {
            if let Some(schema) = self.existing_schema(&destination.sibling(base.as_str())).await? {
                info!("📋 Using schema of base table {}", base);
                return Ok((schema, SchemaSource::BaseTable(base.clone())));
            }
            info!("📋 Base table {} not found, generating schema", base);
            return Ok((inference.infer(records), SchemaSource::Inferred));
        }

        if let Some(permanent) = destination.permanent() {
            if let Some(schema) = self.existing_schema(&permanent).await? {
                info!("📋 Using schema of permanent table {}", permanent);
                return Ok((schema, SchemaSource::PermanentTable(permanent.table)));
            }
        }

        if let Some(schema) = self.existing_schema(destination).await? {
            info!("📋 Using schema of existing table {}", destination);
            return Ok((schema, SchemaSource::ExistingTable));
        }

        info!("📋 Table {} not found, generating schema", destination);
        Ok((inference.infer(records), SchemaSource::Inferred))
    }

    // Tables without a usable schema count as missing.
    async fn existing_schema(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        match self.warehouse.table_schema(table).await {
            Ok(Some(schema)) if !schema.is_empty() => Ok(Some(schema)),
            Ok(_) | Err(LoadError::NotFound(_)) => Ok(None),
            Err(err) => Err(destination_error(&table.dataset, err)),
        }
    }

    /// Base table or permanent counterpart that should follow a widened schema
    fn related_table(&self, request: &LoadRequest) -> Option<TableRef> {
        match &request.base_table {
            Some(base) => Some(request.destination.sibling(base.as_str())),
            None => request.destination.permanent(),
        }
    }

    async fn push_schema(&self, table: &TableRef, schema: &TableSchema, warnings: &mut Vec<LoadWarning>) {
        match self.warehouse.update_table_schema(table, schema).await {
            Ok(()) => info!("🧩 Schema of {} updated", table),
            Err(err) => {
                warn!("⚠️  Could not update schema of {}: {}", table, err);
                warnings.push(LoadWarning {
                    table: table.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
}

fn destination_error(dataset: &str, err: LoadError) -> LoadError {
    LoadError::Destination {
        dataset: dataset.to_string(),
        reason: err.to_string(),
    }
}
