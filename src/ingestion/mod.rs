//! Ingestion Module - shaping and loading pipeline
//!
//! Record flow: normalizer -> schema inference / enforcement -> orchestrator
//! -> warehouse. Only the orchestrator talks to the warehouse.

pub mod frame;
pub mod normalizer;
pub mod orchestrator;
pub mod schema_enforcer;
pub mod schema_inference;

pub use frame::{clean_column_name, dataframe_to_records};
pub use normalizer::{clean_field_name, normalize, RecordNormalizer};
pub use orchestrator::{
    LoadOrchestrator, LoadOutcome, LoadRequest, LoadStatus, LoadWarning, LoaderOptions, SchemaSource,
};
pub use schema_enforcer::{cast_value, enforce, enforce_record};
pub use schema_inference::SchemaInference;
