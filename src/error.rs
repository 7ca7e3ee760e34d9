use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Destination error for dataset '{dataset}': {reason}")]
    Destination { dataset: String, reason: String },

    #[error("Load into {destination} rejected after {attempts} attempt(s): {reason}")]
    Rejected {
        destination: String,
        attempts: u8,
        reason: String,
    },

    #[error("Warehouse API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for LoadError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        LoadError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LoadError>;
