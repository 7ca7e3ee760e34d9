//! Configuration - warehouse connection settings from the environment
//!
//! Call `dotenv::dotenv()` first so a local `.env` file is honoured.

use crate::error::{LoadError, Result};
use crate::warehouse::DEFAULT_NUM_RETRIES;
use serde::Deserialize;
use std::env;
use std::path::Path;

pub const DEFAULT_API_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

#[derive(Clone, Debug)]
pub struct WarehouseConfig {
    pub project_id: String,
    pub access_token: String,
    pub api_base_url: String,
    pub upload_base_url: String,
    /// Job/dataset location, e.g. "US" or "europe-west1"
    pub location: Option<String>,
    /// Transient network retries per remote call
    pub num_retries: u32,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    /// Dry-run: compute and report the schema without loading
    pub debug: bool,
}

/// The part of a service-account key file we read
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    project_id: String,
}

impl WarehouseConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: access_token.into(),
            api_base_url: DEFAULT_API_URL.to_string(),
            upload_base_url: DEFAULT_UPLOAD_URL.to_string(),
            location: None,
            num_retries: DEFAULT_NUM_RETRIES,
            poll_interval_ms: 1000,
            request_timeout_secs: 300,
            debug: false,
        }
    }

    /// Build from `WAREHOUSE_*` variables with Google Cloud fallbacks
    pub fn from_env() -> Result<Self> {
        let project_id = match var("WAREHOUSE_PROJECT_ID").or_else(|| var("GOOGLE_CLOUD_PROJECT")) {
            Some(project) => project,
            None => match var("GOOGLE_APPLICATION_CREDENTIALS") {
                Some(path) => project_from_key_file(Path::new(&path))?,
                None => {
                    return Err(LoadError::Config(
                        "WAREHOUSE_PROJECT_ID is not set and no service-account key is configured".to_string(),
                    ))
                }
            },
        };
        let access_token = var("WAREHOUSE_ACCESS_TOKEN")
            .or_else(|| var("GOOGLE_OAUTH_ACCESS_TOKEN"))
            .ok_or_else(|| LoadError::Config("WAREHOUSE_ACCESS_TOKEN is not set".to_string()))?;

        let mut config = Self::new(project_id, access_token);
        if let Some(url) = var("WAREHOUSE_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = var("WAREHOUSE_UPLOAD_URL") {
            config.upload_base_url = url.trim_end_matches('/').to_string();
        }
        config.location = var("WAREHOUSE_LOCATION");
        if let Some(retries) = var("WAREHOUSE_NUM_RETRIES") {
            config.num_retries = parse_var("WAREHOUSE_NUM_RETRIES", &retries)?;
        }
        if let Some(interval) = var("WAREHOUSE_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_var("WAREHOUSE_POLL_INTERVAL_MS", &interval)?;
        }
        if let Some(timeout) = var("WAREHOUSE_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_var("WAREHOUSE_TIMEOUT_SECS", &timeout)?;
        }
        config.debug = var("WAREHOUSE_DEBUG")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(config)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| LoadError::Config(format!("{} has an invalid value '{}'", name, raw)))
}

/// Project id from a service-account key file
pub fn project_from_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let key: ServiceAccountKey = serde_json::from_str(&content)?;
    Ok(key.project_id)
}
