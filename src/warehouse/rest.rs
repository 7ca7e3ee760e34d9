//! REST warehouse client
//!
//! Datasets and tables through the v2 JSON API; loads as a multipart upload of
//! newline-delimited JSON followed by polling the job until it is DONE.
//! Transport failures, 429 and 5xx responses are retried with exponential
//! backoff up to the configured retry count.

use crate::config::WarehouseConfig;
use crate::error::{LoadError, Result};
use crate::schema::TableSchema;
use crate::warehouse::{LoadJob, LoadJobResult, TableRef, Warehouse};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const MULTIPART_BOUNDARY: &str = "warehouse_ingest_load_boundary";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct RestWarehouse {
    http: Client,
    config: WarehouseConfig,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{}: {}", reason, message),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl RestWarehouse {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.config.api_base_url, self.config.project_id)
    }

    fn dataset_url(&self, dataset: &str) -> String {
        format!("{}/datasets/{}", self.project_url(), dataset)
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!("{}/tables/{}", self.dataset_url(&table.dataset), table.table)
    }

    fn job_url(&self, job_id: &str, location: Option<&str>) -> String {
        let url = format!("{}/jobs/{}", self.project_url(), job_id);
        match location.or(self.config.location.as_deref()) {
            Some(location) => format!("{}?location={}", url, location),
            None => url,
        }
    }

    /// Send a request, retrying transient failures
    async fn send<F>(&self, build: F, num_retries: u32) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0u32;
        loop {
            let result = build().bearer_auth(&self.config.access_token).send().await;
            let retryable = match &result {
                Ok(resp) => {
                    resp.status() == StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error()
                }
                Err(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            };
            if !retryable || attempt >= num_retries {
                return Ok(result?);
            }
            let delay = backoff(attempt);
            match &result {
                Ok(resp) => warn!("⚠️  Warehouse returned {}, retrying in {:?}", resp.status(), delay),
                Err(err) => warn!("⚠️  Warehouse request failed ({}), retrying in {:?}", err, delay),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn poll_job(&self, mut resource: JobResource, fallback_id: &str) -> Result<JobResource> {
        let (job_id, location) = match &resource.job_reference {
            Some(reference) => (reference.job_id.clone(), reference.location.clone()),
            None => (fallback_id.to_string(), None),
        };
        let url = self.job_url(&job_id, location.as_deref());
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        while resource.status.as_ref().map(|s| s.state.as_str()) != Some("DONE") {
            tokio::time::sleep(interval).await;
            let resp = self.send(|| self.http.get(&url), self.config.num_retries).await?;
            resource = check(resp).await?.json().await?;
            debug!(
                "Job {} state: {}",
                job_id,
                resource.status.as_ref().map(|s| s.state.as_str()).unwrap_or("UNKNOWN")
            );
        }
        Ok(resource)
    }
}

fn backoff(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

/// Turn a non-success response into `LoadError::Api`
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body);
    Err(LoadError::Api {
        status: status.as_u16(),
        message,
    })
}

fn multipart_body(metadata: &serde_json::Value, ndjson: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
        b = MULTIPART_BOUNDARY,
        meta = metadata,
        data = ndjson
    )
}

#[async_trait]
impl Warehouse for RestWarehouse {
    async fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let url = self.dataset_url(dataset);
        let resp = self.send(|| self.http.get(&url), self.config.num_retries).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp).await?;
        Ok(true)
    }

    async fn create_dataset(&self, dataset: &str) -> Result<()> {
        let url = format!("{}/datasets", self.project_url());
        let mut body = json!({
            "datasetReference": {
                "projectId": self.config.project_id,
                "datasetId": dataset,
            }
        });
        if let Some(location) = &self.config.location {
            body["location"] = json!(location);
        }
        let resp = self
            .send(|| self.http.post(&url).json(&body), self.config.num_retries)
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            debug!("Dataset {} already exists", dataset);
            return Ok(());
        }
        check(resp).await?;
        info!("✅ Created dataset {}", dataset);
        Ok(())
    }

    async fn table_schema(&self, table: &TableRef) -> Result<Option<TableSchema>> {
        let url = self.table_url(table);
        let resp = self.send(|| self.http.get(&url), self.config.num_retries).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource: TableResource = check(resp).await?.json().await?;
        Ok(Some(resource.schema.unwrap_or_default()))
    }

    async fn update_table_schema(&self, table: &TableRef, schema: &TableSchema) -> Result<()> {
        let url = self.table_url(table);
        let body = json!({ "schema": schema });
        let resp = self
            .send(|| self.http.patch(&url).json(&body), self.config.num_retries)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(LoadError::NotFound(format!("Table {}", table)));
        }
        check(resp).await?;
        Ok(())
    }

    async fn load(&self, job: &LoadJob) -> Result<LoadJobResult> {
        let mut job_reference = json!({
            "projectId": self.config.project_id,
            "jobId": job.job_id,
        });
        if let Some(location) = &self.config.location {
            job_reference["location"] = json!(location);
        }
        let metadata = json!({
            "jobReference": job_reference,
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.config.project_id,
                        "datasetId": job.destination.dataset,
                        "tableId": job.destination.table,
                    },
                    "schema": job.schema,
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": job.write_disposition.as_str(),
                    "createDisposition": job.create_disposition.as_str(),
                    "autodetect": false,
                }
            }
        });
        let body = multipart_body(&metadata, &job.to_ndjson()?);
        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            self.config.upload_base_url, self.config.project_id
        );
        let content_type = format!("multipart/related; boundary={}", MULTIPART_BOUNDARY);

        let resp = self
            .send(
                || {
                    self.http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                        .body(body.clone())
                },
                job.num_retries,
            )
            .await?;
        let submitted: JobResource = check(resp).await?.json().await?;
        let finished = self.poll_job(submitted, &job.job_id).await?;

        if let Some(status) = &finished.status {
            if let Some(error) = &status.error_result {
                let details: Vec<String> = status.errors.iter().map(ErrorProto::describe).collect();
                let message = if details.is_empty() {
                    error.describe()
                } else {
                    format!("{} ({})", error.describe(), details.join("; "))
                };
                return Err(LoadError::Api {
                    status: 400,
                    message,
                });
            }
        }

        let output_rows = finished
            .statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .and_then(|rows| rows.parse().ok())
            .unwrap_or(job.rows.len() as u64);
        Ok(LoadJobResult {
            job_id: job.job_id.clone(),
            output_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(20), MAX_BACKOFF);
    }

    #[test]
    fn test_urls() {
        let mut config = WarehouseConfig::new("proj", "token");
        config.location = Some("EU".to_string());
        let warehouse = RestWarehouse::new(config).unwrap();
        assert_eq!(
            warehouse.table_url(&TableRef::new("ds", "t")),
            "https://bigquery.googleapis.com/bigquery/v2/projects/proj/datasets/ds/tables/t"
        );
        assert!(warehouse.job_url("job1", None).ends_with("/projects/proj/jobs/job1?location=EU"));
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body(&json!({"a": 1}), "{\"x\":1}\n");
        assert!(body.starts_with(&format!("--{}\r\n", MULTIPART_BOUNDARY)));
        assert!(body.contains("{\"a\":1}"));
        assert!(body.ends_with(&format!("--{}--\r\n", MULTIPART_BOUNDARY)));
    }

    #[test]
    fn test_job_status_parsing() {
        let resource: JobResource = serde_json::from_value(json!({
            "jobReference": {"jobId": "j", "location": "US"},
            "status": {
                "state": "DONE",
                "errorResult": {"reason": "invalid", "message": "bad row"},
                "errors": [{"reason": "invalid", "message": "no such field: y"}]
            },
            "statistics": {"load": {"outputRows": "0"}}
        }))
        .unwrap();
        let status = resource.status.unwrap();
        assert_eq!(status.state, "DONE");
        assert_eq!(status.error_result.unwrap().describe(), "invalid: bad row");
        assert_eq!(status.errors.len(), 1);
    }
}
