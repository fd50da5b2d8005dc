use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{to_ndjson, LoadError, Loader};
use crate::config::BigQueryConfig;
use crate::schema;
use crate::transform::ProductRow;

const BASE_URL: &str = "https://bigquery.googleapis.com";
const BOUNDARY: &str = "meli_etl_load_boundary";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Appends rows to a BigQuery table through the v2 REST API using load jobs.
pub struct BigQueryLoader {
    client: reqwest::Client,
    base_url: String,
    token: String,
    project_id: String,
    dataset_id: String,
    table_id: String,
    location: Option<String>,
    poll_interval: Duration,
}

impl BigQueryLoader {
    pub fn new(settings: &BigQueryConfig, token: String) -> Result<Self, LoadError> {
        for id in [&settings.dataset_id, &settings.table_id] {
            if !schema::is_valid_identifier(id) {
                return Err(LoadError::InvalidIdentifier(id.clone()));
            }
        }
        if settings.project_id.trim().is_empty() {
            return Err(LoadError::InvalidIdentifier(settings.project_id.clone()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            token,
            project_id: settings.project_id.clone(),
            dataset_id: settings.dataset_id.clone(),
            table_id: settings.table_id.clone(),
            location: settings.location.clone(),
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Token from config, else from the gcloud CLI's active credentials.
    pub async fn connect(settings: &BigQueryConfig) -> Result<Self, LoadError> {
        let token = match settings.access_token.clone() {
            Some(t) => t,
            None => gcloud_access_token().await?,
        };
        Self::new(settings, token)
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/bigquery/v2/projects/{}/datasets/{}",
            self.base_url, self.project_id, self.dataset_id
        )
    }

    fn table_ref(&self) -> Value {
        json!({
            "projectId": self.project_id,
            "datasetId": self.dataset_id,
            "tableId": self.table_id,
        })
    }

    fn load_job_metadata(&self) -> Value {
        let mut job = json!({
            "configuration": {
                "load": {
                    "destinationTable": self.table_ref(),
                    "writeDisposition": "WRITE_APPEND",
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "autodetect": false,
                    "schema": schema::bigquery_schema(),
                }
            }
        });
        if let Some(loc) = &self.location {
            job["jobReference"] = json!({ "projectId": self.project_id, "location": loc });
        }
        job
    }

    /// Start a load job: job metadata and NDJSON rows in one multipart upload.
    async fn insert_load_job(&self, ndjson: String) -> Result<Job, LoadError> {
        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.base_url, self.project_id
        );
        let body = multipart_related(&self.load_job_metadata().to_string(), &ndjson);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn wait_for_job(&self, mut job: Job) -> Result<Job, LoadError> {
        while job.status.state != "DONE" {
            debug!(job_id = %job.job_reference.job_id, state = %job.status.state, "Load job running");
            tokio::time::sleep(self.poll_interval).await;

            let url = format!(
                "{}/bigquery/v2/projects/{}/jobs/{}",
                self.base_url, self.project_id, job.job_reference.job_id
            );
            let mut req = self.client.get(&url).bearer_auth(&self.token);
            if let Some(loc) = job.job_reference.location.as_ref().or(self.location.as_ref()) {
                req = req.query(&[("location", loc)]);
            }
            job = check_status(req.send().await?).await?.json().await?;
        }

        if let Some(err) = &job.status.error_result {
            return Err(LoadError::Job {
                job_id: job.job_reference.job_id.clone(),
                message: format!("{}: {}", err.reason, err.message),
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl Loader for BigQueryLoader {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn ensure_table(&self) -> Result<(), LoadError> {
        let url = format!("{}/tables/{}", self.dataset_url(), self.table_id);
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if resp.status() != StatusCode::NOT_FOUND {
            check_status(resp).await?;
            info!(table = %self.table_id, "Table already exists");
            return Ok(());
        }

        let resource =
            schema::bigquery_table_resource(&self.project_id, &self.dataset_id, &self.table_id);
        let resp = self
            .client
            .post(format!("{}/tables", self.dataset_url()))
            .bearer_auth(&self.token)
            .json(&resource)
            .send()
            .await?;
        check_status(resp).await?;
        info!(
            table = %self.table_id,
            partition = schema::PARTITION_FIELD,
            clustering = ?schema::CLUSTERING_FIELDS,
            "Table created"
        );
        Ok(())
    }

    async fn load(&self, rows: &[ProductRow]) -> Result<usize, LoadError> {
        if rows.is_empty() {
            info!("No products to load");
            return Ok(0);
        }

        let job = self.insert_load_job(to_ndjson(rows)?).await?;
        info!(job_id = %job.job_reference.job_id, rows = rows.len(), "Load job started");
        let job = self.wait_for_job(job).await?;

        info!(
            job_id = %job.job_reference.job_id,
            rows = rows.len(),
            job_run = %rows[0].job_run,
            "Products loaded into BigQuery"
        );
        Ok(rows.len())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LoadError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(LoadError::Api {
        status: status.as_u16(),
        message,
    })
}

fn multipart_related(metadata: &str, data: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
        b = BOUNDARY,
    )
}

async fn gcloud_access_token() -> Result<String, LoadError> {
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| LoadError::Token(format!("BQ_ACCESS_TOKEN unset and gcloud unavailable: {}", e)))?;
    if !output.status.success() {
        return Err(LoadError::Token(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(LoadError::Token("gcloud returned an empty token".into()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::tests::sample_row;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TABLE_PATH: &str = "/bigquery/v2/projects/proj/datasets/meli/tables";

    fn settings() -> BigQueryConfig {
        BigQueryConfig {
            project_id: "proj".into(),
            ..BigQueryConfig::default()
        }
    }

    async fn loader(server: &MockServer) -> BigQueryLoader {
        BigQueryLoader::new(&settings(), "tok".into())
            .unwrap()
            .with_base_url(server.uri())
            .with_poll_interval(Duration::ZERO)
    }

    #[tokio::test]
    async fn creates_missing_table() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/products", TABLE_PATH)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(TABLE_PATH))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(json!({
                "timePartitioning": { "type": "DAY", "field": "JOB_RUN" },
                "clustering": { "fields": ["brand", "condition", "seller_power_seller_status"] },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        loader(&server).await.ensure_table().await.unwrap();
    }

    #[tokio::test]
    async fn existing_table_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/products", TABLE_PATH)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "proj:meli.products" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        loader(&server).await.ensure_table().await.unwrap();
    }

    #[tokio::test]
    async fn load_job_polls_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("\"writeDisposition\":\"WRITE_APPEND\""))
            .and(body_string_contains("\"product_id\":\"A\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job1", "location": "US" },
                "status": { "state": "RUNNING" },
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/proj/jobs/job1"))
            .and(query_param("location", "US"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job1", "location": "US" },
                "status": { "state": "DONE" },
            })))
            .mount(&server)
            .await;

        let n = loader(&server)
            .await
            .load(&[sample_row("A"), sample_row("B")])
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn job_error_result_fails_load() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/proj/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job2" },
                "status": {
                    "state": "DONE",
                    "errorResult": { "reason": "invalid", "message": "JSON parsing error" },
                },
            })))
            .mount(&server)
            .await;

        let err = loader(&server).await.load(&[sample_row("A")]).await.unwrap_err();
        assert!(matches!(err, LoadError::Job { ref job_id, .. } if job_id == "job2"));
        assert!(err.to_string().contains("JSON parsing error"));
    }

    #[tokio::test]
    async fn empty_load_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        assert_eq!(loader(&server).await.load(&[]).await.unwrap(), 0);
    }

    #[test]
    fn rejects_bad_identifiers() {
        let bad = BigQueryConfig {
            table_id: "products-v2; --".into(),
            ..settings()
        };
        assert!(matches!(
            BigQueryLoader::new(&bad, "t".into()),
            Err(LoadError::InvalidIdentifier(_))
        ));
        assert!(BigQueryLoader::new(&BigQueryConfig::default(), "t".into()).is_err());
    }

    #[test]
    fn multipart_layout() {
        let body = multipart_related("{\"a\":1}", "{\"x\":1}\n");
        assert!(body.starts_with(&format!("--{}\r\n", BOUNDARY)));
        assert!(body.ends_with(&format!("--{}--\r\n", BOUNDARY)));
        assert_eq!(body.matches(BOUNDARY).count(), 3);
    }
}
