use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{check_status, ExtractError, Extractor};
use crate::config::ApifyConfig;

const BASE_URL: &str = "https://api.apify.com";
const DATASET_PAGE_SIZE: usize = 1000;
const WAIT_FOR_FINISH_SECS: u32 = 60;

/// Input of the Mercado Libre scraper actor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    pub debug_mode: bool,
    pub domain_code: String,
    pub fast_mode: bool,
    pub max_item_count: u32,
    pub proxy: ProxyInput,
    pub search: String,
    pub search_category: String,
    pub sort_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInput {
    pub use_apify_proxy: bool,
    pub apify_proxy_groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub default_dataset_id: Option<String>,
}

/// Runs a scraping actor on Apify and reads back its default dataset.
pub struct ApifyExtractor {
    client: reqwest::Client,
    base_url: String,
    token: String,
    page_size: usize,
    settings: ApifyConfig,
}

impl ApifyExtractor {
    pub fn new(settings: ApifyConfig) -> Result<Self, ExtractError> {
        let token = settings
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ExtractError::MissingToken("APIFY_TOKEN"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: BASE_URL.to_string(),
            token,
            page_size: DATASET_PAGE_SIZE,
            settings,
        })
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[cfg(test)]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn run_input(&self, search: &str) -> RunInput {
        let s = &self.settings;
        RunInput {
            debug_mode: false,
            domain_code: s.domain_code.clone(),
            fast_mode: s.fast_mode,
            max_item_count: s.max_items,
            proxy: ProxyInput {
                use_apify_proxy: s.use_proxy,
                apify_proxy_groups: if s.use_proxy {
                    vec!["RESIDENTIAL".to_string()]
                } else {
                    Vec::new()
                },
            },
            search: search.to_string(),
            search_category: s.search_category.clone(),
            sort_by: s.sort_by.clone(),
        }
    }

    /// Start an actor run. Returns as soon as the run is queued.
    pub async fn start_run(&self, input: &RunInput) -> Result<RunData, ExtractError> {
        let url = format!("{}/v2/acts/{}/runs", self.base_url, self.settings.actor_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;
        let api_resp: ApiResponse<RunData> = check_status(resp).await?.json().await?;
        Ok(api_resp.data)
    }

    /// Long-poll the run until it reaches a terminal status.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunData, ExtractError> {
        loop {
            let url = format!(
                "{}/v2/actor-runs/{}?waitForFinish={}",
                self.base_url, run_id, WAIT_FOR_FINISH_SECS
            );
            let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;
            let api_resp: ApiResponse<RunData> = check_status(resp).await?.json().await?;

            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(ExtractError::RunFailed(api_resp.data.status));
                }
                _ => {
                    debug!(run_id, status = %api_resp.data.status, "Run still in progress");
                }
            }
        }
    }

    /// Read every item of a dataset, one page at a time.
    pub async fn dataset_items(&self, dataset_id: &str) -> Result<Vec<Value>, ExtractError> {
        let mut items = Vec::new();
        let mut offset = 0usize;

        loop {
            let url = format!("{}/v2/datasets/{}/items", self.base_url, dataset_id);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[
                    ("format", "json".to_string()),
                    ("clean", "true".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", self.page_size.to_string()),
                ])
                .send()
                .await?;
            let page: Vec<Value> = check_status(resp).await?.json().await?;
            let n = page.len();
            items.extend(page);
            if n < self.page_size {
                break;
            }
            offset += n;
        }
        Ok(items)
    }
}

#[async_trait]
impl Extractor for ApifyExtractor {
    fn name(&self) -> &'static str {
        "apify"
    }

    async fn extract(&self, query: &str) -> Result<Vec<Value>, ExtractError> {
        info!(actor = %self.settings.actor_id, search = query, "Starting Apify actor run");
        let run = self.start_run(&self.run_input(query)).await?;
        info!(run_id = %run.id, "Actor run started, waiting for it to finish");

        let finished = self.wait_for_run(&run.id).await?;
        let Some(dataset_id) = finished.default_dataset_id.filter(|d| !d.is_empty()) else {
            warn!(run_id = %finished.id, "Run returned no defaultDatasetId, no results");
            return Ok(Vec::new());
        };

        info!(dataset_id = %dataset_id, "Fetching dataset items");
        let items = self.dataset_items(&dataset_id).await?;
        info!(count = items.len(), "Items fetched from Apify");
        Ok(items)
    }
}
