//! Run configuration.
//!
//! Read from a TOML file (`config/config.toml` by default), then overridden by
//! environment variables so deployments can keep the file generic:
//!
//! - `GCP_PROJECT_ID`, `BQ_DATASET_ID`, `BQ_TABLE_ID` - warehouse table
//! - `BQ_ACCESS_TOKEN` - bearer token for BigQuery
//! - `APIFY_TOKEN` - Apify API token
//! - `MELI_ACCESS_TOKEN` - optional Mercado Libre API token

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

use crate::transform::price::{site_currency, site_for_domain};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Apify scraping actor
    Apify,
    /// Mercado Libre public API
    Meli,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub apify: ApifyConfig,
    pub meli: MeliConfig,
    pub bigquery: BigQueryConfig,
    pub sqlite: SqliteConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub search_query: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Apify,
            search_query: "iphone".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApifyConfig {
    pub token: Option<String>,
    pub actor_id: String,
    pub domain_code: String,
    pub max_items: u32,
    pub search_category: String,
    pub sort_by: String,
    pub fast_mode: bool,
    pub use_proxy: bool,
}

impl Default for ApifyConfig {
    fn default() -> Self {
        Self {
            token: None,
            actor_id: "q0PB9Xd1hjynYAEhi".to_string(),
            domain_code: "AR".to_string(),
            max_items: 50,
            search_category: "all".to_string(),
            sort_by: "relevance".to_string(),
            fast_mode: false,
            use_proxy: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeliConfig {
    pub site_id: String,
    pub limit_per_page: usize,
    pub max_products: usize,
    pub request_delay_ms: u64,
    pub access_token: Option<String>,
}

impl Default for MeliConfig {
    fn default() -> Self {
        Self {
            site_id: "MLA".to_string(),
            limit_per_page: 50,
            max_products: 200,
            request_delay_ms: 500,
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    /// Dataset location, e.g. `US`; needed to poll jobs outside the default region.
    pub location: Option<String>,
    pub access_token: Option<String>,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            dataset_id: "meli".to_string(),
            table_id: "products".to_string(),
            location: None,
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    pub table: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/meli.sqlite"),
            table: "products".to_string(),
        }
    }
}

impl Config {
    /// Read `path` and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means defaults. A file that exists must parse.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                let mut config = Self::default();
                config.apply_env_overrides(|key| std::env::var(key).ok());
                Ok(config)
            }
            other => other,
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Overlay values from `lookup` (the process environment in production). Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GCP_PROJECT_ID") {
            self.bigquery.project_id = v;
        }
        if let Some(v) = get("BQ_DATASET_ID") {
            self.bigquery.dataset_id = v;
        }
        if let Some(v) = get("BQ_TABLE_ID") {
            self.bigquery.table_id = v;
        }
        if let Some(v) = get("BQ_ACCESS_TOKEN") {
            self.bigquery.access_token = Some(v);
        }
        if let Some(v) = get("APIFY_TOKEN") {
            self.apify.token = Some(v);
        }
        if let Some(v) = get("MELI_ACCESS_TOKEN") {
            self.meli.access_token = Some(v);
        }
    }

    /// Currency assumed for records that carry none, from the marketplace site being scraped.
    pub fn default_currency(&self, kind: SourceKind) -> Option<&'static str> {
        match kind {
            SourceKind::Meli => site_currency(&self.meli.site_id),
            SourceKind::Apify => site_for_domain(&self.apify.domain_code).and_then(site_currency),
        }
    }
}
