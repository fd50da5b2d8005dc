pub mod apify;
pub mod meli;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use apify::ApifyExtractor;
pub use meli::MeliExtractor;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("actor run ended with status {0}")]
    RunFailed(String),

    #[error("{0} is not set")]
    MissingToken(&'static str),

    #[error("invalid setting: {0}")]
    InvalidSetting(&'static str),
}

/// A source of raw listing records. Records are untyped JSON; the transformer decides what they mean.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, query: &str) -> Result<Vec<Value>, ExtractError>;
}

/// Turn a non-2xx response into [`ExtractError::Api`], keeping the body for the log.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ExtractError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ExtractError::Api {
        status: status.as_u16(),
        message,
    })
}
