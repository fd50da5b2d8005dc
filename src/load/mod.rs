pub mod bigquery;
pub mod sqlite;

use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::transform::ProductRow;

pub use bigquery::BigQueryLoader;
pub use sqlite::SqliteLoader;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("load job {job_id} failed: {message}")]
    Job { job_id: String, message: String },

    #[error("no access token: {0}")]
    Token(String),

    #[error("invalid table identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends rows to the warehouse table.
#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the destination table when it does not exist yet.
    async fn ensure_table(&self) -> Result<(), LoadError>;

    /// Append all rows in one operation. Returns the number of rows written.
    async fn load(&self, rows: &[ProductRow]) -> Result<usize, LoadError>;
}

/// Writes rows as newline-delimited JSON instead of loading them; used for dry runs.
pub struct NdjsonLoader {
    out: Mutex<Box<dyn Write + Send>>,
}

impl NdjsonLoader {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

#[async_trait]
impl Loader for NdjsonLoader {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    async fn ensure_table(&self) -> Result<(), LoadError> {
        Ok(())
    }

    async fn load(&self, rows: &[ProductRow]) -> Result<usize, LoadError> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            serde_json::to_writer(&mut *out, row)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(rows.len())
    }
}

/// Rows as newline-delimited JSON, the body format of a warehouse load job.
pub fn to_ndjson(rows: &[ProductRow]) -> Result<String, LoadError> {
    let mut buf = String::new();
    for row in rows {
        buf.push_str(&serde_json::to_string(row)?);
        buf.push('\n');
    }
    Ok(buf)
}
