use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::extract::Extractor;
use crate::load::Loader;
use crate::transform::ProductTransformer;

/// What one run did. Always produced, even when a stage failed.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    #[serde(rename = "JOB_RUN")]
    pub job_run: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub products_extracted: usize,
    pub products_transformed: usize,
    pub products_rejected: usize,
    pub products_loaded: usize,
    pub success: bool,
    pub errors: Vec<String>,
}

impl RunMetrics {
    fn new(job_run: DateTime<Utc>) -> Self {
        Self {
            job_run,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: 0.0,
            products_extracted: 0,
            products_transformed: 0,
            products_rejected: 0,
            products_loaded: 0,
            success: false,
            errors: Vec::new(),
        }
    }

    pub fn log(&self) {
        info!("=== Run metrics ===");
        info!("JOB_RUN: {}", self.job_run);
        info!("Duration: {:.2}s", self.duration_seconds);
        info!("Products extracted: {}", self.products_extracted);
        info!("Products transformed: {}", self.products_transformed);
        info!("Products rejected: {}", self.products_rejected);
        info!("Products loaded: {}", self.products_loaded);
        info!("Success: {}", self.success);
        for e in &self.errors {
            error!("- {}", e);
        }
    }
}

/// Extract -> transform -> load, once, under a single JOB_RUN.
pub struct Pipeline {
    extractor: Box<dyn Extractor>,
    transformer: ProductTransformer,
    loader: Box<dyn Loader>,
}

impl Pipeline {
    pub fn new(
        extractor: Box<dyn Extractor>,
        transformer: ProductTransformer,
        loader: Box<dyn Loader>,
    ) -> Self {
        Self {
            extractor,
            transformer,
            loader,
        }
    }

    pub fn job_run(&self) -> DateTime<Utc> {
        self.transformer.job_run()
    }

    pub async fn run(&self, query: &str) -> RunMetrics {
        let t0 = Instant::now();
        let mut metrics = RunMetrics::new(self.job_run());
        info!(
            job_run = %metrics.job_run,
            source = self.extractor.name(),
            sink = self.loader.name(),
            "Starting ETL pipeline"
        );

        if let Err(e) = self.run_stages(query, &mut metrics).await {
            let msg = format!("{:#}", e);
            error!("Pipeline failed: {}", msg);
            metrics.errors.push(msg);
        }

        metrics.end_time = Some(Utc::now());
        metrics.duration_seconds = t0.elapsed().as_secs_f64();
        metrics.log();
        metrics
    }

    async fn run_stages(&self, query: &str, metrics: &mut RunMetrics) -> anyhow::Result<()> {
        info!(query, "Extracting");
        let raw = self
            .extractor
            .extract(query)
            .await
            .with_context(|| format!("extract from {}", self.extractor.name()))?;
        metrics.products_extracted = raw.len();
        info!("Extracted {} products", raw.len());

        if raw.is_empty() {
            warn!("No products found");
            metrics.success = true;
            return Ok(());
        }

        info!("Transforming");
        let out = self.transformer.transform_products(&raw);
        metrics.products_transformed = out.rows.len();
        metrics.products_rejected = out.rejected.len();
        info!(
            "Transformed {} products ({} rejected)",
            out.rows.len(),
            out.rejected.len()
        );

        info!("Loading into {}", self.loader.name());
        self.loader
            .ensure_table()
            .await
            .context("prepare destination table")?;
        metrics.products_loaded = self.loader.load(&out.rows).await.context("load rows")?;

        metrics.success = true;
        info!(job_run = %metrics.job_run, "Pipeline finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractError;
    use crate::load::{LoadError, SqliteLoader};
    use crate::transform::ProductRow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedExtractor(Vec<Value>);

    #[async_trait]
    impl Extractor for FixedExtractor {
        fn name(&self) -> &'static str {
            "fixed"
        }
        async fn extract(&self, _query: &str) -> Result<Vec<Value>, ExtractError> {
            Ok(self.0.clone())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl Extractor for FailingExtractor {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn extract(&self, _query: &str) -> Result<Vec<Value>, ExtractError> {
            Err(ExtractError::Api {
                status: 503,
                message: "unavailable".into(),
            })
        }
    }

    /// Counts calls so tests can see which stages ran.
    #[derive(Default, Clone)]
    struct CountingLoader {
        ensured: Arc<AtomicUsize>,
        loaded: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Loader for CountingLoader {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn ensure_table(&self) -> Result<(), LoadError> {
            self.ensured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn load(&self, rows: &[ProductRow]) -> Result<usize, LoadError> {
            if self.fail {
                return Err(LoadError::Api {
                    status: 403,
                    message: "access denied".into(),
                });
            }
            self.loaded.fetch_add(rows.len(), Ordering::SeqCst);
            Ok(rows.len())
        }
    }

    fn transformer() -> ProductTransformer {
        ProductTransformer::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(), Some("ARS"))
    }

    fn records() -> Vec<Value> {
        vec![
            json!({ "id": "MLA1", "title": "Uno", "price": "$ 1.000" }),
            json!({ "title": "sin id" }),
            json!({ "id": "MLA2", "title": "Dos", "price": 2500 }),
        ]
    }

    #[tokio::test]
    async fn successful_run() {
        let loader = CountingLoader::default();
        let p = Pipeline::new(
            Box::new(FixedExtractor(records())),
            transformer(),
            Box::new(loader.clone()),
        );
        let m = p.run("iphone").await;

        assert!(m.success);
        assert!(m.errors.is_empty());
        assert_eq!(m.products_extracted, 3);
        assert_eq!(m.products_transformed, 2);
        assert_eq!(m.products_rejected, 1);
        assert_eq!(m.products_loaded, 2);
        assert_eq!(loader.ensured.load(Ordering::SeqCst), 1);
        assert!(m.end_time.is_some());
    }

    #[tokio::test]
    async fn empty_extraction_skips_load() {
        let loader = CountingLoader::default();
        let p = Pipeline::new(
            Box::new(FixedExtractor(Vec::new())),
            transformer(),
            Box::new(loader.clone()),
        );
        let m = p.run("nothing").await;

        assert!(m.success);
        assert_eq!(m.products_loaded, 0);
        assert_eq!(loader.ensured.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn extract_failure_is_recorded() {
        let loader = CountingLoader::default();
        let p = Pipeline::new(Box::new(FailingExtractor), transformer(), Box::new(loader.clone()));
        let m = p.run("iphone").await;

        assert!(!m.success);
        assert_eq!(m.errors.len(), 1);
        assert!(m.errors[0].contains("extract from failing"));
        assert!(m.errors[0].contains("503"));
        assert_eq!(loader.loaded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_failure_is_recorded() {
        let loader = CountingLoader {
            fail: true,
            ..CountingLoader::default()
        };
        let p = Pipeline::new(Box::new(FixedExtractor(records())), transformer(), Box::new(loader));
        let m = p.run("iphone").await;

        assert!(!m.success);
        assert_eq!(m.products_transformed, 2);
        assert_eq!(m.products_loaded, 0);
        assert!(m.errors[0].contains("access denied"));
    }

    #[tokio::test]
    async fn every_row_shares_job_run() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("meli.sqlite");
        let sqlite = SqliteLoader::open(&db, "products").unwrap();
        let p = Pipeline::new(Box::new(FixedExtractor(records())), transformer(), Box::new(sqlite));
        let m = p.run("iphone").await;
        assert!(m.success);
        assert_eq!(m.products_loaded, 2);

        let runs = SqliteLoader::open(&db, "products").unwrap().fetch_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].rows, 2);
        assert_eq!(runs[0].job_run, "2024-05-01T12:00:00.000000Z");
    }
}
