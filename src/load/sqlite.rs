use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::Connection;
use tracing::info;

use super::{LoadError, Loader};
use crate::schema;
use crate::transform::ProductRow;

/// Local stand-in for the warehouse: same columns, JSON and repeated fields kept as JSON text.
pub struct SqliteLoader {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteLoader {
    pub fn open(path: &Path, table: &str) -> Result<Self, LoadError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, table)
    }

    pub fn with_connection(conn: Connection, table: &str) -> Result<Self, LoadError> {
        if !schema::is_valid_identifier(table) {
            return Err(LoadError::InvalidIdentifier(table.to_string()));
        }
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn init_schema(&self) -> Result<(), LoadError> {
        self.conn().execute_batch(&schema::sqlite_ddl(&self.table))?;
        Ok(())
    }

    pub fn insert_rows(&self, rows: &[ProductRow]) -> Result<usize, LoadError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let columns = schema::column_names();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table,
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            for r in rows {
                let reputation = r.seller_reputation.as_ref().map(|v| v.to_string());
                let attributes = r.attributes.as_ref().map(|v| v.to_string());
                let pictures = serde_json::to_string(&r.pictures)?;
                count += stmt.execute(rusqlite::params![
                    r.product_id,
                    r.title,
                    r.price,
                    r.currency_id,
                    r.condition,
                    r.category_id,
                    r.thumbnail_url,
                    r.permalink,
                    r.rating,
                    r.review_count,
                    r.seller_id,
                    r.seller_nickname,
                    reputation,
                    r.seller_power_seller_status,
                    r.city,
                    r.state,
                    attributes,
                    pictures,
                    r.warranty,
                    r.brand,
                    r.model,
                    r.memory,
                    r.color,
                    timestamp(&r.extraction_date),
                    timestamp(&r.job_run),
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Row counts per pipeline run, newest first.
    pub fn fetch_runs(&self, limit: usize) -> Result<Vec<RunSummary>, LoadError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT JOB_RUN, COUNT(*), COUNT(DISTINCT product_id), COUNT(price), AVG(price)
             FROM {}
             GROUP BY JOB_RUN
             ORDER BY JOB_RUN DESC
             LIMIT {}",
            self.table, limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunSummary {
                    job_run: row.get(0)?,
                    rows: row.get(1)?,
                    distinct_products: row.get(2)?,
                    priced: row.get(3)?,
                    avg_price: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub struct RunSummary {
    pub job_run: String,
    pub rows: usize,
    pub distinct_products: usize,
    pub priced: usize,
    pub avg_price: Option<f64>,
}

fn timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl Loader for SqliteLoader {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_table(&self) -> Result<(), LoadError> {
        self.init_schema()
    }

    async fn load(&self, rows: &[ProductRow]) -> Result<usize, LoadError> {
        if rows.is_empty() {
            info!("No products to load");
            return Ok(0);
        }
        let n = self.insert_rows(rows)?;
        info!(table = %self.table, rows = n, job_run = %rows[0].job_run, "Rows appended to SQLite");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::tests::sample_row;
    use chrono::{Duration, TimeZone, Utc};

    fn loader() -> SqliteLoader {
        let l = SqliteLoader::with_connection(Connection::open_in_memory().unwrap(), "products").unwrap();
        l.init_schema().unwrap();
        l
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let l = loader();
        let n = l.load(&[sample_row("A"), sample_row("B")]).await.unwrap();
        assert_eq!(n, 2);

        let conn = l.conn();
        let (pictures, rep, job_run): (String, String, String) = conn
            .query_row(
                "SELECT pictures, seller_reputation, JOB_RUN FROM products WHERE product_id = 'A'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(pictures, r#"["https://http2.mlstatic.com/a.jpg"]"#);
        assert!(rep.contains("5_green"));
        assert_eq!(job_run, "2024-05-01T12:00:00.000000Z");
    }

    #[tokio::test]
    async fn appends_never_replace() {
        let l = loader();
        l.load(&[sample_row("A")]).await.unwrap();
        l.load(&[sample_row("A")]).await.unwrap();
        let n: usize = l
            .conn()
            .query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn empty_load_is_noop() {
        let l = SqliteLoader::with_connection(Connection::open_in_memory().unwrap(), "products").unwrap();
        // table never created: an empty load must not touch it
        assert_eq!(l.load(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn runs_grouped_by_job_run() {
        let l = loader();
        let mut later = sample_row("C");
        later.job_run = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::hours(1);
        later.price = None;
        l.load(&[sample_row("A"), sample_row("B")]).await.unwrap();
        l.load(&[later]).await.unwrap();

        let runs = l.fetch_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].rows, 1);
        assert_eq!(runs[0].priced, 0);
        assert_eq!(runs[0].avg_price, None);
        assert_eq!(runs[1].rows, 2);
        assert_eq!(runs[1].distinct_products, 2);
        assert_eq!(runs[1].avg_price, Some(1_299_999.0));
    }

    #[test]
    fn rejects_bad_table_name() {
        let err = SqliteLoader::with_connection(Connection::open_in_memory().unwrap(), "p; DROP").err().unwrap();
        assert!(matches!(err, LoadError::InvalidIdentifier(_)));
    }

    #[test]
    fn open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/meli.sqlite");
        let l = SqliteLoader::open(&path, "products").unwrap();
        l.init_schema().unwrap();
        assert!(path.exists());
    }
}
