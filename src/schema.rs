use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,1023}$").unwrap());

pub const PARTITION_FIELD: &str = "JOB_RUN";
pub const CLUSTERING_FIELDS: &[&str] = &["brand", "condition", "seller_power_seller_status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Float,
    Integer,
    Json,
    Timestamp,
}

impl ColumnType {
    fn bigquery(self) -> &'static str {
        match self {
            ColumnType::String => "STRING",
            ColumnType::Float => "FLOAT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Json => "JSON",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    fn sqlite(self) -> &'static str {
        match self {
            ColumnType::Float => "REAL",
            ColumnType::Integer => "INTEGER",
            // JSON and timestamps are kept as text locally
            ColumnType::String | ColumnType::Json | ColumnType::Timestamp => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Required,
    Nullable,
    Repeated,
}

impl Mode {
    fn bigquery(self) -> &'static str {
        match self {
            Mode::Required => "REQUIRED",
            Mode::Nullable => "NULLABLE",
            Mode::Repeated => "REPEATED",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
    pub mode: Mode,
}

const fn col(name: &'static str, kind: ColumnType, mode: Mode) -> Column {
    Column { name, kind, mode }
}

/// Output table columns, in the order rows are written.
pub const COLUMNS: &[Column] = &[
    col("product_id", ColumnType::String, Mode::Required),
    col("title", ColumnType::String, Mode::Nullable),
    col("price", ColumnType::Float, Mode::Nullable),
    col("currency_id", ColumnType::String, Mode::Nullable),
    col("condition", ColumnType::String, Mode::Nullable),
    col("category_id", ColumnType::String, Mode::Nullable),
    col("thumbnail_url", ColumnType::String, Mode::Nullable),
    col("permalink", ColumnType::String, Mode::Nullable),
    col("rating", ColumnType::Float, Mode::Nullable),
    col("review_count", ColumnType::Integer, Mode::Nullable),
    // Seller
    col("seller_id", ColumnType::String, Mode::Nullable),
    col("seller_nickname", ColumnType::String, Mode::Nullable),
    col("seller_reputation", ColumnType::Json, Mode::Nullable),
    col("seller_power_seller_status", ColumnType::String, Mode::Nullable),
    // Location
    col("city", ColumnType::String, Mode::Nullable),
    col("state", ColumnType::String, Mode::Nullable),
    // Details
    col("attributes", ColumnType::Json, Mode::Nullable),
    col("pictures", ColumnType::String, Mode::Repeated),
    col("warranty", ColumnType::String, Mode::Nullable),
    col("brand", ColumnType::String, Mode::Nullable),
    col("model", ColumnType::String, Mode::Nullable),
    col("memory", ColumnType::String, Mode::Nullable),
    col("color", ColumnType::String, Mode::Nullable),
    // Metadata
    col("extraction_date", ColumnType::Timestamp, Mode::Required),
    col("JOB_RUN", ColumnType::Timestamp, Mode::Required),
];

/// `{"fields": [...]}` as accepted by the BigQuery REST API.
pub fn bigquery_schema() -> Value {
    let fields: Vec<Value> = COLUMNS
        .iter()
        .map(|c| json!({ "name": c.name, "type": c.kind.bigquery(), "mode": c.mode.bigquery() }))
        .collect();
    json!({ "fields": fields })
}

/// Full table resource for `tables.insert`: schema, day partitioning on JOB_RUN, clustering.
pub fn bigquery_table_resource(project_id: &str, dataset_id: &str, table_id: &str) -> Value {
    json!({
        "tableReference": {
            "projectId": project_id,
            "datasetId": dataset_id,
            "tableId": table_id,
        },
        "schema": bigquery_schema(),
        "timePartitioning": { "type": "DAY", "field": PARTITION_FIELD },
        "clustering": { "fields": CLUSTERING_FIELDS },
    })
}

pub fn sqlite_ddl(table: &str) -> String {
    let cols: Vec<String> = COLUMNS
        .iter()
        .map(|c| {
            let not_null = if c.mode == Mode::Required { " NOT NULL" } else { "" };
            // repeated columns are stored as a JSON array
            let kind = if c.mode == Mode::Repeated { "TEXT" } else { c.kind.sqlite() };
            format!("    {:<28} {}{}", c.name, kind, not_null)
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    id                           INTEGER PRIMARY KEY,\n{},\n    loaded_at                    TEXT NOT NULL DEFAULT (datetime('now'))\n);\nCREATE INDEX IF NOT EXISTS idx_{table}_job_run ON {table}({PARTITION_FIELD});\nCREATE INDEX IF NOT EXISTS idx_{table}_product ON {table}(product_id);",
        cols.join(",\n"),
    )
}

pub fn column_names() -> Vec<&'static str> {
    COLUMNS.iter().map(|c| c.name).collect()
}

/// Table and dataset names end up inside SQL and URLs, so only plain identifiers pass.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENT_RE.is_match(name)
}
