mod config;
mod extract;
mod load;
mod pipeline;
mod schema;
mod transform;

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use config::{Config, SourceKind};
use extract::{ApifyExtractor, Extractor, MeliExtractor};
use load::{BigQueryLoader, Loader, NdjsonLoader, SqliteLoader};
use pipeline::Pipeline;
use transform::ProductTransformer;

#[derive(Parser)]
#[command(name = "meli_etl", about = "Mercado Libre listings -> warehouse ETL")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, default_value = "config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sink {
    Bigquery,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, transform and load one search query
    Run {
        /// Override the configured source
        #[arg(short, long)]
        source: Option<SourceKind>,
        #[arg(long, value_enum, default_value = "bigquery")]
        sink: Sink,
        /// Override the configured search query
        #[arg(short, long)]
        query: Option<String>,
        /// Print rows as NDJSON instead of loading them
        #[arg(long)]
        dry_run: bool,
    },
    /// Extract only; write raw records as JSON lines
    Extract {
        #[arg(short, long)]
        source: Option<SourceKind>,
        #[arg(short, long)]
        query: Option<String>,
        #[arg(short, long, default_value = "data/raw.jsonl")]
        out: PathBuf,
    },
    /// Transform raw JSON lines (from `extract`) and print rows as NDJSON
    Transform {
        input: PathBuf,
        #[arg(short, long)]
        source: Option<SourceKind>,
    },
    /// Print the warehouse table schema
    Schema,
    /// Per-run row counts from the SQLite sink
    Runs {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            source,
            sink,
            query,
            dry_run,
        } => {
            let cfg = Config::load(&cli.config)?;
            let kind = source.unwrap_or(cfg.source.kind);
            let query = query.unwrap_or_else(|| cfg.source.search_query.clone());

            let extractor = build_extractor(&cfg, kind)?;
            let loader: Box<dyn Loader> = if dry_run {
                Box::new(NdjsonLoader::stdout())
            } else {
                build_loader(&cfg, sink).await?
            };
            let transformer = ProductTransformer::new(Utc::now(), cfg.default_currency(kind));

            let pipeline = Pipeline::new(extractor, transformer, loader);
            let metrics = pipeline.run(&query).await;
            if !metrics.success {
                eprintln!("Run failed: {}", metrics.errors.join("; "));
                std::process::exit(1);
            }
            eprintln!(
                "JOB_RUN {}: {} extracted, {} loaded, {} rejected.",
                metrics.job_run,
                metrics.products_extracted,
                metrics.products_loaded,
                metrics.products_rejected
            );
            Ok(())
        }
        Commands::Extract { source, query, out } => {
            let cfg = Config::load(&cli.config)?;
            let kind = source.unwrap_or(cfg.source.kind);
            let query = query.unwrap_or_else(|| cfg.source.search_query.clone());

            let records = build_extractor(&cfg, kind)?.extract(&query).await?;
            write_jsonl(&out, &records)?;
            println!("Wrote {} raw records to {}", records.len(), out.display());
            Ok(())
        }
        Commands::Transform { input, source } => {
            let cfg = Config::load_or_default(&cli.config)?;
            let kind = source.unwrap_or(cfg.source.kind);
            let records = read_jsonl(&input)?;
            if records.is_empty() {
                println!("No records in {}.", input.display());
                return Ok(());
            }

            let transformer = ProductTransformer::new(Utc::now(), cfg.default_currency(kind));
            let out = transformer.transform_products(&records);
            NdjsonLoader::stdout().load(&out.rows).await?;
            for r in &out.rejected {
                eprintln!(
                    "  record {} ({}): {}",
                    r.index + 1,
                    r.product_id.as_deref().unwrap_or("no id"),
                    r.error
                );
            }
            eprintln!(
                "{} rows, {} rejected (JOB_RUN {}).",
                out.rows.len(),
                out.rejected.len(),
                transformer.job_run()
            );
            Ok(())
        }
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&schema::bigquery_schema())?);
            eprintln!(
                "partitioned by DAY({}), clustered by {}",
                schema::PARTITION_FIELD,
                schema::CLUSTERING_FIELDS.join(", ")
            );
            Ok(())
        }
        Commands::Runs { limit } => {
            let cfg = Config::load(&cli.config)?;
            let sqlite = SqliteLoader::open(&cfg.sqlite.path, &cfg.sqlite.table)?;
            sqlite.init_schema()?;
            let runs = sqlite.fetch_runs(limit)?;
            if runs.is_empty() {
                println!("No runs loaded yet. Run 'run --sink sqlite' first.");
                return Ok(());
            }

            println!(
                "{:<28} | {:>6} | {:>8} | {:>6} | {:>14}",
                "JOB_RUN", "Rows", "Products", "Priced", "Avg price"
            );
            println!("{}", "-".repeat(74));
            for r in &runs {
                let avg = r
                    .avg_price
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<28} | {:>6} | {:>8} | {:>6} | {:>14}",
                    r.job_run, r.rows, r.distinct_products, r.priced, avg
                );
            }
            println!("\n{} runs", runs.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_extractor(cfg: &Config, kind: SourceKind) -> anyhow::Result<Box<dyn Extractor>> {
    Ok(match kind {
        SourceKind::Apify => Box::new(ApifyExtractor::new(cfg.apify.clone())?),
        SourceKind::Meli => Box::new(MeliExtractor::new(cfg.meli.clone())?),
    })
}

async fn build_loader(cfg: &Config, sink: Sink) -> anyhow::Result<Box<dyn Loader>> {
    Ok(match sink {
        Sink::Bigquery => Box::new(
            BigQueryLoader::connect(&cfg.bigquery)
                .await
                .context("BigQuery client")?,
        ),
        Sink::Sqlite => Box::new(
            SqliteLoader::open(&cfg.sqlite.path, &cfg.sqlite.table)
                .with_context(|| format!("open {}", cfg.sqlite.path.display()))?,
        ),
    })
}

fn write_jsonl(path: &Path, records: &[Value]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for r in records {
        serde_json::to_writer(&mut w, r)?;
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

/// JSON lines, or a single JSON array spanning the whole file.
fn read_jsonl(path: &Path) -> anyhow::Result<Vec<Value>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        lines.push(line?);
    }

    let joined = lines.join("\n");
    if joined.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&joined)?);
    }
    lines
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| serde_json::from_str(l).with_context(|| format!("line {}", i + 1)))
        .collect()
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
