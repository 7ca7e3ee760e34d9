use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warehouse_ingest::ingestion::{normalize, LoaderOptions};
use warehouse_ingest::{
    FieldType, LoadOrchestrator, LoadRequest, Record, RestWarehouse, SchemaInference, WarehouseConfig,
};

#[derive(Parser)]
#[command(name = "warehouse-ingest")]
#[command(about = "Shape semi-structured records and load them into a tabular warehouse")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Normalize, type and load a file into a table
    Load {
        #[arg(long)]
        dataset: String,

        #[arg(long)]
        table: String,

        /// .json (array), .ndjson/.jsonl, .csv or .parquet
        #[arg(short, long)]
        input: PathBuf,

        /// Append instead of truncating the table
        #[arg(long)]
        append: bool,

        /// Reuse the schema of this table
        #[arg(long)]
        base_table: Option<String>,

        /// Infer the schema even when the table exists
        #[arg(long)]
        force_schema: bool,

        /// Uniform type for inferred scalar columns (e.g. STRING)
        #[arg(long)]
        force_type: Option<String>,

        /// Source platform name, affects `version` coercion
        #[arg(long)]
        platform: Option<String>,

        /// Stamp each record with a loaded_at timestamp
        #[arg(long)]
        include_loaded_at: bool,

        /// Resolve and print the schema without loading
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the schema inferred from a file
    Infer {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        force_type: Option<String>,

        #[arg(long)]
        platform: Option<String>,
    },
}

enum Input {
    Records(Vec<Record>),
    Frame(DataFrame),
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn read_input(path: &Path) -> Result<Input> {
    match extension(path).as_str() {
        "json" => {
            let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let json: serde_json::Value = serde_json::from_str(&content).context("Invalid JSON input")?;
            let items = match json {
                serde_json::Value::Array(items) => items,
                object @ serde_json::Value::Object(_) => vec![object],
                _ => bail!("JSON input must be an object or an array of objects"),
            };
            let records = items
                .into_iter()
                .map(Record::from_json)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Input::Records(records))
        }
        "ndjson" | "jsonl" => {
            let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let mut records = Vec::new();
            for (idx, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                let json: serde_json::Value =
                    serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", idx + 1))?;
                records.push(Record::from_json(json)?);
            }
            Ok(Input::Records(records))
        }
        "csv" => {
            let frame = LazyCsvReader::new(path)
                .with_has_header(true)
                .finish()
                .context("Failed to read CSV")?
                .collect()
                .context("Failed to collect CSV")?;
            Ok(Input::Frame(frame))
        }
        "parquet" => {
            let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
            let frame = ParquetReader::new(file).finish().context("Failed to read parquet")?;
            Ok(Input::Frame(frame))
        }
        other => bail!("Unsupported input extension '{}'", other),
    }
}

fn parse_force_type(raw: Option<&str>) -> Result<Option<FieldType>> {
    Ok(raw.map(str::parse::<FieldType>).transpose()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Infer {
            input,
            force_type,
            platform,
        } => {
            let records = match read_input(&input)? {
                Input::Records(records) => records,
                Input::Frame(frame) => warehouse_ingest::ingestion::dataframe_to_records(&frame)?,
            };
            let normalized = normalize(&records, platform.as_deref());
            let schema = SchemaInference::with_forced_type(parse_force_type(force_type.as_deref())?).infer(&normalized);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Command::Load {
            dataset,
            table,
            input,
            append,
            base_table,
            force_schema,
            force_type,
            platform,
            include_loaded_at,
            dry_run,
        } => {
            let config = WarehouseConfig::from_env()?;
            let options = LoaderOptions {
                debug: dry_run || config.debug,
                num_retries: config.num_retries,
            };
            info!("Warehouse project: {}", config.project_id);
            let warehouse = Arc::new(RestWarehouse::new(config)?);
            let loader = LoadOrchestrator::with_options(warehouse, options);

            let mut request = LoadRequest::new(dataset, table).with_force_type(parse_force_type(force_type.as_deref())?);
            if append {
                request = request.append();
            }
            if let Some(base) = base_table {
                request = request.with_base_table(base);
            }
            if force_schema {
                request.force_schema = true;
            }
            if let Some(platform) = platform {
                request = request.with_platform(platform);
            }
            if include_loaded_at {
                request = request.with_loaded_at();
            }

            let outcome = match read_input(&input)? {
                Input::Records(records) => loader.load_records(records, &request).await?,
                Input::Frame(frame) => loader.load_dataframe(&frame, &request).await?,
            };

            for warning in &outcome.warnings {
                eprintln!("warning: {}: {}", warning.table, warning.message);
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}
