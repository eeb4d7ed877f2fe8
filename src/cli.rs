use clap::{Parser, Subcommand};

use crate::model::DEFAULT_PRODUCT;

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "sdud-explorer")]
#[command(about = "Drug pricing explorer backend over State Drug Utilization Data (DuckDB + Tantivy)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch inputs (if missing), build DuckDB rollups and the product search index.
    Build(BuildArgs),
    /// Serve the HTTP API (requires a completed build).
    Serve(ServeArgs),
    /// Print the state-level aggregation for one product and period as JSON.
    Map(MapArgs),
    /// Print one state's quarterly NADAC vs payment series as JSON.
    Series(SeriesArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct BuildArgs {
    /// Backend data directory (source parquets, DuckDB DB, search index).
    #[arg(long, env = "SDUD_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Local directory holding sdud.parquet, product.parquet and dates.parquet.
    #[arg(long, env = "SDUD_SOURCE_DIR")]
    pub source_dir: Option<String>,

    /// Base URL the three parquet files are downloaded from (`<base-url>/sdud.parquet`, ...).
    #[arg(long, env = "SDUD_BASE_URL")]
    pub base_url: Option<String>,

    /// Do not download missing inputs; error instead.
    #[arg(long)]
    pub offline: bool,

    /// Re-download inputs even if they already exist.
    #[arg(long)]
    pub force_download: bool,

    /// Rebuild DuckDB tables and the search index even if they already exist.
    #[arg(long)]
    pub rebuild: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Backend data directory (DuckDB DB and search index).
    #[arg(long, env = "SDUD_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    #[arg(long, env = "SDUD_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "SDUD_PORT", default_value_t = 8787)]
    pub port: u16,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MapArgs {
    #[arg(long, env = "SDUD_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Exact product name.
    #[arg(long, default_value = DEFAULT_PRODUCT)]
    pub product: String,

    /// Reporting period label; defaults to the most recent period.
    #[arg(long)]
    pub date: Option<String>,

    /// Facility filter: FFSU, Non-FFSU (repeat or comma-separate). Defaults to both.
    #[arg(long, value_delimiter = ',')]
    pub ffsu: Option<Vec<String>>,

    #[arg(long, default_value = "markup_per_unit")]
    pub metric: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SeriesArgs {
    #[arg(long, env = "SDUD_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Two-letter state code.
    #[arg(long)]
    pub state: String,

    /// Exact product name.
    #[arg(long, default_value = DEFAULT_PRODUCT)]
    pub product: String,

    /// Facility filter: FFSU, Non-FFSU (repeat or comma-separate). Defaults to both.
    #[arg(long, value_delimiter = ',')]
    pub ffsu: Option<Vec<String>>,
}
