use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use duckdb::Connection;

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub source_dir: PathBuf,
    pub index_dir: PathBuf,
    pub duckdb_path: PathBuf,
    pub product_index_dir: PathBuf,
    pub meta_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SourceFiles {
    pub sdud: PathBuf,
    pub product: PathBuf,
    pub dates: PathBuf,
}

impl SourceFiles {
    /// (view name, parquet path) pairs.
    pub fn views(&self) -> [(&'static str, &Path); 3] {
        [
            ("sdud", self.sdud.as_path()),
            ("product", self.product.as_path()),
            ("dates", self.dates.as_path()),
        ]
    }
}

pub const SOURCE_FILE_NAMES: [&str; 3] = ["sdud.parquet", "product.parquet", "dates.parquet"];

impl StoragePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let source_dir = data_dir.join("source");
        let index_dir = data_dir.join("index");
        let duckdb_path = data_dir.join("sdud.duckdb");
        let product_index_dir = index_dir.join("products");
        let meta_path = data_dir.join("meta.json");

        Self {
            source_dir,
            index_dir,
            duckdb_path,
            product_index_dir,
            meta_path,
        }
    }

    pub fn source_files(&self) -> SourceFiles {
        SourceFiles {
            sdud: self.source_dir.join(SOURCE_FILE_NAMES[0]),
            product: self.source_dir.join(SOURCE_FILE_NAMES[1]),
            dates: self.source_dir.join(SOURCE_FILE_NAMES[2]),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.source_dir)?;
        std::fs::create_dir_all(&self.index_dir)?;
        Ok(())
    }
}

pub fn file_present_nonempty(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.len() > 0,
        Err(_) => false,
    }
}

/// Opens the build's DuckDB file and points the source views at the parquets.
pub fn open_database(paths: &StoragePaths) -> anyhow::Result<Connection> {
    if !file_present_nonempty(&paths.duckdb_path) {
        return Err(anyhow!(
            "DuckDB not found at {}. Run: sdud-explorer build",
            paths.duckdb_path.display()
        ));
    }
    let mut conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    create_or_replace_views(&mut conn, &paths.source_files()).context("create views")?;
    Ok(conn)
}

pub fn create_or_replace_views(conn: &mut Connection, sources: &SourceFiles) -> anyhow::Result<()> {
    for (view, path) in sources.views() {
        let path = sql_quote_path(path);
        conn.execute(
            &format!("CREATE OR REPLACE VIEW {view} AS SELECT * FROM read_parquet('{path}')"),
            [],
        )
        .with_context(|| format!("create view {view}"))?;
    }
    Ok(())
}

fn sql_quote_path(path: &Path) -> String {
    // DuckDB expects single-quoted string literals; escape embedded single quotes.
    path.display().to_string().replace('\'', "''")
}
