use std::path::Path;

use anyhow::Context;
use duckdb::{Connection, params};
use serde::Serialize;

use crate::cli::BuildArgs;
use crate::download;
use crate::index;
use crate::query;
use crate::storage::{StoragePaths, create_or_replace_views};

#[derive(Debug, Serialize)]
struct BuildMeta {
    built_at_utc: String,
    duckdb_path: String,
    product_index_dir: String,
    product_count: u64,
    period_count: u64,
    utilization_rows: u64,
    latest_period: Option<String>,
}

pub async fn run(opts: BuildArgs) -> anyhow::Result<()> {
    tracing::info!("sdud-explorer build");
    tracing::info!("data_dir={}", opts.data_dir);
    if opts.offline {
        tracing::info!("offline=true (will not download missing inputs)");
    }
    if opts.force_download {
        tracing::info!("force_download=true (will re-download inputs)");
    }
    if opts.rebuild {
        tracing::info!("rebuild=true (will rebuild tables and index)");
    }

    let paths = StoragePaths::new(&opts.data_dir);
    paths
        .ensure_dirs()
        .context("create backend data directories")?;

    tracing::info!("Step 1/5: ensure inputs (sdud + product + dates parquets)");
    let t0 = std::time::Instant::now();
    let sources = download::ensure_inputs(&paths, &opts).await?;
    tracing::info!(
        "Inputs ready in {:.1}s: sdud={} product={} dates={}",
        t0.elapsed().as_secs_f64(),
        sources.sdud.display(),
        sources.product.display(),
        sources.dates.display()
    );

    tracing::info!("Step 2/5: open DuckDB + create parquet views");
    let t1 = std::time::Instant::now();
    let mut conn = Connection::open(&paths.duckdb_path)
        .with_context(|| format!("open duckdb at {}", paths.duckdb_path.display()))?;
    let _ = conn.execute("PRAGMA threads=4", []);
    create_or_replace_views(&mut conn, &sources).context("create views")?;
    tracing::info!(
        "DuckDB ready in {:.1}s: {}",
        t1.elapsed().as_secs_f64(),
        paths.duckdb_path.display()
    );

    tracing::info!("Step 3/5: check source tables");
    check_sources(&conn).context("validate source views")?;

    tracing::info!("Step 4/5: build rollups (product_totals + product_search)");
    if opts.rebuild || !table_exists(&mut conn, "product_search")? {
        rebuild_product_rollups(&mut conn).context("build product rollups")?;
    } else {
        tracing::info!("DuckDB table product_search already exists; skipping");
    }

    tracing::info!("Step 5/5: build product search index (Tantivy)");
    index::products::build_product_index(&conn, &paths.product_index_dir, opts.rebuild)
        .context("build product tantivy index")?;

    let periods = query::list_periods(&conn).context("list periods")?;
    let meta = BuildMeta {
        built_at_utc: chrono::Utc::now().to_rfc3339(),
        duckdb_path: paths.duckdb_path.display().to_string(),
        product_index_dir: paths.product_index_dir.display().to_string(),
        product_count: query::count_rows(&conn, "product")?,
        period_count: periods.len() as u64,
        utilization_rows: query::count_rows(&conn, "sdud")?,
        latest_period: periods.last().map(|p| p.formatted_date.clone()),
    };
    write_json(&paths.meta_path, &meta).context("write meta.json")?;

    tracing::info!("Build complete.");
    tracing::info!("DuckDB: {}", paths.duckdb_path.display());
    tracing::info!("Product index: {}", paths.product_index_dir.display());

    Ok(())
}

const REQUIRED_COLUMNS: [(&str, &[&str]); 3] = [
    (
        "sdud",
        &[
            "date_id",
            "product_id",
            "state",
            "is_ffsu",
            "units",
            "rx_count",
            "total",
            "medicaid_reimbursed",
            "nadac",
        ],
    ),
    ("product", &["product_id", "product"]),
    ("dates", &["date_id", "year", "quarter", "formatted_date"]),
];

/// Fails early when a source parquet is missing a column the queries read.
fn check_sources(conn: &Connection) -> anyhow::Result<()> {
    for (view, required) in REQUIRED_COLUMNS {
        let columns = column_names(conn, view)?;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|c| !columns.iter().any(|have| have == c))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("{view} is missing columns: {}", missing.join(", "));
        }
    }
    Ok(())
}

fn column_names(conn: &Connection, view: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("SELECT name FROM pragma_table_info('{view}') ORDER BY cid"))
        .with_context(|| format!("prepare pragma_table_info for {view}"))?;
    let rows = stmt.query_map([], |row| row.get::<usize, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// All-time sums per product, joined onto the product dimension for search.
pub(crate) fn rebuild_product_rollups(conn: &mut Connection) -> anyhow::Result<()> {
    tracing::info!(
        "Building product_totals (this will scan the sdud parquet; can take a while)..."
    );
    conn.execute("DROP TABLE IF EXISTS product_totals", [])?;
    conn.execute(
        r#"
        CREATE TABLE product_totals AS
        SELECT
          CAST(product_id AS BIGINT) AS product_id,
          CAST(SUM(total) AS DOUBLE) AS paid_total,
          CAST(SUM(units) AS DOUBLE) AS units_total,
          CAST(SUM(rx_count) AS DOUBLE) AS rx_total
        FROM sdud
        WHERE product_id IS NOT NULL
        GROUP BY 1
    "#,
        [],
    )?;

    tracing::info!("Building product_search (joining product + product_totals)...");
    conn.execute("DROP TABLE IF EXISTS product_search", [])?;
    conn.execute(
        r#"
        CREATE TABLE product_search AS
        SELECT
          CAST(p.product_id AS BIGINT) AS product_id,
          TRIM(p.product) AS product,
          COALESCE(t.paid_total, 0) AS paid_total,
          COALESCE(t.units_total, 0) AS units_total,
          COALESCE(t.rx_total, 0) AS rx_total
        FROM product p
        LEFT JOIN product_totals t ON t.product_id = CAST(p.product_id AS BIGINT)
        WHERE p.product_id IS NOT NULL AND p.product IS NOT NULL AND TRIM(p.product) <> ''
    "#,
        [],
    )?;
    Ok(())
}

fn table_exists(conn: &mut Connection, name: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(
        r#"
        SELECT COUNT(*)::BIGINT
        FROM information_schema.tables
        WHERE table_schema = 'main' AND table_name = ? AND table_type = 'BASE TABLE'
    "#,
    )?;
    let count: i64 = stmt.query_row(params![name], |row| row.get(0))?;
    Ok(count > 0)
}

fn write_json(path: &Path, v: &impl Serialize) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let s = serde_json::to_string_pretty(v)?;
    std::fs::write(path, s)?;
    Ok(())
}
