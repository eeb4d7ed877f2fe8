use std::path::Path;

use anyhow::{Context, anyhow};
use duckdb::Connection;
use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, Query, QueryParser};
use tantivy::schema::{Field, NumericOptions, STORED, Schema, TEXT, Value};
use tantivy::{DocAddress, Index, IndexReader, Order, Score, TantivyDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Relevance,
    PaidDesc,
    PaidAsc,
    UnitsDesc,
    NameAsc,
}

impl Sort {
    /// Absent means relevance; an unrecognised name is an error.
    pub fn parse(s: Option<&str>) -> anyhow::Result<Self> {
        let Some(raw) = s.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Sort::Relevance);
        };
        match raw.to_ascii_lowercase().as_str() {
            "relevance" => Ok(Sort::Relevance),
            "paid_desc" => Ok(Sort::PaidDesc),
            "paid_asc" => Ok(Sort::PaidAsc),
            "units_desc" => Ok(Sort::UnitsDesc),
            "name_asc" => Ok(Sort::NameAsc),
            _ => Err(anyhow!(
                "Unknown sort '{raw}' (expected relevance, paid_desc, paid_asc, units_desc or name_asc)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductSearchQuery {
    pub q: Option<String>,
    pub sort: Sort,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductHit {
    pub product_id: i64,
    pub product: String,
    pub paid_total: f64,
    pub units_total: f64,
    pub rx_total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductSearchResponse {
    pub total_hits: usize,
    pub hits: Vec<ProductHit>,
}

#[derive(Clone)]
pub struct ProductEngine {
    reader: IndexReader,
    fields: ProductFields,
    query_parser: QueryParser,
}

#[derive(Debug, Clone)]
struct ProductFields {
    product_id: Field,
    product: Field,
    paid_total: Field,
    units_total: Field,
    rx_total: Field,
    name_rank: Field,
}

impl ProductEngine {
    pub fn open(index_dir: &Path) -> anyhow::Result<Self> {
        let dir = MmapDirectory::open(index_dir)
            .with_context(|| format!("open index dir {}", index_dir.display()))?;
        let index = Index::open(dir).context("open tantivy index")?;
        let schema = index.schema();
        let fields = product_fields(&schema)?;

        let reader = index.reader().context("create index reader")?;
        let mut query_parser = QueryParser::for_index(&index, vec![fields.product]);
        // "metformin er" should narrow, not widen
        query_parser.set_conjunction_by_default();

        Ok(Self {
            reader,
            fields,
            query_parser,
        })
    }

    pub fn search(&self, q: ProductSearchQuery) -> anyhow::Result<ProductSearchResponse> {
        let searcher = self.reader.searcher();
        let query = self.build_query(q.q.as_deref())?;
        let total_hits = searcher
            .search(&query, &tantivy::collector::Count)
            .context("count hits")?;

        let page_size = q.page_size.clamp(1, 200);
        let offset = q.page.saturating_mul(page_size);
        let top = TopDocs::with_limit(page_size).and_offset(offset);

        let doc_addrs: Vec<DocAddress> = match q.sort {
            Sort::Relevance => {
                let top_docs: Vec<(Score, DocAddress)> =
                    searcher.search(&query, &top).context("tantivy search")?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::PaidDesc => {
                let top_docs: Vec<(f64, DocAddress)> = searcher.search(
                    &query,
                    &top.order_by_fast_field::<f64>("paid_total", Order::Desc),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::PaidAsc => {
                let top_docs: Vec<(f64, DocAddress)> = searcher.search(
                    &query,
                    &top.order_by_fast_field::<f64>("paid_total", Order::Asc),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::UnitsDesc => {
                let top_docs: Vec<(f64, DocAddress)> = searcher.search(
                    &query,
                    &top.order_by_fast_field::<f64>("units_total", Order::Desc),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
            Sort::NameAsc => {
                let top_docs: Vec<(i64, DocAddress)> = searcher.search(
                    &query,
                    &top.order_by_fast_field::<i64>("name_rank", Order::Asc),
                )?;
                top_docs.into_iter().map(|(_, a)| a).collect()
            }
        };

        let hits = doc_addrs
            .into_iter()
            .map(|addr| self.doc_to_hit(&searcher, addr))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ProductSearchResponse { total_hits, hits })
    }

    fn build_query(&self, q: Option<&str>) -> anyhow::Result<Box<dyn Query>> {
        match q.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Box::new(AllQuery)),
            Some(s) => Ok(self.query_parser.parse_query(s).context("parse query")?),
        }
    }

    fn doc_to_hit(
        &self,
        searcher: &tantivy::Searcher,
        addr: DocAddress,
    ) -> anyhow::Result<ProductHit> {
        let doc: TantivyDocument = searcher.doc(addr)?;
        let product_id = doc
            .get_first(self.fields.product_id)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("missing product_id in doc"))?;
        let product = doc
            .get_first(self.fields.product)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing product name in doc {product_id}"))?
            .to_string();

        Ok(ProductHit {
            product_id,
            product,
            paid_total: doc
                .get_first(self.fields.paid_total)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            units_total: doc
                .get_first(self.fields.units_total)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            rx_total: doc
                .get_first(self.fields.rx_total)
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        })
    }
}

/// Indexes `product_search` into `index_dir`. A `_SUCCESS` marker records a
/// completed build; a directory without it is treated as a failed build.
pub fn build_product_index(
    conn: &Connection,
    index_dir: &Path,
    rebuild: bool,
) -> anyhow::Result<()> {
    let success_marker = index_dir.join("_SUCCESS");
    if index_dir.exists() && !rebuild {
        if success_marker.exists() {
            tracing::info!(
                "Product index already exists at {}; skipping",
                index_dir.display()
            );
            return Ok(());
        }
        tracing::info!(
            "Product index dir exists but is missing {} (previous build likely failed); rebuilding",
            success_marker.display()
        );
        std::fs::remove_dir_all(index_dir)
            .with_context(|| format!("remove {}", index_dir.display()))?;
    } else if rebuild && index_dir.exists() {
        std::fs::remove_dir_all(index_dir)
            .with_context(|| format!("remove {}", index_dir.display()))?;
    }
    std::fs::create_dir_all(index_dir).with_context(|| format!("mkdir {}", index_dir.display()))?;

    let index = Index::create_in_dir(index_dir, product_schema()).context("create product index")?;
    let mut writer = index
        .writer_with_num_threads(2, 128_000_000)
        .context("create index writer")?;
    let fields = product_fields(&index.schema())?;

    let sql = r#"
        SELECT
          CAST(product_id AS BIGINT),
          product,
          paid_total,
          units_total,
          rx_total,
          CAST(ROW_NUMBER() OVER (ORDER BY lower(product), product, product_id) AS BIGINT)
        FROM product_search
    "#;
    let mut stmt = conn.prepare(sql).context("prepare product_search scan")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<usize, Option<i64>>(0)?,
            row.get::<usize, Option<String>>(1)?,
            row.get::<usize, Option<f64>>(2)?,
            row.get::<usize, Option<f64>>(3)?,
            row.get::<usize, Option<f64>>(4)?,
            row.get::<usize, i64>(5)?,
        ))
    })?;

    let mut count: u64 = 0;
    let mut skipped: u64 = 0;
    for r in rows {
        let (id, name, paid, units, rx, rank) = r?;
        let (Some(id), Some(name)) = (id, name.as_deref().map(str::trim).filter(|s| !s.is_empty()))
        else {
            skipped += 1;
            continue;
        };

        let mut doc = tantivy::doc!();
        doc.add_i64(fields.product_id, id);
        doc.add_text(fields.product, name);
        doc.add_f64(fields.paid_total, paid.unwrap_or(0.0));
        doc.add_f64(fields.units_total, units.unwrap_or(0.0));
        doc.add_f64(fields.rx_total, rx.unwrap_or(0.0));
        doc.add_i64(fields.name_rank, rank);

        writer.add_document(doc)?;
        count += 1;
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} products with NULL id or empty name", skipped);
    }
    tracing::info!("Committing product index ({} docs)...", count);
    writer.commit().context("commit product index")?;

    let _ = std::fs::write(&success_marker, "ok\n");
    Ok(())
}

fn product_schema() -> Schema {
    let mut b = Schema::builder();
    b.add_i64_field(
        "product_id",
        NumericOptions::default().set_indexed().set_stored(),
    );
    b.add_text_field("product", TEXT | STORED);

    let f64o = NumericOptions::default()
        .set_fast()
        .set_indexed()
        .set_stored();
    b.add_f64_field("paid_total", f64o.clone());
    b.add_f64_field("units_total", f64o.clone());
    b.add_f64_field("rx_total", f64o);
    // position in case-insensitive name order, assigned at build time
    b.add_i64_field("name_rank", NumericOptions::default().set_fast());

    b.build()
}

fn product_fields(schema: &Schema) -> anyhow::Result<ProductFields> {
    Ok(ProductFields {
        product_id: schema.get_field("product_id")?,
        product: schema.get_field("product")?,
        paid_total: schema.get_field("paid_total")?,
        units_total: schema.get_field("units_total")?,
        rx_total: schema.get_field("rx_total")?,
        name_rank: schema.get_field("name_rank")?,
    })
}
