use std::collections::BTreeMap;

use chrono::NaiveDate;
use duckdb::{Connection, OptionalExt, params};
use serde::Serialize;

use crate::error::{QueryError, Result};
use crate::model::{
    FfsuFilter, MAP_DECIMALS, PerUnit, Period, Product, SERIES_DECIMALS, Totals, quarter_month,
    quarter_start,
};

/// One state on the map: raw sums plus ratios derived from those sums.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateRow {
    pub state: String,
    #[serde(flatten)]
    pub totals: Totals,
    #[serde(flatten)]
    pub per_unit: PerUnit,
}

/// One quarter of a state time series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: u8,
    #[serde(flatten)]
    pub totals: Totals,
    #[serde(flatten)]
    pub per_unit: PerUnit,
}

pub fn product_id_by_name(db: &Connection, name: &str) -> Result<i64> {
    let mut stmt =
        db.prepare("SELECT CAST(product_id AS BIGINT) FROM product WHERE product = ? LIMIT 1")?;
    stmt.query_row([name], |row| row.get::<usize, i64>(0))
        .optional()?
        .ok_or_else(|| QueryError::UnknownProduct(name.to_string()))
}

pub fn date_id_by_label(db: &Connection, label: &str) -> Result<i64> {
    let mut stmt = db
        .prepare("SELECT CAST(date_id AS BIGINT) FROM dates WHERE formatted_date = ? LIMIT 1")?;
    stmt.query_row([label], |row| row.get::<usize, i64>(0))
        .optional()?
        .ok_or_else(|| QueryError::UnknownPeriod(label.to_string()))
}

/// All reporting periods, oldest first. Rows with a quarter outside 1..=4 are
/// left out of the listing.
pub fn list_periods(db: &Connection) -> Result<Vec<Period>> {
    let sql = r#"
        SELECT
          CAST(date_id AS BIGINT),
          CAST(year AS INTEGER),
          CAST(quarter AS INTEGER),
          CAST(formatted_date AS VARCHAR)
        FROM dates
        ORDER BY year ASC, quarter ASC, date_id ASC
    "#;
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<usize, i64>(0)?,
            row.get::<usize, i32>(1)?,
            row.get::<usize, i32>(2)?,
            row.get::<usize, Option<String>>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (date_id, year, quarter, label) = r?;
        let quarter = match checked_quarter(date_id, quarter) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!("skipping period: {}", e);
                continue;
            }
        };
        out.push(Period {
            date_id,
            year,
            quarter,
            formatted_date: label.unwrap_or_else(|| format!("Q{quarter} {year}")),
        });
    }
    Ok(out)
}

pub fn list_products(db: &Connection, limit: usize, offset: usize) -> Result<Vec<Product>> {
    let sql = format!(
        r#"
        SELECT CAST(product_id AS BIGINT), product
        FROM product
        WHERE product IS NOT NULL
        ORDER BY product ASC, product_id ASC
        LIMIT {limit} OFFSET {offset}
    "#
    );
    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(Product {
            product_id: row.get(0)?,
            product: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Sums utilization per state for one period and product, then derives the
/// per-unit metrics from the sums. Rows are ordered by state code.
pub fn state_map(
    db: &Connection,
    date_id: i64,
    product_id: i64,
    ffsu: FfsuFilter,
) -> Result<Vec<StateRow>> {
    if ffsu.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT
          state,
          CAST(SUM(units) AS DOUBLE),
          CAST(SUM(rx_count) AS DOUBLE),
          CAST(SUM(total) AS DOUBLE),
          CAST(SUM(medicaid_reimbursed) AS DOUBLE),
          CAST(SUM(nadac) AS DOUBLE)
        FROM sdud
        WHERE date_id = ? AND product_id = ? AND {} AND state IS NOT NULL
        GROUP BY state
        ORDER BY state ASC
    "#,
        ffsu.sql_predicate("is_ffsu")
    );

    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(params![date_id, product_id], |row| {
        Ok((row.get::<usize, String>(0)?, totals_at(row, 1)?))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (state, totals) = r?;
        out.push(StateRow {
            state,
            per_unit: totals.per_unit(MAP_DECIMALS),
            totals,
        });
    }
    Ok(out)
}

/// Sums utilization per period for one state and product, places each period
/// on its quarter's representative date and derives per-unit metrics.
/// Points are strictly increasing by date; periods sharing a date are merged.
pub fn state_series(
    db: &Connection,
    state: &str,
    product_id: i64,
    ffsu: FfsuFilter,
) -> Result<Vec<SeriesPoint>> {
    let state = normalize_state(state)?;
    if ffsu.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        WITH per_period AS (
          SELECT
            date_id,
            SUM(units) AS units,
            SUM(rx_count) AS rx_count,
            SUM(total) AS total,
            SUM(medicaid_reimbursed) AS medicaid_reimbursed,
            SUM(nadac) AS nadac
          FROM sdud
          WHERE state = ? AND product_id = ? AND {}
          GROUP BY date_id
        )
        SELECT
          CAST(p.date_id AS BIGINT),
          CAST(d.year AS INTEGER),
          CAST(d.quarter AS INTEGER),
          CAST(p.units AS DOUBLE),
          CAST(p.rx_count AS DOUBLE),
          CAST(p.total AS DOUBLE),
          CAST(p.medicaid_reimbursed AS DOUBLE),
          CAST(p.nadac AS DOUBLE)
        FROM per_period p
        JOIN dates d ON d.date_id = p.date_id
        ORDER BY d.year ASC, d.quarter ASC, p.date_id ASC
    "#,
        ffsu.sql_predicate("is_ffsu")
    );

    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(params![state, product_id], |row| {
        Ok((
            row.get::<usize, i64>(0)?,
            row.get::<usize, i32>(1)?,
            row.get::<usize, i32>(2)?,
            totals_at(row, 3)?,
        ))
    })?;

    let mut by_date: BTreeMap<NaiveDate, (i32, u8, Totals)> = BTreeMap::new();
    for r in rows {
        let (date_id, year, quarter, totals) = r?;
        let quarter = checked_quarter(date_id, quarter)?;
        let date = quarter_start(year, quarter).ok_or(QueryError::InvalidQuarter {
            date_id,
            quarter: quarter as i32,
        })?;
        by_date
            .entry(date)
            .or_insert((year, quarter, Totals::default()))
            .2
            .add(&totals);
    }

    Ok(by_date
        .into_iter()
        .map(|(date, (year, quarter, totals))| {
            let totals = totals.rounded(SERIES_DECIMALS);
            SeriesPoint {
                date,
                year,
                quarter,
                per_unit: totals.per_unit(SERIES_DECIMALS),
                totals,
            }
        })
        .collect())
}

pub fn count_rows(db: &Connection, table: &str) -> Result<u64> {
    // table names are compile-time constants in this crate
    let mut stmt = db.prepare(&format!("SELECT COUNT(*)::BIGINT FROM {table}"))?;
    let v: i64 = stmt.query_row([], |row| row.get(0))?;
    Ok(v.max(0) as u64)
}

/// Two ASCII letters, upper-cased.
pub fn normalize_state(s: &str) -> Result<String> {
    let s = s.trim();
    if s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(s.to_ascii_uppercase())
    } else {
        Err(QueryError::InvalidState(s.to_string()))
    }
}

fn checked_quarter(date_id: i64, quarter: i32) -> Result<u8> {
    u8::try_from(quarter)
        .ok()
        .filter(|q| quarter_month(*q).is_some())
        .ok_or(QueryError::InvalidQuarter { date_id, quarter })
}

fn totals_at(row: &duckdb::Row<'_>, start: usize) -> duckdb::Result<Totals> {
    Ok(Totals {
        units: row.get::<usize, Option<f64>>(start)?.unwrap_or(0.0),
        rx_count: row.get::<usize, Option<f64>>(start + 1)?.unwrap_or(0.0),
        total: row.get::<usize, Option<f64>>(start + 2)?.unwrap_or(0.0),
        medicaid_reimbursed: row.get::<usize, Option<f64>>(start + 3)?.unwrap_or(0.0),
        nadac: row.get::<usize, Option<f64>>(start + 4)?.unwrap_or(0.0),
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::{METFORMIN, connection};
    use super::*;
    use crate::model::round_to;

    fn row<'a>(rows: &'a [StateRow], state: &str) -> &'a StateRow {
        rows.iter().find(|r| r.state == state).expect("state row")
    }

    #[test]
    fn lookups_resolve_and_miss() {
        let db = connection();
        assert_eq!(product_id_by_name(&db, METFORMIN).unwrap(), 1);
        assert_eq!(date_id_by_label(&db, "Q2 2023").unwrap(), 11);
        assert!(matches!(
            product_id_by_name(&db, "metformin"),
            Err(QueryError::UnknownProduct(_))
        ));
        assert!(matches!(
            date_id_by_label(&db, "Q1 1999"),
            Err(QueryError::UnknownPeriod(_))
        ));
    }

    #[test]
    fn periods_are_chronological() {
        let db = connection();
        let labels: Vec<String> = list_periods(&db)
            .unwrap()
            .into_iter()
            .map(|p| p.formatted_date)
            .collect();
        assert_eq!(labels, vec!["Q4 2022", "Q1 2023", "Q2 2023", "Q3 2023"]);
    }

    #[test]
    fn periods_skip_rows_with_bad_quarter() {
        let db = connection();
        db.execute_batch("INSERT INTO dates VALUES (15, 2024, 5, 'Q5 2024');")
            .unwrap();
        let periods = list_periods(&db).unwrap();
        assert_eq!(periods.len(), 4);
        assert!(periods.iter().all(|p| p.date_id != 15));
        assert_eq!(periods.last().unwrap().formatted_date, "Q3 2023");
    }

    #[test]
    fn products_are_paged_by_name() {
        let db = connection();
        let page = list_products(&db, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].product, "Atorvastatin Calcium Oral Tablet 20 MG");
        let rest = list_products(&db, 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].product_id, 1);
    }

    #[test]
    fn map_sums_before_dividing() {
        let db = connection();
        let rows = state_map(&db, 10, 1, FfsuFilter::BOTH).unwrap();
        assert_eq!(
            rows.iter().map(|r| r.state.as_str()).collect::<Vec<_>>(),
            vec!["CA", "TX", "WV"]
        );

        let ca = row(&rows, "CA");
        assert_eq!(ca.totals.units, 300.0);
        assert_eq!(ca.totals.total, 120.0);
        assert_eq!(ca.totals.nadac, 60.0);
        // mean of the per-record ratios would be 0.425; the ratio of sums is 0.4
        assert_eq!(ca.per_unit.payment_per_unit, Some(0.4));
        assert_eq!(ca.per_unit.nadac_per_unit, Some(0.2));
        assert_eq!(ca.per_unit.markup_per_unit, Some(0.2));
    }

    #[test]
    fn map_ratios_match_sums_and_add_up() {
        let db = connection();
        for ffsu in [
            FfsuFilter::BOTH,
            FfsuFilter {
                ffsu: true,
                non_ffsu: false,
            },
            FfsuFilter {
                ffsu: false,
                non_ffsu: true,
            },
        ] {
            for r in state_map(&db, 10, 1, ffsu).unwrap() {
                let Some(payment) = r.per_unit.payment_per_unit else {
                    assert_eq!(r.totals.units, 0.0);
                    continue;
                };
                assert_eq!(
                    payment,
                    round_to(r.totals.total / r.totals.units, MAP_DECIMALS)
                );
                let nadac = r.per_unit.nadac_per_unit.unwrap();
                let markup = r.per_unit.markup_per_unit.unwrap();
                assert!((nadac + markup - payment).abs() <= 0.01 + 1e-9);
            }
        }
    }

    #[test]
    fn map_respects_ffsu_filter() {
        let db = connection();
        let only_ffsu = FfsuFilter {
            ffsu: true,
            non_ffsu: false,
        };
        let rows = state_map(&db, 10, 1, only_ffsu).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(row(&rows, "CA").per_unit.payment_per_unit, Some(0.5));

        let non_ffsu = FfsuFilter {
            ffsu: false,
            non_ffsu: true,
        };
        let rows = state_map(&db, 10, 1, non_ffsu).unwrap();
        assert_eq!(row(&rows, "CA").per_unit.payment_per_unit, Some(0.35));
        assert_eq!(row(&rows, "CA").per_unit.markup_per_unit, Some(0.15));
    }

    #[test]
    fn zero_units_and_empty_filters_do_not_divide() {
        let db = connection();
        let rows = state_map(&db, 10, 1, FfsuFilter::BOTH).unwrap();
        assert_eq!(row(&rows, "WV").per_unit, PerUnit::default());

        assert!(state_map(&db, 10, 1, FfsuFilter::NONE).unwrap().is_empty());
        assert!(state_map(&db, 13, 1, FfsuFilter::BOTH).unwrap().is_empty());
        assert!(state_map(&db, 10, 99, FfsuFilter::BOTH).unwrap().is_empty());
    }

    #[test]
    fn series_is_chronological_on_quarter_months() {
        let db = connection();
        let points = state_series(&db, "ca", 1, FfsuFilter::BOTH).unwrap();
        let dates: Vec<NaiveDate> = points.iter().map(|p| p.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2022, 10, 1).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
            ]
        );
        assert!(points.windows(2).all(|w| w[0].date < w[1].date));

        assert_eq!(points[0].per_unit.payment_per_unit, Some(0.5));
        assert_eq!(points[0].per_unit.nadac_per_unit, Some(0.2));
        assert_eq!(points[1].totals.units, 300.0);
        assert_eq!(points[1].per_unit.payment_per_unit, Some(0.4));
    }

    #[test]
    fn series_filters_by_ffsu() {
        let db = connection();
        let non_ffsu = FfsuFilter {
            ffsu: false,
            non_ffsu: true,
        };
        let points = state_series(&db, "CA", 1, non_ffsu).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].per_unit.payment_per_unit, Some(0.35));
        assert!(state_series(&db, "CA", 1, FfsuFilter::NONE).unwrap().is_empty());
        assert!(state_series(&db, "NY", 1, FfsuFilter::BOTH).unwrap().is_empty());
    }

    #[test]
    fn series_merges_periods_sharing_a_date() {
        let db = connection();
        db.execute_batch(
            r#"
            INSERT INTO dates VALUES (14, 2023, 1, 'Q1 2023 (revised)');
            INSERT INTO sdud VALUES (14, 1, 'CA', TRUE, 100, 1, 30, 30, 20);
        "#,
        )
        .unwrap();
        let points = state_series(&db, "CA", 1, FfsuFilter::BOTH).unwrap();
        assert_eq!(points.len(), 3);
        let q1 = &points[1];
        assert_eq!(q1.totals.units, 400.0);
        assert_eq!(q1.per_unit.payment_per_unit, Some(0.375));
        assert_eq!(q1.per_unit.nadac_per_unit, Some(0.2));
    }

    #[test]
    fn series_rejects_bad_state_and_quarter() {
        let db = connection();
        assert!(matches!(
            state_series(&db, "California", 1, FfsuFilter::BOTH),
            Err(QueryError::InvalidState(_))
        ));

        db.execute_batch(
            r#"
            INSERT INTO dates VALUES (15, 2024, 5, 'Q5 2024');
            INSERT INTO sdud VALUES (15, 1, 'CA', TRUE, 1, 1, 1, 1, 1);
        "#,
        )
        .unwrap();
        assert!(matches!(
            state_series(&db, "CA", 1, FfsuFilter::BOTH),
            Err(QueryError::InvalidQuarter {
                date_id: 15,
                quarter: 5
            })
        ));
    }

    #[test]
    fn state_codes_normalize() {
        assert_eq!(normalize_state(" wv ").unwrap(), "WV");
        assert!(normalize_state("W1").is_err());
        assert!(normalize_state("").is_err());
    }
}
