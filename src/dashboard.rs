use duckdb::Connection;
use serde::Serialize;

use crate::chart::{self, ChoroplethChart, Panel, TimeSeriesChart};
use crate::error::Result;
use crate::model::{FfsuFilter, Metric};
use crate::query::{self, SeriesPoint, StateRow};

#[derive(Debug, Clone)]
pub struct MapRequest {
    pub product: String,
    /// Period label; `None` selects the most recent period.
    pub date: Option<String>,
    pub ffsu: FfsuFilter,
    pub metric: Metric,
}

#[derive(Debug, Serialize)]
pub struct MapView {
    pub product: String,
    pub date: Option<String>,
    pub ffsu: Vec<&'static str>,
    pub metric: Metric,
    pub rows: Vec<StateRow>,
    pub panel: Panel<ChoroplethChart>,
}

#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub state: String,
    pub product: String,
    pub ffsu: FfsuFilter,
}

#[derive(Debug, Serialize)]
pub struct SeriesView {
    pub state: String,
    pub product: String,
    pub ffsu: Vec<&'static str>,
    pub points: Vec<SeriesPoint>,
    pub panel: Panel<TimeSeriesChart>,
}

/// Resolves the request's names to ids and aggregates by state. Lookup misses
/// and empty results come back as a placeholder panel.
pub fn map_view(db: &Connection, req: &MapRequest) -> Result<MapView> {
    let mut view = MapView {
        product: req.product.clone(),
        date: req.date.clone(),
        ffsu: req.ffsu.labels(),
        metric: req.metric,
        rows: Vec::new(),
        panel: Panel::placeholder(""),
    };

    let date = match &req.date {
        Some(d) => d.clone(),
        None => match query::list_periods(db)?.pop() {
            Some(p) => p.formatted_date,
            None => {
                view.panel = Panel::placeholder("No reporting periods are loaded.");
                return Ok(view);
            }
        },
    };
    view.date = Some(date.clone());

    let ids = query::product_id_by_name(db, &req.product)
        .and_then(|p| Ok((p, query::date_id_by_label(db, &date)?)));
    let (product_id, date_id) = match ids {
        Ok(v) => v,
        Err(e) if e.is_lookup_miss() => {
            tracing::info!("map lookup miss: {}", e);
            view.panel = Panel::placeholder(e.to_string());
            return Ok(view);
        }
        Err(e) => return Err(e),
    };

    view.rows = query::state_map(db, date_id, product_id, req.ffsu)?;
    view.panel = chart::choropleth(&view.rows, req.metric);
    Ok(view)
}

pub fn series_view(db: &Connection, req: &SeriesRequest) -> Result<SeriesView> {
    let state = query::normalize_state(&req.state)?;
    let mut view = SeriesView {
        state: state.clone(),
        product: req.product.clone(),
        ffsu: req.ffsu.labels(),
        points: Vec::new(),
        panel: Panel::placeholder(""),
    };

    let product_id = match query::product_id_by_name(db, &req.product) {
        Ok(id) => id,
        Err(e) if e.is_lookup_miss() => {
            tracing::info!("series lookup miss: {}", e);
            view.panel = Panel::placeholder(e.to_string());
            return Ok(view);
        }
        Err(e) => return Err(e),
    };

    view.points = query::state_series(db, &state, product_id, req.ffsu)?;
    view.panel = chart::time_series(&view.points, &state);
    Ok(view)
}

/// Parses an optional checklist selection; absent means both flags.
pub fn parse_ffsu<S: AsRef<str>>(items: Option<&[S]>) -> Result<FfsuFilter> {
    match items {
        None => Ok(FfsuFilter::BOTH),
        Some(items) => FfsuFilter::from_labels(items),
    }
}

pub fn parse_metric(s: Option<&str>) -> Result<Metric> {
    match s.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Metric::default()),
        Some(s) => s.parse(),
    }
}
