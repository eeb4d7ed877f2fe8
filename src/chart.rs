use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{Metric, round_to, title_case};
use crate::query::{SeriesPoint, StateRow};

const COLORBAR_TICKS: usize = 4;

const NADAC_COLOR: &str = "#2E86AB";
const PAYMENT_COLOR: &str = "#A23B72";

/// What the client draws in a chart slot: the chart, or a message instead of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Panel<T> {
    Ready { chart: T },
    Placeholder { message: String },
}

impl<T> Panel<T> {
    pub fn placeholder(message: impl Into<String>) -> Self {
        Panel::Placeholder {
            message: message.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Panel::Ready { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoroplethChart {
    pub title: String,
    pub metric: Metric,
    pub metric_label: String,
    pub location_mode: &'static str,
    pub scope: &'static str,
    pub color_scale: &'static str,
    pub is_currency: bool,
    pub tick_format: &'static str,
    pub hover_format: &'static str,
    pub min: f64,
    pub max: f64,
    pub tick_values: Vec<f64>,
    pub points: Vec<MapPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPoint {
    pub state: String,
    pub value: f64,
}

pub fn choropleth(rows: &[StateRow], metric: Metric) -> Panel<ChoroplethChart> {
    let points: Vec<MapPoint> = rows
        .iter()
        .filter_map(|r| {
            metric
                .value(&r.totals, &r.per_unit)
                .filter(|v| v.is_finite())
                .map(|value| MapPoint {
                    state: r.state.clone(),
                    value,
                })
        })
        .collect();

    if points.is_empty() {
        return Panel::placeholder(
            "No data for the selected product, period and facility filter.",
        );
    }

    let min = points.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
    let max = points
        .iter()
        .map(|p| p.value)
        .fold(f64::NEG_INFINITY, f64::max);

    let is_currency = metric.is_currency();
    let label = metric.label();
    Panel::Ready {
        chart: ChoroplethChart {
            title: format!("{label} by State"),
            metric,
            metric_label: label,
            location_mode: "USA-states",
            scope: "usa",
            color_scale: if is_currency { "RdYlBu_r" } else { "Blues" },
            is_currency,
            tick_format: if is_currency { "$,.0f" } else { ",.1f" },
            hover_format: if is_currency { "$,.2f" } else { ",.2f" },
            min,
            max,
            tick_values: colorbar_ticks(min, max, COLORBAR_TICKS),
            points,
        },
    }
}

/// Evenly spaced colorbar ticks between `min` and `max`, rounded to cents.
pub fn colorbar_ticks(min: f64, max: f64, count: usize) -> Vec<f64> {
    if min == max || count < 2 {
        return vec![min];
    }
    let step = (max - min) / (count - 1) as f64;
    (0..count)
        .map(|i| round_to(min + i as f64 * step, 2))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesChart {
    pub title: String,
    pub subtitle: String,
    pub x_title: &'static str,
    pub y_title: &'static str,
    pub x_tick_format: &'static str,
    pub y_tick_prefix: &'static str,
    pub legend: Vec<LegendEntry>,
    pub points: Vec<LongPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendEntry {
    pub metric: &'static str,
    pub label: String,
    pub color: &'static str,
}

/// Long ("unpivoted") form: one row per (date, metric).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LongPoint {
    pub date: NaiveDate,
    pub metric: &'static str,
    pub label: String,
    pub value: f64,
}

pub fn time_series(points: &[SeriesPoint], state: &str) -> Panel<TimeSeriesChart> {
    let lines: [(&'static str, &'static str, fn(&SeriesPoint) -> Option<f64>); 2] = [
        ("nadac_per_unit", NADAC_COLOR, |p| p.per_unit.nadac_per_unit),
        ("payment_per_unit", PAYMENT_COLOR, |p| {
            p.per_unit.payment_per_unit
        }),
    ];

    let mut legend = Vec::with_capacity(lines.len());
    let mut long = Vec::with_capacity(points.len() * lines.len());
    for (key, color, value_of) in lines {
        let label = series_label(key);
        for p in points {
            if let Some(value) = value_of(p) {
                long.push(LongPoint {
                    date: p.date,
                    metric: key,
                    label: label.clone(),
                    value,
                });
            }
        }
        legend.push(LegendEntry {
            metric: key,
            label,
            color,
        });
    }

    if long.is_empty() {
        return Panel::placeholder(format!(
            "No utilization recorded for {state} with this product and facility filter."
        ));
    }

    Panel::Ready {
        chart: TimeSeriesChart {
            title: "Drug Pricing Comparison: NADAC vs Payment per Unit".to_string(),
            subtitle: format!("State: {state}"),
            x_title: "Date",
            y_title: "Price per Unit ($)",
            x_tick_format: "%b %Y",
            y_tick_prefix: "$",
            legend,
            points: long,
        },
    }
}

/// `nadac_per_unit` -> `Nadac`.
fn series_label(key: &str) -> String {
    title_case(key.trim_end_matches("_per_unit"))
}
