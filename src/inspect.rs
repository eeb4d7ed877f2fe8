use anyhow::Context;
use serde::Serialize;

use crate::cli::{MapArgs, SeriesArgs};
use crate::dashboard::{self, MapRequest, SeriesRequest};
use crate::storage::{StoragePaths, open_database};

pub fn map(opts: MapArgs) -> anyhow::Result<()> {
    let req = MapRequest {
        product: opts.product,
        date: opts.date,
        ffsu: dashboard::parse_ffsu(opts.ffsu.as_deref())?,
        metric: dashboard::parse_metric(Some(&opts.metric))?,
    };
    let db = open_database(&StoragePaths::new(&opts.data_dir))?;
    let view = dashboard::map_view(&db, &req).context("state map query")?;
    tracing::info!(
        "{} states for {:?} ({}); chart ready: {}",
        view.rows.len(),
        view.date,
        view.metric,
        view.panel.is_ready()
    );
    print_json(&view)
}

pub fn series(opts: SeriesArgs) -> anyhow::Result<()> {
    let req = SeriesRequest {
        state: opts.state,
        product: opts.product,
        ffsu: dashboard::parse_ffsu(opts.ffsu.as_deref())?,
    };
    let db = open_database(&StoragePaths::new(&opts.data_dir))?;
    let view = dashboard::series_view(&db, &req).context("state series query")?;
    tracing::info!(
        "{} quarters for {}; chart ready: {}",
        view.points.len(),
        view.state,
        view.panel.is_ready()
    );
    print_json(&view)
}

fn print_json(v: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
