use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::dashboard::{self, MapRequest, SeriesRequest};
use crate::error::QueryError;
use crate::index::products::{ProductEngine, ProductSearchQuery, Sort as ProductSort};
use crate::model::{DEFAULT_PRODUCT, FfsuFilter, Metric, Period};
use crate::query;
use crate::storage::{StoragePaths, open_database};

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    products: Arc<ProductEngine>,
    meta: Option<serde_json::Value>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !paths.product_index_dir.join("_SUCCESS").exists() {
        return Err(anyhow!(
            "Product index not found at {}. Run: sdud-explorer build",
            paths.product_index_dir.display()
        ));
    }

    let conn = open_database(&paths)?;
    let products =
        ProductEngine::open(&paths.product_index_dir).context("open product index")?;

    let meta = if std::fs::metadata(&paths.meta_path)
        .map(|m| m.len() > 0)
        .unwrap_or(false)
    {
        let s = std::fs::read_to_string(&paths.meta_path)?;
        serde_json::from_str(&s).ok()
    } else {
        None
    };

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        products: Arc::new(products),
        meta,
    };

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats", get(api_stats))
        .route("/api/options", get(api_options))
        .route("/api/products", get(api_products))
        .route("/api/products/search", get(api_product_search))
        .route("/api/map", get(api_map))
        .route("/api/states/:state/series", get(api_state_series))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    meta: Option<serde_json::Value>,
}

async fn api_stats(State(st): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse { meta: st.meta })
}

#[derive(Debug, Serialize)]
struct OptionsResponse {
    periods: Vec<Period>,
    default_period: Option<String>,
    metrics: Vec<MetricOpt>,
    default_metric: Metric,
    ffsu: Vec<FfsuOpt>,
    default_ffsu: Vec<&'static str>,
    default_product: &'static str,
}

#[derive(Debug, Serialize)]
struct MetricOpt {
    value: Metric,
    label: String,
    is_currency: bool,
}

#[derive(Debug, Serialize)]
struct FfsuOpt {
    label: &'static str,
    value: bool,
}

async fn api_options(State(st): State<AppState>) -> Response {
    let db = st.db.lock().await;
    let periods = match query::list_periods(&db) {
        Ok(v) => v,
        Err(e) => return query_error_response(e),
    };

    Json(OptionsResponse {
        default_period: periods.last().map(|p| p.formatted_date.clone()),
        periods,
        metrics: Metric::ALL
            .into_iter()
            .map(|m| MetricOpt {
                value: m,
                label: m.label(),
                is_currency: m.is_currency(),
            })
            .collect(),
        default_metric: Metric::default(),
        ffsu: vec![
            FfsuOpt {
                label: "FFSU",
                value: true,
            },
            FfsuOpt {
                label: "Non-FFSU",
                value: false,
            },
        ],
        default_ffsu: FfsuFilter::BOTH.labels(),
        default_product: DEFAULT_PRODUCT,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ProductListParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn api_products(
    State(st): State<AppState>,
    Query(p): Query<ProductListParams>,
) -> Response {
    let limit = p.limit.unwrap_or(100).clamp(1, 1000);
    let offset = p.offset.unwrap_or(0);
    let db = st.db.lock().await;
    match query::list_products(&db, limit, offset) {
        Ok(v) => Json(v).into_response(),
        Err(e) => query_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ProductSearchParams {
    q: Option<String>,
    sort: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn api_product_search(
    State(st): State<AppState>,
    Query(p): Query<ProductSearchParams>,
) -> Response {
    let q_empty = p.q.as_deref().map(str::trim).unwrap_or("").is_empty();
    let sort = match p.sort.as_deref() {
        None if q_empty => ProductSort::PaidDesc,
        s => match ProductSort::parse(s) {
            Ok(v) => v,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
    };

    let query = ProductSearchQuery {
        q: p.q.clone(),
        sort,
        page: p.page.unwrap_or(0),
        page_size: p.page_size.unwrap_or(50),
    };
    match st.products.search(query) {
        Ok(r) => Json(r).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MapParams {
    product: Option<String>,
    date: Option<String>,
    /// Comma-separated checklist values; absent means both, empty means none.
    ffsu: Option<String>,
    metric: Option<String>,
}

async fn api_map(State(st): State<AppState>, Query(p): Query<MapParams>) -> Response {
    let ffsu = match parse_ffsu_param(p.ffsu.as_deref()) {
        Ok(v) => v,
        Err(e) => return query_error_response(e),
    };
    let metric = match dashboard::parse_metric(p.metric.as_deref()) {
        Ok(v) => v,
        Err(e) => return query_error_response(e),
    };
    let req = MapRequest {
        product: p.product.unwrap_or_else(|| DEFAULT_PRODUCT.to_string()),
        date: p.date.filter(|d| !d.trim().is_empty()),
        ffsu,
        metric,
    };

    let db = st.db.lock().await;
    match dashboard::map_view(&db, &req) {
        Ok(v) => Json(v).into_response(),
        Err(e) => query_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SeriesParams {
    product: Option<String>,
    ffsu: Option<String>,
}

async fn api_state_series(
    State(st): State<AppState>,
    AxumPath(state): AxumPath<String>,
    Query(p): Query<SeriesParams>,
) -> Response {
    let ffsu = match parse_ffsu_param(p.ffsu.as_deref()) {
        Ok(v) => v,
        Err(e) => return query_error_response(e),
    };
    let req = SeriesRequest {
        state,
        product: p.product.unwrap_or_else(|| DEFAULT_PRODUCT.to_string()),
        ffsu,
    };

    let db = st.db.lock().await;
    match dashboard::series_view(&db, &req) {
        Ok(v) => Json(v).into_response(),
        Err(e) => query_error_response(e),
    }
}

fn parse_ffsu_param(raw: Option<&str>) -> Result<FfsuFilter, QueryError> {
    let items = raw.map(split_list);
    dashboard::parse_ffsu(items.as_deref())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn query_error_response(e: QueryError) -> Response {
    if e.is_bad_input() {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    tracing::error!("query failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::rebuild_product_rollups;
    use crate::index::products::build_product_index;
    use crate::query::fixtures::{self, METFORMIN};

    fn app_state(index_dir: &std::path::Path) -> AppState {
        let mut db = fixtures::connection();
        rebuild_product_rollups(&mut db).unwrap();
        build_product_index(&db, index_dir, false).unwrap();
        AppState {
            db: Arc::new(Mutex::new(db)),
            products: Arc::new(ProductEngine::open(index_dir).unwrap()),
            meta: None,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn map_params(date: Option<&str>, ffsu: Option<&str>, metric: Option<&str>) -> MapParams {
        MapParams {
            product: Some(METFORMIN.to_string()),
            date: date.map(str::to_string),
            ffsu: ffsu.map(str::to_string),
            metric: metric.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn map_returns_rows_and_chart() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let resp = api_map(
            State(st),
            Query(map_params(Some("Q1 2023"), Some("FFSU"), Some("payment_per_unit"))),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["rows"].as_array().unwrap().len(), 2);
        assert_eq!(v["rows"][0]["state"], "CA");
        assert_eq!(v["rows"][0]["payment_per_unit"], 0.5);
        assert_eq!(v["panel"]["status"], "ready");
        assert_eq!(v["panel"]["chart"]["metric"], "payment_per_unit");
    }

    #[tokio::test]
    async fn map_empty_ffsu_is_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let resp = api_map(State(st), Query(map_params(Some("Q1 2023"), Some(""), None))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["panel"]["status"], "placeholder");
        assert_eq!(v["ffsu"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn map_bad_metric_is_400() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let resp = api_map(State(st), Query(map_params(None, None, Some("median")))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn series_for_clicked_state() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let resp = api_state_series(
            State(st.clone()),
            AxumPath("ca".to_string()),
            Query(SeriesParams {
                product: None,
                ffsu: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["state"], "CA");
        let dates: Vec<&str> = v["points"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["date"].as_str().unwrap())
            .collect();
        assert_eq!(dates, vec!["2022-10-01", "2023-01-01", "2023-04-01"]);

        let resp = api_state_series(
            State(st),
            AxumPath("California".to_string()),
            Query(SeriesParams {
                product: None,
                ffsu: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn options_list_periods_and_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let v = body_json(api_options(State(st)).await).await;
        assert_eq!(v["default_period"], "Q3 2023");
        assert_eq!(v["periods"].as_array().unwrap().len(), 4);
        assert_eq!(v["default_metric"], "markup_per_unit");
        assert_eq!(v["default_product"], METFORMIN);
        assert_eq!(v["ffsu"][1]["label"], "Non-FFSU");
    }

    #[tokio::test]
    async fn product_search_and_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let v = body_json(
            api_product_search(
                State(st.clone()),
                Query(ProductSearchParams {
                    q: Some("lisinopril".to_string()),
                    sort: None,
                    page: None,
                    page_size: None,
                }),
            )
            .await,
        )
        .await;
        assert_eq!(v["total_hits"], 1);
        assert_eq!(v["hits"][0]["product_id"], 2);

        let v = body_json(
            api_products(
                State(st),
                Query(ProductListParams {
                    limit: Some(1),
                    offset: Some(1),
                }),
            )
            .await,
        )
        .await;
        assert_eq!(v[0]["product"], "Lisinopril Oral Tablet 10 MG");
    }

    #[tokio::test]
    async fn product_search_sort_by_name_and_reject_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let st = app_state(&tmp.path().join("products"));
        let params = |sort: &str| ProductSearchParams {
            q: None,
            sort: Some(sort.to_string()),
            page: None,
            page_size: None,
        };

        let v = body_json(api_product_search(State(st.clone()), Query(params("name_asc"))).await)
            .await;
        let ids: Vec<i64> = v["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["product_id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let resp = api_product_search(State(st), Query(params("cheapest"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn ffsu_param_forms() {
        assert_eq!(parse_ffsu_param(None).unwrap(), FfsuFilter::BOTH);
        assert_eq!(parse_ffsu_param(Some("")).unwrap(), FfsuFilter::NONE);
        let f = parse_ffsu_param(Some("FFSU, Non-FFSU")).unwrap();
        assert_eq!(f, FfsuFilter::BOTH);
        assert!(parse_ffsu_param(Some("FFSU,state")).is_err());
    }
}
