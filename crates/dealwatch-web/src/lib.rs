//! Axum + Askama operator surface for dealwatch.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealwatch_core::{to_jsonl, DiscountRecord};
use dealwatch_refresh::RefreshJob;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "dealwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub job: Arc<RefreshJob>,
}

impl AppState {
    pub fn new(job: Arc<RefreshJob>) -> Self {
        Self { job }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total: usize,
    flagged: usize,
    threshold: f64,
    records: Vec<DiscountRecord>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscountsQuery {
    min: Option<f64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/discounts", get(discounts_handler))
        .route("/api/discounts.jsonl", get(discounts_jsonl_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

/// Bind on `DEALWATCH_WEB_PORT` (default 8000) and serve until the process
/// stops.
pub async fn serve(job: Arc<RefreshJob>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("DEALWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(AppState::new(job))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let threshold = state.job.config().threshold;
    let records = match state.job.store().all().await {
        Ok(records) => records,
        Err(err) => return server_error(err.into()),
    };
    let flagged = records.iter().filter(|r| r.discount >= threshold).count();
    render_html(IndexTemplate {
        total: records.len(),
        flagged,
        threshold,
        records,
    })
}

async fn discounts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiscountsQuery>,
) -> Response {
    let result = match query.min {
        Some(min) => state.job.store().find_at_or_above(min).await,
        None => state.job.store().all().await,
    };
    match result {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn discounts_jsonl_handler(State(state): State<Arc<AppState>>) -> Response {
    let records = match state.job.store().all().await {
        Ok(records) => records,
        Err(err) => return server_error(err.into()),
    };
    match to_jsonl(&records) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/x-ndjson"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"discounts.jsonl\"",
                ),
            ],
            body,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Manual trigger for one refresh cycle. Surfaces the overlap guard as a 409
/// and an aborted cycle as a 502 naming the phase it died in.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.job.try_run_once().await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (StatusCode::CONFLICT, "a refresh cycle is already running").into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {err}")).into_response()
}
