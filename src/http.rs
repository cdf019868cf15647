use crate::collectors::Sampler;
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub sampler: Sampler,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsResponse {
    pub stats: Snapshot,
}

pub fn build_router(metrics: Arc<Metrics>, sampler: Sampler) -> Router {
    Router::new()
        .route("/", get(stats_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(HttpAppState { metrics, sampler })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<HttpAppState>) -> Response {
    let sampled = state.sampler.snapshot().await.and_then(|snapshot| {
        snapshot.validate()?;
        Ok(snapshot)
    });
    match sampled {
        Ok(stats) => Json(StatsResponse { stats }).into_response(),
        Err(err) => {
            warn!(error = %err, "не удалось собрать статистику по запросу");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("ошибка сбора статистики: {err}"),
            )
                .into_response()
        }
    }
}
