use crate::distinct_logic::state::AppState;
use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use lib_counter::{ConnectorState, MetricsSnapshot, SummarySet};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Serialize)]
struct LatestSummary {
    key: String,
    summary: SummarySet,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/debug/vars", get(vars_handler))
        .route("/summaries/latest", get(latest_summary_handler))
        .with_state(app_state)
}

pub async fn run(port: u16, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Monitor listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Monitor shutting down.");
        })
        .await?;
    Ok(())
}

/// 200 while the bus connection is up, 503 with the connector state otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.connector.state() {
        ConnectorState::Connected => (StatusCode::OK, "OK".to_string()),
        other => (StatusCode::SERVICE_UNAVAILABLE, format!("{:?}", other)),
    }
}

async fn vars_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn latest_summary_handler(State(state): State<AppState>) -> Response {
    let Some(key) = state.latest_summary().await else {
        return (StatusCode::NOT_FOUND, "No rollup has completed yet").into_response();
    };
    match state.engine.summary(&key).await {
        Ok(summary) => Json(LatestSummary { key, summary }).into_response(),
        Err(e) => {
            log::error!("Failed to read summary {}: {}", key, e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distinct_logic::state::testing::memory_state;
    use lib_counter::MetricsSink;
    use lib_counter::connections::BucketStore;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_follows_connector_state() {
        let (_broker, _store, state) = memory_state();

        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.connector.connect().await.unwrap();
        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        state.connector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_vars_serves_counter_snapshot() {
        let (_broker, _store, state) = memory_state();
        state.metrics.record_processed();
        state.metrics.record_processed();
        state.metrics.record_error();

        let json = body_json(vars_handler(State(state)).await.into_response()).await;
        assert_eq!(json["totalProcessed"], 2);
        assert_eq!(json["workerErrors"], 1);
    }

    #[tokio::test]
    async fn test_latest_summary_before_and_after_rollup() {
        let (_broker, store, state) = memory_state();

        let response = latest_summary_handler(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        store.increment_member("distinct:summary:0", "login", 15).await.unwrap();
        state.set_latest_summary("distinct:summary:0".to_string()).await;

        let response = latest_summary_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["key"], "distinct:summary:0");
        assert_eq!(json["summary"]["login"], 15);
    }
}
