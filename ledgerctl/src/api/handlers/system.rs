//! Liveness and Prometheus scrape endpoints.

use axum::{
    http::header,
    response::{IntoResponse, Json},
};
use serde_json::{Value, json};

use crate::{errors::Error, metrics};

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Prometheus text exposition of every registered metric
pub async fn metrics() -> Result<impl IntoResponse, Error> {
    let body = metrics::render().map_err(|e| Error::Internal {
        operation: format!("encode metrics: {e}"),
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{create_test_server, create_test_server_with, test_config};
    use axum::http::StatusCode;

    #[test_log::test(tokio::test)]
    async fn test_healthz() {
        let (server, _state) = create_test_server();
        let response = server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({ "status": "ok" }));
    }

    #[test_log::test(tokio::test)]
    async fn test_metrics_route_follows_config() {
        let (server, _state) = create_test_server();
        crate::metrics::record_freeze("frozen");
        let response = server.get("/internal/metrics").await;
        response.assert_status_ok();
        assert!(response.text().contains("ledger_freezes_total"));

        let mut config = test_config();
        config.enable_metrics = false;
        let (server, _state) = create_test_server_with(config);
        server.get("/internal/metrics").await.assert_status(StatusCode::NOT_FOUND);
    }
}
