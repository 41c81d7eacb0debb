//! HTTP API route definitions.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{book, health, metrics, ready, session, status, AppState};

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        // Status and book endpoints
        .route("/api/v1/status", get(status))
        .route("/api/v1/book/:symbol", get(book))
        .route("/api/v1/session/:symbol", get(session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::tests::StaticQuery;
    use crate::feed::ConnectionState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(state: ConnectionState) -> Router {
        create_router(AppState::new(Arc::new(StaticQuery::new(state))))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (status, body) = get_json(app(ConnectionState::Connecting), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ready_endpoint_returns_503_when_not_subscribed() {
        let (status, body) = get_json(app(ConnectionState::Degraded), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["sessions"][0]["state"], "degraded");
    }

    #[tokio::test]
    async fn ready_endpoint_returns_200_when_subscribed() {
        let (status, _) = get_json(app(ConnectionState::Subscribed), "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn book_endpoint_honours_depth() {
        let (status, body) =
            get_json(app(ConnectionState::Subscribed), "/api/v1/book/BTC-USDT?depth=1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "BTC-USDT");
        assert_eq!(body["bids"].as_array().unwrap().len(), 1);
        assert_eq!(body["asks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_symbol_is_404() {
        let (status, body) = get_json(app(ConnectionState::Subscribed), "/api/v1/book/ETH-USDT").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ETH-USDT"));

        let (status, _) = get_json(app(ConnectionState::Subscribed), "/api/v1/session/ETH-USDT").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_endpoint_reports_state() {
        let (status, body) =
            get_json(app(ConnectionState::Subscribed), "/api/v1/session/BTC-USDT").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "subscribed");
        assert_eq!(body["stats"]["gaps"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_without_recorder_is_503() {
        let response = app(ConnectionState::Subscribed)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
