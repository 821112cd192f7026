// HTTP server for the operator status view
//
// GET /health               liveness probe
// GET /metrics              Prometheus exposition
// GET /status               StatusReport JSON for every operation and circuit
// GET /status/{operation}   OperationStatus JSON for one operation

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;
use crate::metrics;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Routes for the status view over `coordinator`
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/status/{operation}", get(operation_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serve the status view on `0.0.0.0:port` until `shutdown` resolves
pub async fn serve(
    coordinator: Arc<Coordinator>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind status server on {}", addr))?;

    info!("Starting status server on {}", addr);

    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Status server error")?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn status_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    match coordinator.status_report().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn operation_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path(operation): Path<String>,
) -> Response {
    match coordinator.operation_status(&operation).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: CoordinatorError) -> Response {
    let status = match &err {
        CoordinatorError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        _ => {
            error!(error = %err, "Status query failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
    use crate::clock::MonotonicClock;
    use crate::rate_limit::{OperationRegistry, RateLimitConfig, RateLimiter};
    use crate::retry::RetryPolicy;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = OperationRegistry::new(vec![
            RateLimitConfig::new("orders.list", 0.5, 20),
            RateLimitConfig::new("feeds.submit", 2.0, 2),
        ])
        .unwrap();
        let limiter = RateLimiter::in_memory(registry);
        let breakers = BreakerRegistry::new(
            limiter.registry().operations(),
            CircuitBreakerConfig::default(),
            Arc::new(MonotonicClock::new()),
        );
        router(Arc::new(Coordinator::new(
            limiter,
            breakers,
            RetryPolicy::default(),
            None,
        )))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::init().unwrap();
        let response = app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_report() {
        let (status, body) = get_json(app(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
        assert_eq!(body["failure_policy"], "fail_closed");
        assert_eq!(body["summary"]["operations"], 2);
        assert_eq!(body["operations"][0]["operation"], "feeds.submit");
        assert_eq!(body["circuits"][1]["state"], "closed");
    }

    #[tokio::test]
    async fn test_operation_status() {
        let (status, body) = get_json(app(), "/status/orders.list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["burst_capacity"], 20);
        assert_eq!(body["queue_length"], 0);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_found() {
        let (status, body) = get_json(app(), "/status/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }
}
