use crate::metrics::{HealthReport, Metrics};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
struct AppState {
    metrics: Arc<Metrics>,
}

pub fn create_router(metrics: Arc<Metrics>) -> Router {
    let state = AppState { metrics };

    Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.metrics.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.metrics.report())
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, AppError> {
    Ok(state.metrics.gather()?)
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState {
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    #[test]
    fn test_liveness() {
        tokio_test::block_on(async {
            assert_eq!(liveness().await, StatusCode::NO_CONTENT);
        });
    }

    #[test]
    fn test_readiness_reports_broker_errors() {
        tokio_test::block_on(async {
            let state = state();
            assert_eq!(readiness(State(state.clone())).await, StatusCode::NO_CONTENT);

            state
                .metrics
                .consumer_health
                .set_error("BrokerTransportFailure", "connection refused");
            assert_eq!(
                readiness(State(state.clone())).await,
                StatusCode::SERVICE_UNAVAILABLE
            );
        });
    }

    #[test]
    fn test_health_and_metrics_bodies() {
        tokio_test::block_on(async {
            let state = state();
            state.metrics.consumed.inc_by(4);
            state.metrics.dropped.inc();

            let Json(report) = health(State(state.clone())).await;
            let body = serde_json::to_value(&report).unwrap();
            assert_eq!(body["ConsumedMessages"], 4);
            assert_eq!(body["DroppedMessages"], 1);
            assert_eq!(body["Consumer"]["Status"], "Unknown");
            assert_eq!(body["ConsumerLag"], 0);
            assert_eq!(body["ConsumedPerSecond"], 0.0);

            let text = metrics_handler(State(state)).await.ok().unwrap();
            assert!(text.contains("filter_messages_consumed_total 4"));
        });
    }

    #[test]
    fn test_router_builds() {
        let _router = create_router(Arc::new(Metrics::new().unwrap()));
    }
}
