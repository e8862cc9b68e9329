mod analyze;
mod health;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(health::root))
        .route("/info", get(health::info))
        .route("/actuator/health", get(health::healthcheck))
        .route("/actuator/prometheus", get(metrics::metrics_handler))
        .route("/analyze", post(analyze::analyze))
}
