use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::server::AppState;

use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::tenant::{close_tenant_connection, relay_request, set_current_tenant};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health, stats & metrics
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Tenant endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/tenants/current", put(set_current_tenant))
                .route("/tenants/{tenant}/connection", delete(close_tenant_connection))
                .route("/tenants/{tenant}/relay", post(relay_request)),
        )
}
