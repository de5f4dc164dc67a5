//! API layer - HTTP endpoint handlers organized by domain.

mod health;
mod metrics;
mod routes;
mod tenant;

pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
pub use tenant::{close_tenant_connection, relay_request, set_current_tenant};
