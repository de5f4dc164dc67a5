//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::RegistryStats;
use crate::server::AppState;
use crate::tenant::{TenantDirectory, TenantId};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub tenants: Vec<TenantId>,
    pub current_tenant: Option<TenantId>,
    /// Whether the current tenant has a live connection
    pub current_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub current_tenant: Option<TenantId>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let tenants = state.registry.connected_tenants();
    let current_tenant = state.directory.current_tenant();
    let current_connected = current_tenant.is_some_and(|t| tenants.contains(&t));

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            total: tenants.len(),
            tenants,
            current_tenant,
            current_connected,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        registry: state.registry.stats(),
        current_tenant: state.directory.current_tenant(),
    })
}
