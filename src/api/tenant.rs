//! Tenant management and request relay endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::relay::RelayResponse;
use crate::server::AppState;
use crate::tenant::{TenantDirectory, TenantId};

#[derive(Debug, Deserialize)]
pub struct SetCurrentTenantRequest {
    pub tenant: Option<TenantId>,
}

#[derive(Debug, Serialize)]
pub struct CurrentTenantResponse {
    pub current_tenant: Option<TenantId>,
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct CloseConnectionResponse {
    pub tenant: TenantId,
    /// A live connection existed and was closed
    pub closed: bool,
}

fn parse_tenant(raw: &str) -> Result<TenantId> {
    raw.parse::<TenantId>()
        .map_err(|_| AppError::Validation(format!("invalid tenant id '{}'", raw)))
}

/// PUT /api/v1/tenants/current - Switch the primary tenant
#[tracing::instrument(name = "http.set_current_tenant", skip(state))]
pub async fn set_current_tenant(
    State(state): State<AppState>,
    Json(request): Json<SetCurrentTenantRequest>,
) -> Json<CurrentTenantResponse> {
    state.directory.set_current(request.tenant);
    let current_tenant = state.directory.current_tenant();

    Json(CurrentTenantResponse {
        current_tenant,
        connected: current_tenant
            .is_some_and(|t| state.registry.get_connection_by_tenant(t).is_some()),
    })
}

/// DELETE /api/v1/tenants/{tenant}/connection - Tear down a tenant on account switch
#[tracing::instrument(name = "http.close_tenant_connection", skip(state))]
pub async fn close_tenant_connection(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<CloseConnectionResponse>> {
    let tenant = parse_tenant(&tenant)?;
    // Retire first so the close cannot be mistaken for a dropped session
    state.directory.retire(tenant);
    let closed = state.registry.close_connection_by_tenant(tenant);

    Ok(Json(CloseConnectionResponse { tenant, closed }))
}

/// POST /api/v1/tenants/{tenant}/relay - Forward a request to the tenant's backend
#[tracing::instrument(name = "http.relay_request", skip(state, payload))]
pub async fn relay_request(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<RelayResponse>> {
    let tenant = parse_tenant(&tenant)?;
    let response = state.relay.forward(tenant, payload).await?;
    Ok(Json(response))
}
