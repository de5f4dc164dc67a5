//! Registry statistics and info structures

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::tenant::TenantId;

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub pending_grace_periods: usize,
    pub reconnecting_tenants: usize,
    pub active_queues: usize,
    pub connections: Vec<ConnectionInfo>,
}

/// One registered tenant connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub tenant: TenantId,
    pub connection_id: Uuid,
    pub address: String,
    pub connected_at: DateTime<Utc>,
}
