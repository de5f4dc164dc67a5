//! Tenant-side collaborators of the connection registry.
//!
//! The registry never owns tenant selection or session state. It asks a
//! [`TenantDirectory`] whether a tenant still has a backing session and which
//! tenant is currently the primary one, and it hands lost tenants to an
//! optional [`SessionRecovery`].

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use dashmap::DashSet;

/// Account index of a tenant. Any non-negative `authIndex` fits.
pub type TenantId = u64;

/// Read-only view of tenant session state
pub trait TenantDirectory: Send + Sync {
    /// Whether the tenant still has an active backing session.
    /// `false` means the tenant was torn down on purpose and must not be recovered.
    fn has_live_session(&self, tenant: TenantId) -> bool;

    /// The tenant whose requests are user-visible right now
    fn current_tenant(&self) -> Option<TenantId>;
}

/// Out-of-band attempt to bring a lost tenant session back.
///
/// The registry guarantees at most one call per tenant at a time and bounds
/// each call with its own timeout.
#[async_trait]
pub trait SessionRecovery: Send + Sync {
    async fn recover(&self, tenant: TenantId) -> anyhow::Result<()>;
}

/// In-process tenant directory driven through the HTTP API
pub struct InMemoryTenantDirectory {
    current: RwLock<Option<TenantId>>,
    assume_live: bool,
    /// Tenants with a known live session (used when `assume_live` is off)
    live: DashSet<TenantId>,
    /// Tenants whose session was intentionally closed
    retired: DashSet<TenantId>,
}

impl InMemoryTenantDirectory {
    pub fn new(assume_live: bool) -> Self {
        Self {
            current: RwLock::new(None),
            assume_live,
            live: DashSet::new(),
            retired: DashSet::new(),
        }
    }

    pub fn set_current(&self, tenant: Option<TenantId>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = tenant;
        tracing::info!(current_tenant = ?tenant, "Current tenant changed");
    }

    /// Mark a tenant's session as intentionally gone
    pub fn retire(&self, tenant: TenantId) {
        self.live.remove(&tenant);
        self.retired.insert(tenant);
    }

    /// Mark a tenant's session as live again
    pub fn revive(&self, tenant: TenantId) {
        self.retired.remove(&tenant);
        self.live.insert(tenant);
    }
}

impl Default for InMemoryTenantDirectory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn has_live_session(&self, tenant: TenantId) -> bool {
        if self.retired.contains(&tenant) {
            return false;
        }
        self.assume_live || self.live.contains(&tenant)
    }

    fn current_tenant(&self) -> Option<TenantId> {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Recovery that shells out to an operator-supplied command.
///
/// The tenant id is passed as `RELAY_TENANT`; a non-zero exit is a failure.
pub struct CommandRecovery {
    command: String,
}

impl CommandRecovery {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SessionRecovery for CommandRecovery {
    async fn recover(&self, tenant: TenantId) -> anyhow::Result<()> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RELAY_TENANT", tenant.to_string())
            // The registry drops this future on timeout; take the child with it.
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "recovery command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        tracing::debug!(tenant = tenant, "Recovery command finished");
        Ok(())
    }
}
