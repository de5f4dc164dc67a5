//! Reconnect grace period and recovery handling.
//!
//! Per tenant: `CONNECTED -> GRACE_PERIOD -> CONNECTED | LOST`.
//!
//! When a registered connection goes away the tenant enters its grace period,
//! represented by a `GraceTimer` in the tenant's slot. A new registration for
//! the tenant takes the timer out of the slot and aborts it. If the timer
//! fires first it claims its own slot entry (matched by generation) and
//! finalizes the loss:
//!
//! 1. the current tenant's loss closes every request queue; a background
//!    tenant's queues are left to time out on their own
//! 2. the recovery callback runs, at most once per tenant at a time and
//!    bounded by `recovery_timeout`
//! 3. `ConnectionLost` is emitted

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::metrics::ReconnectMetrics;
use crate::tenant::{SessionRecovery, TenantId};

use super::registry::ConnectionRegistry;
use super::types::RegistryEvent;

/// Pending grace period for one tenant
pub(super) struct GraceTimer {
    generation: u64,
    task: AbortHandle,
}

impl GraceTimer {
    pub(super) fn cancel(self) {
        self.task.abort();
    }
}

/// Outcome of releasing a tenant's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Release {
    /// The connection was not the tenant's registered one
    NotRegistered,
    GraceStarted,
    /// The directory reports no live session; nothing to wait for
    SessionGone,
}

/// Clears the tenant's reconnecting flag however the recovery attempt ends
struct RecoveryGuard<'a> {
    registry: &'a ConnectionRegistry,
    tenant: TenantId,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.registry.tenants.get_mut(&self.tenant) {
            slot.reconnecting = false;
        }
        self.registry.prune(self.tenant);
    }
}

impl ConnectionRegistry {
    /// Unregister a tenant's connection and enter its grace period.
    ///
    /// Clearing the connection and installing the timer happen under one slot
    /// lock, so a registration for the tenant lands either before (and this
    /// becomes a no-op) or after (and cancels the timer).
    pub(super) fn release_connection(
        self: &Arc<Self>,
        tenant: TenantId,
        connection_id: Uuid,
    ) -> Release {
        // The directory is asked before the slot is locked
        let live = self.directory.has_live_session(tenant);
        let generation = self.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let grace_period = self.config.grace_period;

        let displaced = {
            let Some(mut slot) = self.tenants.get_mut(&tenant) else {
                return Release::NotRegistered;
            };
            if !slot
                .connection
                .as_ref()
                .is_some_and(|c| c.id == connection_id)
            {
                return Release::NotRegistered;
            }
            slot.connection = None;

            if live {
                // Spawned under the lock so the timer is recorded before it can fire
                let registry = Arc::clone(self);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    registry.grace_period_expired(tenant, generation).await;
                });
                slot.grace_timer.replace(GraceTimer {
                    generation,
                    task: task.abort_handle(),
                })
            } else {
                slot.grace_timer.take()
            }
        };

        if let Some(timer) = displaced {
            timer.cancel();
        }

        if !live {
            self.prune(tenant);
            tracing::info!(
                tenant = tenant,
                "Tenant session is gone; skipping reconnect handling"
            );
            return Release::SessionGone;
        }

        ReconnectMetrics::record_grace_started();
        tracing::info!(
            tenant = tenant,
            grace_period_ms = grace_period.as_millis() as u64,
            "Connection lost; waiting for tenant to reconnect"
        );
        Release::GraceStarted
    }

    async fn grace_period_expired(&self, tenant: TenantId, generation: u64) {
        if !self.claim_grace_timer(tenant, generation) {
            return;
        }
        ReconnectMetrics::record_grace_expired();

        if self.directory.current_tenant() == Some(tenant) {
            let closed = self.close_all_message_queues();
            tracing::warn!(
                tenant = tenant,
                closed_queues = closed,
                "Current tenant did not reconnect in time; in-flight requests aborted"
            );
        } else {
            tracing::info!(
                tenant = tenant,
                "Background tenant did not reconnect in time; keeping its request queues"
            );
        }

        if let Some(recovery) = self.recovery.clone() {
            self.attempt_recovery(recovery.as_ref(), tenant).await;
        }

        self.emit(RegistryEvent::ConnectionLost { tenant });
        self.prune(tenant);
    }

    /// Take the tenant's timer if it is still the one identified by `generation`
    /// and the tenant has not registered a connection since.
    fn claim_grace_timer(&self, tenant: TenantId, generation: u64) -> bool {
        let Some(mut slot) = self.tenants.get_mut(&tenant) else {
            return false;
        };
        if !slot
            .grace_timer
            .as_ref()
            .is_some_and(|timer| timer.generation == generation)
        {
            return false;
        }
        // A connected tenant has nothing to finalize
        slot.grace_timer = None;
        slot.connection.is_none()
    }

    fn begin_recovery(&self, tenant: TenantId) -> Option<RecoveryGuard<'_>> {
        let mut slot = self.tenants.entry(tenant).or_default();
        if slot.reconnecting {
            return None;
        }
        slot.reconnecting = true;
        Some(RecoveryGuard {
            registry: self,
            tenant,
        })
    }

    async fn attempt_recovery(&self, recovery: &dyn SessionRecovery, tenant: TenantId) {
        let Some(_guard) = self.begin_recovery(tenant) else {
            ReconnectMetrics::record_recovery("skipped");
            tracing::info!(tenant = tenant, "Recovery already in progress; skipping");
            return;
        };

        let timeout = self.config.recovery_timeout;
        tracing::info!(
            tenant = tenant,
            timeout_ms = timeout.as_millis() as u64,
            "Attempting session recovery"
        );

        match tokio::time::timeout(timeout, recovery.recover(tenant)).await {
            Ok(Ok(())) => {
                ReconnectMetrics::record_recovery("success");
                tracing::info!(tenant = tenant, "Session recovery finished");
            }
            Ok(Err(e)) => {
                ReconnectMetrics::record_recovery("failure");
                tracing::error!(tenant = tenant, error = %e, "Session recovery failed");
            }
            Err(_) => {
                ReconnectMetrics::record_recovery("timeout");
                tracing::warn!(
                    tenant = tenant,
                    timeout_ms = timeout.as_millis() as u64,
                    "Session recovery timed out"
                );
            }
        }
    }
}
