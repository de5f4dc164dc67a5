use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::metrics::{ConnectionMetrics, QueueMetrics, ReconnectMetrics, RoutingMetrics};
use crate::queue::{MessageQueue, QueueItem};
use crate::tenant::{SessionRecovery, TenantDirectory, TenantId};
use crate::websocket::{CloseReason, EventKind, FrameError, InboundEvent, InboundFrame};

use super::recovery::{GraceTimer, Release};
use super::stats::{ConnectionInfo, RegistryStats};
use super::types::{ClientInfo, ConnectionHandle, RegistryConfig, RegistryError, RegistryEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the registry tracks for one tenant
#[derive(Default)]
pub(super) struct TenantSlot {
    pub(super) connection: Option<Arc<ConnectionHandle>>,
    /// Present while the tenant is inside its reconnect grace period
    pub(super) grace_timer: Option<GraceTimer>,
    /// A recovery attempt is in flight
    pub(super) reconnecting: bool,
}

impl TenantSlot {
    fn is_vacant(&self) -> bool {
        self.connection.is_none() && self.grace_timer.is_none() && !self.reconnecting
    }
}

/// Tracks one live connection per tenant and routes inbound frames to
/// per-request queues.
pub struct ConnectionRegistry {
    pub(super) config: RegistryConfig,
    pub(super) directory: Arc<dyn TenantDirectory>,
    pub(super) recovery: Option<Arc<dyn SessionRecovery>>,
    /// tenant -> connection, grace timer, reconnecting flag
    pub(super) tenants: DashMap<TenantId, TenantSlot>,
    /// request_id -> queue
    queues: DashMap<String, Arc<MessageQueue>>,
    events: broadcast::Sender<RegistryEvent>,
    pub(super) timer_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig, directory: Arc<dyn TenantDirectory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            directory,
            recovery: None,
            tenants: DashMap::new(),
            queues: DashMap::new(),
            events,
            timer_generation: AtomicU64::new(0),
        }
    }

    /// Install the callback used when a tenant stays lost past its grace period
    pub fn with_recovery(mut self, recovery: Arc<dyn SessionRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Register a connection as the one live connection for its tenant.
    ///
    /// An invalid tenant id closes the connection and leaves the registry
    /// untouched. An existing connection for the same tenant is detached and
    /// closed as `Replaced`.
    pub fn add_connection(
        &self,
        handle: Arc<ConnectionHandle>,
        info: &ClientInfo,
    ) -> Result<TenantId, RegistryError> {
        let Some(tenant) = info.tenant() else {
            tracing::warn!(
                connection_id = %handle.id,
                address = %info.address,
                auth_index = ?info.auth_index,
                "Rejecting connection with invalid authIndex"
            );
            ConnectionMetrics::record_rejected();
            handle.close(CloseReason::InvalidTenant);
            return Err(RegistryError::InvalidTenant(info.auth_index));
        };

        handle.stamp_tenant(tenant)?;

        let (previous, pending_timer) = {
            let mut slot = self.tenants.entry(tenant).or_default();
            let previous = slot.connection.replace(handle.clone());
            (previous, slot.grace_timer.take())
        };

        let replaced = previous.filter(|p| p.id != handle.id);
        if let Some(previous) = &replaced {
            previous.detach();
            previous.close(CloseReason::Replaced);
            ConnectionMetrics::record_replaced();
            tracing::warn!(
                tenant = tenant,
                old_connection_id = %previous.id,
                new_connection_id = %handle.id,
                "Replaced existing connection for tenant"
            );
        }

        let resumed = pending_timer.is_some();
        if let Some(timer) = pending_timer {
            timer.cancel();
            ReconnectMetrics::record_grace_cancelled();
            tracing::info!(tenant = tenant, "Tenant reconnected within grace period");
        }

        // The backend aborts everything in flight when its connection drops,
        // so requests of the primary tenant cannot survive a reconnect. A first
        // connect leaves other tenants' requests alone.
        if (resumed || replaced.is_some())
            && self.directory.current_tenant() == Some(tenant)
            && !self.queues.is_empty()
        {
            let closed = self.close_all_message_queues();
            tracing::info!(
                tenant = tenant,
                closed_queues = closed,
                "Current tenant reconnected; closed stale request queues"
            );
        }

        ConnectionMetrics::record_opened();
        ConnectionMetrics::set_active(self.connection_count());

        tracing::info!(
            tenant = tenant,
            connection_id = %handle.id,
            address = %info.address,
            "Connection registered"
        );

        self.emit(RegistryEvent::ConnectionAdded {
            tenant,
            address: info.address.clone(),
        });

        Ok(tenant)
    }

    pub fn get_connection_by_tenant(&self, tenant: TenantId) -> Option<Arc<ConnectionHandle>> {
        self.tenants
            .get(&tenant)
            .and_then(|slot| slot.connection.clone())
    }

    /// Close a tenant's connection on purpose (account switch).
    ///
    /// The entry is removed right away and no grace period follows.
    pub fn close_connection_by_tenant(&self, tenant: TenantId) -> bool {
        let (connection, timer) = match self.tenants.get_mut(&tenant) {
            Some(mut slot) => (slot.connection.take(), slot.grace_timer.take()),
            None => (None, None),
        };
        self.prune(tenant);

        if let Some(timer) = timer {
            timer.cancel();
        }

        let Some(connection) = connection else {
            return false;
        };

        connection.detach();
        connection.close(CloseReason::Requested);
        ConnectionMetrics::set_active(self.connection_count());

        tracing::info!(
            tenant = tenant,
            connection_id = %connection.id,
            "Connection closed on request"
        );

        self.emit(RegistryEvent::ConnectionRemoved { tenant });
        true
    }

    /// Teardown for a connection whose socket ended (close or error).
    ///
    /// Starts the reconnect grace period unless the connection was detached,
    /// never registered, or is no longer the tenant's current connection.
    pub fn connection_closed(self: &Arc<Self>, handle: &Arc<ConnectionHandle>) {
        let Some(tenant) = handle.tenant() else {
            tracing::debug!(
                connection_id = %handle.id,
                "Unregistered connection closed"
            );
            return;
        };

        if handle.is_detached() {
            tracing::debug!(
                tenant = tenant,
                connection_id = %handle.id,
                "Detached connection closed"
            );
            return;
        }

        if self.release_connection(tenant, handle.id) == Release::NotRegistered {
            return;
        }

        ConnectionMetrics::set_active(self.connection_count());
        tracing::info!(
            tenant = tenant,
            connection_id = %handle.id,
            "Connection removed"
        );
        self.emit(RegistryEvent::ConnectionRemoved { tenant });
    }

    /// Close every connection, e.g. on shutdown. Pending grace timers are cancelled.
    pub fn close_all_connections(&self, reason: CloseReason) -> usize {
        let tenants: Vec<TenantId> = self.tenants.iter().map(|e| *e.key()).collect();
        let mut closed = 0;

        for tenant in tenants {
            let (connection, timer) = match self.tenants.get_mut(&tenant) {
                Some(mut slot) => (slot.connection.take(), slot.grace_timer.take()),
                None => continue,
            };
            self.prune(tenant);

            if let Some(timer) = timer {
                timer.cancel();
            }
            if let Some(connection) = connection {
                connection.detach();
                connection.close(reason);
                self.emit(RegistryEvent::ConnectionRemoved { tenant });
                closed += 1;
            }
        }

        ConnectionMetrics::set_active(self.connection_count());
        closed
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Deliver one raw inbound frame to the queue named by its `request_id`.
    ///
    /// Never fails: malformed, unaddressed, orphaned and unknown frames are
    /// logged and dropped.
    pub fn route_inbound_frame(&self, tenant: TenantId, raw: &str) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(FrameError::MissingRequestId) => {
                RoutingMetrics::record_missing_request_id();
                tracing::warn!(tenant = tenant, "Dropping frame without request_id");
                return;
            }
            Err(e) => {
                RoutingMetrics::record_malformed();
                tracing::error!(tenant = tenant, error = %e, "Dropping malformed frame");
                return;
            }
        };

        let Some(queue) = self.get_message_queue(&frame.request_id) else {
            RoutingMetrics::record_no_queue();
            tracing::warn!(
                tenant = tenant,
                request_id = %frame.request_id,
                "No queue for request; dropping frame"
            );
            return;
        };

        match frame.kind() {
            Some(EventKind::StreamClose) => {
                queue.enqueue(QueueItem::StreamEnd);
                RoutingMetrics::record_routed(EventKind::StreamClose.as_str());
            }
            Some(kind) => {
                queue.enqueue(QueueItem::Event(InboundEvent {
                    kind,
                    payload: frame.body,
                }));
                RoutingMetrics::record_routed(kind.as_str());
            }
            None => {
                RoutingMetrics::record_unknown_event();
                tracing::warn!(
                    tenant = tenant,
                    request_id = %frame.request_id,
                    event_type = ?frame.event_type,
                    "Unrecognized event type; dropping frame"
                );
            }
        }
    }

    // ========================================================================
    // Message queues
    // ========================================================================

    pub fn create_message_queue(&self, request_id: impl Into<String>) -> Arc<MessageQueue> {
        let request_id = request_id.into();
        let queue = Arc::new(MessageQueue::new(request_id.clone()));

        if let Some(previous) = self.queues.insert(request_id.clone(), queue.clone()) {
            previous.close();
            tracing::warn!(
                request_id = %request_id,
                "Request id reused while in flight; closed previous queue"
            );
        }

        QueueMetrics::set_active(self.queues.len());
        tracing::debug!(request_id = %request_id, "Message queue created");
        queue
    }

    pub fn get_message_queue(&self, request_id: &str) -> Option<Arc<MessageQueue>> {
        self.queues.get(request_id).map(|q| q.clone())
    }

    /// Close and forget a request's queue
    pub fn remove_message_queue(&self, request_id: &str) -> bool {
        let Some((_, queue)) = self.queues.remove(request_id) else {
            return false;
        };
        queue.close();
        QueueMetrics::set_active(self.queues.len());
        tracing::debug!(request_id = %request_id, "Message queue removed");
        true
    }

    /// Close and forget every queue. Returns how many queues this call closed.
    pub fn close_all_message_queues(&self) -> usize {
        let request_ids: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;

        for request_id in request_ids {
            if let Some((_, queue)) = self.queues.remove(&request_id) {
                if queue.close() {
                    closed += 1;
                }
            }
        }

        QueueMetrics::set_active(self.queues.len());
        if closed > 0 {
            QueueMetrics::record_force_closed(closed);
            tracing::info!(closed = closed, "Closed all message queues");
        }
        closed
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn connection_count(&self) -> usize {
        self.tenants
            .iter()
            .filter(|slot| slot.connection.is_some())
            .count()
    }

    pub fn connected_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .tenants
            .iter()
            .filter(|slot| slot.connection.is_some())
            .map(|slot| *slot.key())
            .collect();
        tenants.sort_unstable();
        tenants
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.tenants
            .iter()
            .filter_map(|slot| slot.connection.clone())
            .collect()
    }

    pub fn has_grace_timer(&self, tenant: TenantId) -> bool {
        self.tenants
            .get(&tenant)
            .is_some_and(|slot| slot.grace_timer.is_some())
    }

    pub fn is_reconnecting(&self, tenant: TenantId) -> bool {
        self.tenants
            .get(&tenant)
            .is_some_and(|slot| slot.reconnecting)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut connections = Vec::new();
        let mut pending_grace_periods = 0;
        let mut reconnecting_tenants = 0;

        for entry in self.tenants.iter() {
            if let Some(conn) = &entry.connection {
                connections.push(ConnectionInfo {
                    tenant: *entry.key(),
                    connection_id: conn.id,
                    address: conn.address.clone(),
                    connected_at: conn.connected_at,
                });
            }
            if entry.grace_timer.is_some() {
                pending_grace_periods += 1;
            }
            if entry.reconnecting {
                reconnecting_tenants += 1;
            }
        }
        connections.sort_by_key(|c| c.tenant);

        RegistryStats {
            total_connections: connections.len(),
            pending_grace_periods,
            reconnecting_tenants,
            active_queues: self.queues.len(),
            connections,
        }
    }

    /// Drop the tenant's slot once nothing is left in it
    pub(super) fn prune(&self, tenant: TenantId) {
        self.tenants.remove_if(&tenant, |_, slot| slot.is_vacant());
    }
}
