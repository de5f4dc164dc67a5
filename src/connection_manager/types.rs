//! Connection handle and related types

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::tenant::TenantId;
use crate::websocket::{CloseReason, OutboundFrame};

/// Handle for a single tenant duplex connection.
///
/// The socket task owns the other ends (`ConnectionIo`); the registry only
/// ever talks to the connection through this handle.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub address: String,
    pub connected_at: DateTime<Utc>,
    /// Stamped once by the registry on successful registration
    tenant: OnceLock<TenantId>,
    sender: mpsc::Sender<OutboundFrame>,
    close_tx: watch::Sender<Option<CloseReason>>,
    /// Set when the registry no longer wants events from this connection
    detached: AtomicBool,
}

/// Socket-side ends of a `ConnectionHandle`
pub struct ConnectionIo {
    pub outbound: mpsc::Receiver<OutboundFrame>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl ConnectionHandle {
    pub fn new(address: impl Into<String>, buffer: usize) -> (Arc<Self>, ConnectionIo) {
        let (sender, outbound) = mpsc::channel(buffer.max(1));
        let (close_tx, close) = watch::channel(None);

        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            address: address.into(),
            connected_at: Utc::now(),
            tenant: OnceLock::new(),
            sender,
            close_tx,
            detached: AtomicBool::new(false),
        });

        (handle, ConnectionIo { outbound, close })
    }

    /// Tenant this connection was registered under, if any
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant.get().copied()
    }

    pub(crate) fn stamp_tenant(&self, tenant: TenantId) -> Result<(), RegistryError> {
        let stamped = *self.tenant.get_or_init(|| tenant);
        if stamped != tenant {
            return Err(RegistryError::TenantMismatch {
                registered: stamped,
                requested: tenant,
            });
        }
        Ok(())
    }

    pub async fn send_text(&self, text: String) -> Result<(), RegistryError> {
        self.sender
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|_| RegistryError::ConnectionClosed(self.id))
    }

    pub async fn ping(&self) -> Result<(), RegistryError> {
        self.sender
            .send(OutboundFrame::Ping)
            .await
            .map_err(|_| RegistryError::ConnectionClosed(self.id))
    }

    /// Ask the socket task to close the connection. Only the first reason sticks.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some() || self.sender.is_closed()
    }

    /// Stop routing this connection's frames and ignore its teardown
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// What the acceptor knows about a connecting client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Raw `authIndex` supplied by the client
    pub auth_index: Option<i64>,
    pub address: String,
}

impl ClientInfo {
    pub fn new(auth_index: Option<i64>, address: impl Into<String>) -> Self {
        Self {
            auth_index,
            address: address.into(),
        }
    }

    /// The tenant id, if `auth_index` is a valid non-negative integer
    pub fn tenant(&self) -> Option<TenantId> {
        self.auth_index.and_then(|raw| TenantId::try_from(raw).ok())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid tenant id: {0:?}")]
    InvalidTenant(Option<i64>),

    #[error("connection already registered for tenant {registered}, not {requested}")]
    TenantMismatch {
        registered: TenantId,
        requested: TenantId,
    },

    #[error("connection {0} is closed")]
    ConnectionClosed(Uuid),
}

/// Events published by the registry. Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    ConnectionAdded { tenant: TenantId, address: String },
    ConnectionRemoved { tenant: TenantId },
    /// Grace period ran out without a reconnect
    ConnectionLost { tenant: TenantId },
}

/// Timer settings for the reconnect state machine
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub grace_period: Duration,
    pub recovery_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            recovery_timeout: Duration::from_secs(55),
        }
    }
}

impl From<&RelayConfig> for RegistryConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            recovery_timeout: config.recovery_timeout(),
        }
    }
}
