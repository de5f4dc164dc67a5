//! Connection registry for tenant duplex connections
//!
//! This module provides:
//! - One live connection per tenant, with takeover of older connections
//! - Routing of inbound frames to per-request message queues
//! - The reconnect grace period and bounded recovery attempts
//! - Registry statistics and lifecycle events

mod recovery;
mod registry;
mod stats;
mod types;

pub use registry::ConnectionRegistry;
pub use stats::{ConnectionInfo, RegistryStats};
pub use types::{
    ClientInfo, ConnectionHandle, ConnectionIo, RegistryConfig, RegistryError, RegistryEvent,
};
