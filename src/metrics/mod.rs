//! Prometheus metrics for the relay.
//!
//! - Connection metrics (registered tenants, replacements, rejections)
//! - Routing metrics (frames routed by kind, frames dropped by reason)
//! - Reconnect metrics (grace periods, recovery outcomes)
//! - Queue metrics (in-flight request queues, force-closes)

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, QueueMetrics, ReconnectMetrics, RoutingMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Tenants with a registered connection
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of tenants with a registered connection"
    ).unwrap();

    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections accepted into the registry"
    ).unwrap();

    pub static ref CONNECTIONS_REPLACED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_replaced_total", METRIC_PREFIX),
        "Total connections closed because a newer one registered for the same tenant"
    ).unwrap();

    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total connections rejected for an invalid tenant id"
    ).unwrap();

    // ============================================================================
    // Routing Metrics
    // ============================================================================

    pub static ref FRAMES_ROUTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_routed_total", METRIC_PREFIX),
        "Inbound frames delivered to a request queue",
        &["kind"]
    ).unwrap();

    pub static ref FRAMES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_dropped_total", METRIC_PREFIX),
        "Inbound frames dropped before reaching a queue",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Reconnect Metrics
    // ============================================================================

    pub static ref GRACE_PERIODS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_grace_periods_total", METRIC_PREFIX),
        "Grace periods by outcome (started, cancelled, expired)",
        &["outcome"]
    ).unwrap();

    pub static ref RECOVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_recovery_attempts_total", METRIC_PREFIX),
        "Recovery attempts by outcome (success, failure, timeout, skipped)",
        &["outcome"]
    ).unwrap();

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    pub static ref QUEUES_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_queues_active", METRIC_PREFIX),
        "In-flight request queues"
    ).unwrap();

    pub static ref QUEUES_FORCE_CLOSED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_queues_force_closed_total", METRIC_PREFIX),
        "Request queues closed in bulk after a connection loss or takeover"
    ).unwrap();
}
