//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONNECTIONS_ACTIVE, CONNECTIONS_OPENED_TOTAL, CONNECTIONS_REJECTED_TOTAL,
    CONNECTIONS_REPLACED_TOTAL, FRAMES_DROPPED_TOTAL, FRAMES_ROUTED_TOTAL, GRACE_PERIODS_TOTAL,
    QUEUES_ACTIVE, QUEUES_FORCE_CLOSED_TOTAL, RECOVERY_ATTEMPTS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED_TOTAL.inc();
    }

    pub fn record_replaced() {
        CONNECTIONS_REPLACED_TOTAL.inc();
    }

    pub fn record_rejected() {
        CONNECTIONS_REJECTED_TOTAL.inc();
    }

    pub fn set_active(count: usize) {
        CONNECTIONS_ACTIVE.set(count as i64);
    }
}

pub struct RoutingMetrics;

impl RoutingMetrics {
    pub fn record_routed(kind: &str) {
        FRAMES_ROUTED_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn record_malformed() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["malformed"]).inc();
    }

    pub fn record_missing_request_id() {
        FRAMES_DROPPED_TOTAL
            .with_label_values(&["missing_request_id"])
            .inc();
    }

    pub fn record_no_queue() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["no_queue"]).inc();
    }

    pub fn record_unknown_event() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["unknown_event"]).inc();
    }
}

pub struct ReconnectMetrics;

impl ReconnectMetrics {
    pub fn record_grace_started() {
        GRACE_PERIODS_TOTAL.with_label_values(&["started"]).inc();
    }

    pub fn record_grace_cancelled() {
        GRACE_PERIODS_TOTAL.with_label_values(&["cancelled"]).inc();
    }

    pub fn record_grace_expired() {
        GRACE_PERIODS_TOTAL.with_label_values(&["expired"]).inc();
    }

    pub fn record_recovery(outcome: &str) {
        RECOVERY_ATTEMPTS_TOTAL.with_label_values(&[outcome]).inc();
    }
}

pub struct QueueMetrics;

impl QueueMetrics {
    pub fn set_active(count: usize) {
        QUEUES_ACTIVE.set(count as i64);
    }

    pub fn record_force_closed(count: usize) {
        QUEUES_FORCE_CLOSED_TOTAL.inc_by(count as u64);
    }
}
