//! Request relay over tenant connections.
//!
//! `RelayClient::forward` is the request-handling side of the registry: it
//! opens a queue under a fresh request id, sends the request over the
//! tenant's connection and drains the queue into a `RelayResponse`. The
//! queue is removed exactly once, when the lease is dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::connection_manager::ConnectionRegistry;
use crate::queue::{MessageQueue, QueueError, QueueItem};
use crate::tenant::TenantId;
use crate::websocket::EventKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("no connection for tenant {0}")]
    NoConnection(TenantId),

    #[error("request payload must be a JSON object")]
    InvalidPayload,

    #[error("failed to send request to tenant {0}")]
    SendFailed(TenantId),

    #[error("request {0} was aborted before it completed")]
    Aborted(String),

    #[error("request {0} timed out")]
    Timeout(String),
}

/// Everything the backend sent back for one request
#[derive(Debug, Clone, Serialize)]
pub struct RelayResponse {
    pub request_id: String,
    pub headers: Option<Value>,
    pub chunks: Vec<Value>,
    pub error: Option<Value>,
    /// The backend signalled a regular end of stream
    pub completed: bool,
}

impl RelayResponse {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            headers: None,
            chunks: Vec::new(),
            error: None,
            completed: false,
        }
    }
}

/// Owns a registered queue; removes it from the registry on drop
struct QueueLease<'a> {
    registry: &'a ConnectionRegistry,
    queue: Arc<MessageQueue>,
}

impl Drop for QueueLease<'_> {
    fn drop(&mut self) {
        self.registry.remove_message_queue(self.queue.request_id());
    }
}

pub struct RelayClient {
    registry: Arc<ConnectionRegistry>,
    request_timeout: Duration,
}

impl RelayClient {
    pub fn new(registry: Arc<ConnectionRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            request_timeout,
        }
    }

    /// Send `payload` to the tenant's backend and collect its response
    #[tracing::instrument(name = "relay.forward", skip(self, payload))]
    pub async fn forward(
        &self,
        tenant: TenantId,
        mut payload: Value,
    ) -> Result<RelayResponse, RelayError> {
        let connection = self
            .registry
            .get_connection_by_tenant(tenant)
            .ok_or(RelayError::NoConnection(tenant))?;

        let request_id = Uuid::new_v4().to_string();
        let fields = payload.as_object_mut().ok_or(RelayError::InvalidPayload)?;
        fields.insert("request_id".to_string(), Value::String(request_id.clone()));

        // Register before sending so no early frame can miss the queue
        let lease = QueueLease {
            registry: &self.registry,
            queue: self.registry.create_message_queue(request_id.clone()),
        };

        connection
            .send_text(payload.to_string())
            .await
            .map_err(|_| RelayError::SendFailed(tenant))?;

        tracing::debug!(request_id = %request_id, "Request sent to tenant");

        let mut response = RelayResponse::new(request_id.clone());
        loop {
            match lease.queue.dequeue_timeout(self.request_timeout).await {
                Ok(QueueItem::Event(event)) => match event.kind {
                    EventKind::ResponseHeaders => response.headers = Some(event.payload),
                    EventKind::Chunk => response.chunks.push(event.payload),
                    EventKind::Error => {
                        response.error = Some(event.payload);
                        break;
                    }
                    EventKind::StreamClose => {
                        response.completed = true;
                        break;
                    }
                },
                Ok(QueueItem::StreamEnd) => {
                    response.completed = true;
                    break;
                }
                Err(QueueError::Closed) => return Err(RelayError::Aborted(request_id)),
                Err(QueueError::Timeout) => {
                    tracing::warn!(
                        request_id = %request_id,
                        timeout_secs = self.request_timeout.as_secs(),
                        "Request timed out waiting for backend"
                    );
                    return Err(RelayError::Timeout(request_id));
                }
            }
        }

        tracing::debug!(
            request_id = %request_id,
            chunks = response.chunks.len(),
            completed = response.completed,
            "Request finished"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::{ClientInfo, ConnectionHandle, ConnectionIo, RegistryConfig};
    use crate::tenant::InMemoryTenantDirectory;
    use crate::websocket::OutboundFrame;
    use serde_json::json;

    fn setup() -> (Arc<ConnectionRegistry>, ConnectionIo) {
        let registry = Arc::new(ConnectionRegistry::new(
            RegistryConfig::default(),
            Arc::new(InMemoryTenantDirectory::default()),
        ));
        let (handle, io) = ConnectionHandle::new("10.1.1.1:5000", 8);
        registry
            .add_connection(handle, &ClientInfo::new(Some(1), "10.1.1.1:5000"))
            .unwrap();
        (registry, io)
    }

    /// Read the next request the relay sent and return its request id
    async fn next_request_id(io: &mut ConnectionIo) -> String {
        match io.outbound.recv().await {
            Some(OutboundFrame::Text(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                value["request_id"].as_str().unwrap().to_string()
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_collects_stream() {
        let (registry, mut io) = setup();
        let client = RelayClient::new(registry.clone(), Duration::from_secs(5));

        let backend = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let id = next_request_id(&mut io).await;
                let frames = [
                    json!({ "request_id": id, "event_type": "response_headers", "status": 200 }),
                    json!({ "request_id": id, "event_type": "chunk", "data": "a" }),
                    json!({ "request_id": id, "event_type": "chunk", "data": "b" }),
                    json!({ "request_id": id, "event_type": "stream_close" }),
                ];
                for frame in frames {
                    registry.route_inbound_frame(1, &frame.to_string());
                }
                io
            })
        };

        let response = client
            .forward(1, json!({ "path": "/v1/generate", "method": "POST" }))
            .await
            .unwrap();
        let _io = backend.await.unwrap();

        assert!(response.completed);
        assert_eq!(response.headers.unwrap()["status"], json!(200));
        assert_eq!(response.chunks.len(), 2);
        assert_eq!(response.chunks[1]["data"], json!("b"));
        assert!(response.error.is_none());
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_stops_on_error_event() {
        let (registry, mut io) = setup();
        let client = RelayClient::new(registry.clone(), Duration::from_secs(5));

        let backend = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let id = next_request_id(&mut io).await;
                let frame = json!({ "request_id": id, "event_type": "error", "message": "denied" });
                registry.route_inbound_frame(1, &frame.to_string());
                io
            })
        };

        let response = client.forward(1, json!({})).await.unwrap();
        let _io = backend.await.unwrap();

        assert!(!response.completed);
        assert_eq!(response.error.unwrap()["message"], json!("denied"));
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_without_connection() {
        let (registry, _io) = setup();
        let client = RelayClient::new(registry, Duration::from_secs(5));

        let result = client.forward(9, json!({})).await;
        assert_eq!(result.unwrap_err(), RelayError::NoConnection(9));
    }

    #[tokio::test]
    async fn test_forward_rejects_non_object_payload() {
        let (registry, _io) = setup();
        let client = RelayClient::new(registry.clone(), Duration::from_secs(5));

        let result = client.forward(1, json!([1, 2])).await;
        assert_eq!(result.unwrap_err(), RelayError::InvalidPayload);
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_aborted_by_bulk_close() {
        let (registry, mut io) = setup();
        let client = RelayClient::new(registry.clone(), Duration::from_secs(5));

        let backend = {
            let registry = registry.clone();
            tokio::spawn(async move {
                next_request_id(&mut io).await;
                registry.close_all_message_queues();
                io
            })
        };

        let result = client.forward(1, json!({})).await;
        let _io = backend.await.unwrap();

        assert!(matches!(result, Err(RelayError::Aborted(_))));
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_forward_times_out() {
        let (registry, _io) = setup();
        let client = RelayClient::new(registry.clone(), Duration::from_millis(30));

        let result = client.forward(1, json!({})).await;

        assert!(matches!(result, Err(RelayError::Timeout(_))));
        assert_eq!(registry.queue_count(), 0);
    }
}
