use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Event kinds a tenant connection may send for an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ResponseHeaders,
    Chunk,
    Error,
    StreamClose,
}

impl EventKind {
    /// Map a wire `event_type` to a known kind; `None` for anything unrecognized
    pub fn from_wire(event_type: &str) -> Option<Self> {
        match event_type {
            "response_headers" => Some(Self::ResponseHeaders),
            "chunk" => Some(Self::Chunk),
            "error" => Some(Self::Error),
            "stream_close" => Some(Self::StreamClose),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseHeaders => "response_headers",
            Self::Chunk => "chunk",
            Self::Error => "error",
            Self::StreamClose => "stream_close",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame has no request_id")]
    MissingRequestId,
}

/// A parsed inbound frame. The original JSON is kept so it can be queued verbatim.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub request_id: String,
    /// Raw `event_type` as sent; may be absent or unknown
    pub event_type: Option<String>,
    pub body: Value,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let body: Value =
            serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;

        if !body.is_object() {
            return Err(FrameError::Malformed("expected a JSON object".to_string()));
        }

        let request_id = match body.get("request_id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(FrameError::MissingRequestId),
        };

        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            request_id,
            event_type,
            body,
        })
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.event_type.as_deref().and_then(EventKind::from_wire)
    }
}

/// A non-terminal event delivered to a request's queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub payload: Value,
}

/// Why the relay is closing a tenant connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Registration carried no usable tenant id
    InvalidTenant,
    /// A newer connection for the same tenant took over
    Replaced,
    /// Closed on purpose (account switch)
    Requested,
    Shutdown,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidTenant => 1008,
            Self::Replaced | Self::Requested => 1000,
            Self::Shutdown => 1001,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidTenant => "invalid authIndex",
            Self::Replaced => "replaced",
            Self::Requested => "closed by relay",
            Self::Shutdown => "server shutting down",
        }
    }
}

/// Frames queued for delivery to a tenant connection
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
}
