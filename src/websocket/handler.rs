use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::connection_manager::{ClientInfo, ConnectionHandle, ConnectionIo, ConnectionRegistry};
use crate::server::AppState;
use crate::tenant::TenantId;

use super::message::{CloseReason, OutboundFrame};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "authIndex")]
    pub auth_index: Option<String>,
}

impl WsQuery {
    /// Raw tenant index; anything that is not an integer counts as missing
    pub fn auth_index(&self) -> Option<i64> {
        self.auth_index
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
    }
}

/// WebSocket upgrade handler for backend tenant connections
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, addr, query),
    fields(address = %addr)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> Response {
    let info = ClientInfo::new(query.auth_index(), addr.to_string());
    tracing::debug!(auth_index = ?info.auth_index, "Tenant connection upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, info))
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }))
}

/// Drive an upgraded tenant connection until either side ends it
async fn handle_socket(socket: WebSocket, state: AppState, info: ClientInfo) {
    let connection_start = std::time::Instant::now();
    let (handle, io) =
        ConnectionHandle::new(info.address.clone(), state.settings.relay.outbound_buffer);
    let (mut ws_sender, ws_receiver) = socket.split();

    let tenant = match state.registry.add_connection(handle.clone(), &info) {
        Ok(tenant) => tenant,
        Err(e) => {
            tracing::warn!(address = %info.address, error = %e, "Connection rejected");
            let reason = handle.close_reason().unwrap_or(CloseReason::InvalidTenant);
            let _ = ws_sender.send(close_message(reason)).await;
            let _ = ws_sender.close().await;
            return;
        }
    };
    // A fresh connection means the backend holds a session for the tenant again
    state.directory.revive(tenant);

    let mut send_task = tokio::spawn(pump_outbound(ws_sender, io, handle.id));
    let mut recv_task = tokio::spawn(pump_inbound(
        ws_receiver,
        state.registry.clone(),
        handle.clone(),
        tenant,
    ));

    // Whichever side finishes first takes the other down with it
    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %handle.id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %handle.id, "Receive task completed");
            send_task.abort();
        }
    }

    state.registry.connection_closed(&handle);

    tracing::info!(
        tenant = tenant,
        connection_id = %handle.id,
        close_reason = ?handle.close_reason(),
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "Tenant connection closed"
    );
}

/// Forward queued frames to the socket until the handle is closed
async fn pump_outbound(
    mut ws_sender: futures::stream::SplitSink<WebSocket, Message>,
    io: ConnectionIo,
    connection_id: uuid::Uuid,
) {
    let ConnectionIo {
        mut outbound,
        mut close,
    } = io;

    loop {
        tokio::select! {
            changed = close.changed() => {
                let reason = *close.borrow();
                if let (Ok(()), Some(reason)) = (changed, reason) {
                    tracing::debug!(
                        connection_id = %connection_id,
                        code = reason.code(),
                        reason = reason.reason(),
                        "Closing connection"
                    );
                    let _ = ws_sender.send(close_message(reason)).await;
                }
                let _ = ws_sender.close().await;
                break;
            }
            frame = outbound.recv() => {
                let message = match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text.into()),
                    Some(OutboundFrame::Ping) => Message::Ping(Default::default()),
                    None => break,
                };
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Route inbound frames into the registry until the socket ends
async fn pump_inbound(
    mut ws_receiver: futures::stream::SplitStream<WebSocket>,
    registry: Arc<ConnectionRegistry>,
    handle: Arc<ConnectionHandle>,
    tenant: TenantId,
) {
    while let Some(result) = ws_receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    tenant = tenant,
                    connection_id = %handle.id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        };

        if handle.is_detached() {
            break;
        }

        match message {
            Message::Text(text) => registry.route_inbound_frame(tenant, text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => registry.route_inbound_frame(tenant, text),
                Err(_) => {
                    tracing::warn!(
                        tenant = tenant,
                        connection_id = %handle.id,
                        "Dropping non UTF-8 binary frame"
                    );
                }
            },
            Message::Close(_) => {
                tracing::debug!(connection_id = %handle.id, "Received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
