// HTTP surface next to the Unix socket:
//
//   GET /rpc                   WebSocket, one JSON-RPC response per message
//   GET /subscribe?topic=...   WebSocket, pushes notifications under a topic prefix
//   GET /documents/{id}/text   current body as text/plain

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use emendare_common::protocol::topics;
use emendare_common::types::DocumentId;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::engine::EngineError;
use crate::notify::{BroadcastPublisher, Notification};
use crate::rpc::methods::{handle_raw_request, RpcServerState};

#[derive(Clone)]
pub struct HttpState {
    rpc: RpcServerState,
    notifications: BroadcastPublisher,
}

impl HttpState {
    pub fn new(rpc: RpcServerState, notifications: BroadcastPublisher) -> Self {
        Self { rpc, notifications }
    }
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    #[serde(default)]
    topic: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/rpc", get(rpc_ws_route))
        .route("/subscribe", get(subscribe_route))
        .route("/documents/{id}/text", get(document_text_route))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: HttpState) -> Result<()> {
    axum::serve(listener, router(state)).await.context("daemon http server failed")
}

pub async fn serve_until_shutdown(
    listener: TcpListener,
    state: HttpState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("daemon http server failed")
}

async fn rpc_ws_route(ws: WebSocketUpgrade, State(state): State<HttpState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_rpc_socket(socket, state.rpc))
}

async fn handle_rpc_socket(mut socket: WebSocket, state: RpcServerState) {
    while let Some(message_result) = socket.recv().await {
        let Ok(message) = message_result else {
            break;
        };

        let reply = match message {
            WsMessage::Text(payload) => {
                let response = handle_raw_request(payload.as_bytes(), &state).await;
                match serde_json::to_string(&response) {
                    Ok(encoded) => WsMessage::Text(encoded.into()),
                    Err(error) => {
                        warn!(%error, "failed to encode websocket rpc response");
                        break;
                    }
                }
            }
            WsMessage::Binary(payload) => {
                let response = handle_raw_request(payload.as_ref(), &state).await;
                match serde_json::to_vec(&response) {
                    Ok(encoded) => WsMessage::Binary(encoded.into()),
                    Err(error) => {
                        warn!(%error, "failed to encode websocket rpc response");
                        break;
                    }
                }
            }
            WsMessage::Ping(payload) => WsMessage::Pong(payload),
            WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => break,
        };

        if socket.send(reply).await.is_err() {
            break;
        }
    }
}

async fn subscribe_route(
    ws: WebSocketUpgrade,
    Query(query): Query<SubscribeQuery>,
    State(state): State<HttpState>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published meanwhile is missed.
    let notifications = state.notifications.subscribe();
    ws.on_upgrade(move |socket| handle_subscription(socket, query.topic, notifications))
}

async fn handle_subscription(
    mut socket: WebSocket,
    filter: String,
    mut notifications: broadcast::Receiver<Notification>,
) {
    debug!(filter, "subscriber connected");
    loop {
        tokio::select! {
            received = notifications.recv() => {
                let notification = match received {
                    Ok(notification) => notification,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(filter, skipped, "subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !topics::matches(&filter, &notification.topic) {
                    continue;
                }
                let Ok(encoded) = serde_json::to_string(&notification) else {
                    continue;
                };
                if socket.send(WsMessage::Text(encoded.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Ping(payload))) => {
                    if socket.send(WsMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(filter, "subscriber disconnected");
}

async fn document_text_route(
    Path(document_id): Path<DocumentId>,
    State(state): State<HttpState>,
) -> impl IntoResponse {
    match state.rpc.engine().get_document(document_id).await {
        Ok(document) => (StatusCode::OK, document.body),
        Err(EngineError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, format!("document {document_id} not found"))
        }
        Err(error) => {
            warn!(%error, document_id = %document_id, "failed to load document text");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
        }
    }
}
