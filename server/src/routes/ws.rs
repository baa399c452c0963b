use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use youplace_shared::{ClientMessage, ServerMessage, Viewport};

use crate::identity::Identity;
use crate::router::{ClientId, ClientReceiver, ViewportError, encode};
use crate::routes::{authenticate, bearer_token};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(&headers)
        .map(str::to_owned)
        .or(query.token.filter(|token| !token.is_empty()));
    let identity = match authenticate(&state, token.as_deref()).await {
        Ok(identity) => identity,
        Err(status) => return status.into_response(),
    };
    if token.is_some() && identity.is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state.observability.record_ws_connection();
    ws.on_upgrade(move |socket| run_connection(socket, state, identity))
}

async fn run_connection(socket: WebSocket, state: AppState, identity: Option<Identity>) {
    let user_id = identity.as_ref().map(|identity| identity.user_id.clone());
    let (client_id, receiver) = state.router.register(user_id.clone());
    info!(client_id, user_id = ?user_id, "live connection opened");

    state.router.send_to(
        client_id,
        &ServerMessage::Hello {
            client_id: client_id.to_string(),
            rate: user_id.as_deref().map(|user_id| state.ledger.status(user_id)),
            user_id,
        },
    );

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, receiver, state.clone(), client_id));

    // Only the latest requested viewport matters; intermediate ones are skipped.
    let (viewport_tx, viewport_rx) = watch::channel::<Option<Viewport>>(None);
    let viewport_task = tokio::spawn(viewport_loop(state.clone(), client_id, viewport_rx));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_message(&state, client_id, identity.as_ref(), &viewport_tx, text.as_str());
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client_id, error = %e, "websocket read failed");
                break;
            }
        }
    }

    viewport_task.abort();
    // Dropping the router entry closes the queue, which ends the writer.
    state.router.unregister(client_id);
    if let Err(e) = writer.await {
        warn!(client_id, error = %e, "websocket writer task failed");
    }
    info!(client_id, "live connection closed");
}

fn handle_client_message(
    state: &AppState,
    client_id: ClientId,
    identity: Option<&Identity>,
    viewport_tx: &watch::Sender<Option<Viewport>>,
    text: &str,
) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            state.router.send_to(
                client_id,
                &ServerMessage::error("bad_request", format!("unreadable message: {e}")),
            );
            return;
        }
    };

    match message {
        ClientMessage::UpdateViewport(viewport) => {
            viewport_tx.send_replace(Some(viewport));
        }
        ClientMessage::Paint {
            request_id,
            cell,
            color,
        } => {
            let Some(identity) = identity else {
                state.router.send_to(
                    client_id,
                    &ServerMessage::error("unauthorized", "sign in to paint"),
                );
                return;
            };
            let outcome = state.authority.submit_paint(identity, cell, &color);
            state.router.send_to(
                client_id,
                &ServerMessage::PaintResult {
                    request_id,
                    result: outcome.ack(),
                },
            );
        }
        ClientMessage::Ping => {
            state.router.send_to(client_id, &ServerMessage::Pong);
        }
    }
}

async fn viewport_loop(
    state: AppState,
    client_id: ClientId,
    mut viewport_rx: watch::Receiver<Option<Viewport>>,
) {
    while viewport_rx.changed().await.is_ok() {
        let Some(requested) = *viewport_rx.borrow_and_update() else {
            continue;
        };
        if !apply_viewport(&state, client_id, requested) {
            break;
        }
    }
}

/// Join the rooms of `requested` and queue a fresh snapshot. False once the client is gone.
pub(crate) fn apply_viewport(state: &AppState, client_id: ClientId, requested: Viewport) -> bool {
    let requested = requested.normalized();
    let Some(viewport) = state.codec.clamp_viewport(requested) else {
        if state.router.clear_viewport(client_id).is_err() {
            return false;
        }
        state.router.send_to(
            client_id,
            &ServerMessage::RoomState {
                viewport: requested,
                pixels: Vec::new(),
                truncated: false,
            },
        );
        return true;
    };

    match state.router.update_viewport(client_id, viewport) {
        Ok(diff) => {
            debug!(
                client_id,
                joined = diff.joined.len(),
                left = diff.left.len(),
                "viewport updated"
            );
        }
        Err(ViewportError::UnknownClient) => return false,
        Err(e @ ViewportError::TooLarge { .. }) => {
            state
                .router
                .send_to(client_id, &ServerMessage::error("viewport_too_large", e.to_string()));
            return true;
        }
    }

    let snapshot = state
        .authority
        .snapshot_rect(viewport, state.settings.max_snapshot_pixels);
    state.router.send_to(
        client_id,
        &ServerMessage::RoomState {
            viewport,
            pixels: snapshot.pixels,
            truncated: snapshot.truncated,
        },
    );
    true
}

fn text_frame(payload: &Bytes) -> Option<Message> {
    std::str::from_utf8(payload.as_ref())
        .ok()
        .map(|text| Message::Text(text.into()))
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: ClientReceiver,
    state: AppState,
    client_id: ClientId,
) {
    while let Some(payload) = receiver.rx.recv().await {
        let Some(frame) = text_frame(&payload) else {
            warn!(client_id, "outbound payload is not valid utf-8; dropping frame");
            continue;
        };
        if sink.send(frame).await.is_err() {
            break;
        }

        if receiver.take_lagged() {
            // Events were dropped for this client; a snapshot of its viewport closes the gap.
            let Some(viewport) = state.router.viewport_of(client_id) else {
                continue;
            };
            let snapshot = state
                .authority
                .snapshot_rect(viewport, state.settings.max_snapshot_pixels);
            let Some(payload) = encode(&ServerMessage::RoomState {
                viewport,
                pixels: snapshot.pixels,
                truncated: snapshot.truncated,
            }) else {
                continue;
            };
            state.observability.record_resync();
            warn!(client_id, "client lagged; replaying room snapshot");
            let Some(frame) = text_frame(&payload) else {
                continue;
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    }
    let _ = sink.close().await;
}
