use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use tracing::{debug, warn};
use youplace_shared::{ServerMessage, Viewport};

use crate::config::SSE_KEEPALIVE_SECS;
use crate::router::{ClientId, ViewportError, ViewportRouter, encode};
use crate::routes::api::AreaQuery;
use crate::state::AppState;

/// Leaves the router when the spectator's stream is dropped.
struct Subscription {
    router: Arc<ViewportRouter>,
    client_id: ClientId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.unregister(self.client_id);
        debug!(client_id = self.client_id, "spectator stream closed");
    }
}

/// Read-only live feed of one rectangle: a `room_state` snapshot, then `pixels_update` events.
pub async fn pixel_events(
    State(state): State<AppState>,
    Query(query): Query<AreaQuery>,
) -> Response {
    let Some(viewport) = state.codec.clamp_viewport(query.viewport()) else {
        return (StatusCode::BAD_REQUEST, "viewport is outside the grid").into_response();
    };

    let (client_id, mut receiver) = state.router.register(None);
    let subscription = Subscription {
        router: Arc::clone(&state.router),
        client_id,
    };
    match state.router.update_viewport(client_id, viewport) {
        Ok(_) => {}
        Err(e @ ViewportError::TooLarge { .. }) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(ViewportError::UnknownClient) => {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    state.observability.record_sse_connection();

    let stream = async_stream::stream! {
        let _subscription = subscription;

        if let Some(event) = snapshot_event(&state, viewport) {
            yield Ok::<Event, Infallible>(event);
        }

        while let Some(payload) = receiver.rx.recv().await {
            let Some(data) = event_payload(&payload) else {
                warn!(client_id, "event payload is not valid utf-8; dropping SSE event");
                continue;
            };
            yield Ok(Event::default().event("pixels_update").data(data));

            if receiver.take_lagged() {
                warn!(client_id, "SSE client lagged behind its queue; replaying snapshot");
                state.observability.record_resync();
                if let Some(event) = snapshot_event(&state, viewport) {
                    yield Ok(event);
                }
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keep-alive"),
        )
        .into_response()
}

fn snapshot_event(state: &AppState, viewport: Viewport) -> Option<Event> {
    let snapshot = state
        .authority
        .snapshot_rect(viewport, state.settings.max_snapshot_pixels);
    let payload = encode(&ServerMessage::RoomState {
        viewport,
        pixels: snapshot.pixels,
        truncated: snapshot.truncated,
    })?;
    let data = event_payload(&payload)?;
    Some(
        Event::default()
            .id(state.authority.current_seq().to_string())
            .event("room_state")
            .data(data),
    )
}

fn event_payload(bytes: &Bytes) -> Option<&str> {
    std::str::from_utf8(bytes.as_ref()).ok()
}
