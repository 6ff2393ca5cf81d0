//! WebSocket handler — room relay for replication frames.
//!
//! DESIGN
//! ======
//! On upgrade the connection joins its room and enters a `select!` loop:
//! - binary frames from the client are decoded, stamped and fanned out to
//!   the rest of the room;
//! - frames relayed from peers are encoded and written to the socket.
//!
//! The relay does not look inside frames beyond decoding them, so the
//! participants' protocol can evolve without touching this file.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade with `?room=<name>&participant=<uuid>`
//! 2. Client frames are relayed to peers; peer frames are forwarded
//! 3. Close or socket error leaves the room

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::object::ParticipantId;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(room) = params.get("room").filter(|room| !room.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "room required").into_response();
    };
    let participant = match params.get("participant").map(String::as_str).map(Uuid::parse_str) {
        Some(Ok(participant)) => participant,
        Some(Err(_)) => return (StatusCode::BAD_REQUEST, "participant must be a uuid").into_response(),
        None => return (StatusCode::BAD_REQUEST, "participant required").into_response(),
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, room, participant))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, room: String, participant: ParticipantId) {
    let (client_id, mut client_rx) = state.join(&room, participant).await;
    info!(%client_id, %participant, %room, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        relay_bytes(&state, &room, participant, &bytes).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                let bytes = frames::encode_frame(&frame);
                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.leave(&room, client_id).await;
    info!(%client_id, %participant, "ws: client disconnected");
}

/// Decode one inbound binary message and relay it. Returns how many peers
/// it was queued for; undecodable input is logged and dropped.
async fn relay_bytes(state: &AppState, room: &str, participant: ParticipantId, bytes: &[u8]) -> usize {
    match frames::decode_frame(bytes) {
        Ok(frame) => {
            debug!(%participant, room, id = %frame.id, kind = frame.kind.as_str(), "ws: relay frame");
            state.broadcast(room, participant, frame).await
        }
        Err(e) => {
            warn!(%participant, room, error = %e, "ws: invalid inbound frame");
            0
        }
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
