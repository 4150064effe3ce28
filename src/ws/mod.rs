//! WebSocket namespace.
//!
//! One authenticated duplex connection per client. The first frame must
//! be an `auth` event carrying a bearer token; afterwards the actor
//! multiplexes client events (colon-routed to handlers) with room
//! fan-out from the bus. Room membership is a set of forwarder tasks,
//! one per joined room, feeding a single outbound channel.

pub mod handlers;
pub mod protocol;
pub mod session;

use crate::api::AppState;
use crate::events::{user_room, Envelope};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use protocol::{AuthPayload, ClientFrame, ServerFrame};
use serde_json::json;
use session::WsSession;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 256;

/// HTTP handler for `GET /ws`. Refused outright while draining.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.shutdown.is_accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is draining").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let Some(session) = authenticate(&mut socket, &state).await else {
        return;
    };
    info!(user_id = session.user_id(), request_id = %session.request_id, "ws connected");

    let (event_tx, mut event_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
    let mut rooms: HashMap<String, JoinHandle<()>> = HashMap::new();

    // Every session lives in its user room from connect.
    join_room(
        &state,
        &mut rooms,
        user_room(session.user_id()),
        event_tx.clone(),
    );
    send_frame(
        &mut socket,
        &ServerFrame::push(
            "connected",
            json!({
                "user_id": session.user_id(),
                "user_name": session.user_name(),
                "request_id": session.request_id,
            }),
        ),
    )
    .await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_frame(&mut socket, &state, &session, &mut rooms, &event_tx, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(error = %e, "ws recv error");
                        break;
                    }
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                // The sender's own chat:message broadcast is for peers only.
                if event.event == "chat:message"
                    && event.data["user_id"] == json!(session.user_id())
                {
                    continue;
                }
                send_frame(&mut socket, &ServerFrame::push(event.event, event.data)).await;
            }
        }
    }

    for (_, handle) in rooms {
        handle.abort();
    }
    info!(user_id = session.user_id(), "ws disconnected");
}

/// Returns false when the connection must close (expired token).
async fn handle_client_frame(
    socket: &mut WebSocket,
    state: &AppState,
    session: &WsSession,
    rooms: &mut HashMap<String, JoinHandle<()>>,
    event_tx: &mpsc::Sender<Envelope>,
    text: &str,
) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "invalid ws frame");
            send_frame(
                socket,
                &ServerFrame::push("error", json!({"error": format!("invalid frame: {e}")})),
            )
            .await;
            return true;
        }
    };

    // Expiry is checked before every handler, not only at connect.
    if session.token_expired() {
        send_frame(
            socket,
            &ServerFrame::push("auth_error", json!({"error": "token expired"})),
        )
        .await;
        return false;
    }

    // Head-based sampling: unsampled events still run, just without a span.
    let span = if state.span_filter.sample() {
        tracing::info_span!(
            "ws_event",
            event = %frame.event,
            user_id = session.user_id(),
            request_id = %session.request_id,
        )
    } else {
        tracing::Span::none()
    };

    match handlers::dispatch_event(state, session, &frame.event, frame.data)
        .instrument(span)
        .await
    {
        Ok(output) => {
            if let Some(room) = output.join_room {
                join_room(state, rooms, room, event_tx.clone());
            }
            if let Some(room) = output.leave_room {
                if let Some(handle) = rooms.remove(&room) {
                    handle.abort();
                }
            }
            for event in output.direct {
                send_frame(socket, &ServerFrame::push(event.event, event.data)).await;
            }
            send_frame(socket, &ServerFrame::reply(frame.ack, output.ack)).await;
        }
        Err(e) => {
            debug!(event = %frame.event, error = %e, "ws handler error");
            send_frame(
                socket,
                &ServerFrame::reply(
                    frame.ack,
                    json!({"error": e.to_string(), "kind": e.kind()}),
                ),
            )
            .await;
        }
    }
    true
}

/// Handshake: the first frame must be `auth` with a valid bearer token.
async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Option<WsSession> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await.ok()??;
    let Ok(Message::Text(text)) = first else {
        return None;
    };
    let frame: ClientFrame = serde_json::from_str(&text).ok()?;
    if frame.event != "auth" {
        send_frame(
            socket,
            &ServerFrame::push("auth_error", json!({"error": "expected auth handshake"})),
        )
        .await;
        return None;
    }
    let payload: AuthPayload = match serde_json::from_value(frame.data) {
        Ok(payload) => payload,
        Err(_) => {
            send_frame(
                socket,
                &ServerFrame::push("auth_error", json!({"error": "missing token"})),
            )
            .await;
            return None;
        }
    };

    match crate::auth::validate_token(&payload.token, &state.settings.jwt_secret) {
        Ok(user) => Some(WsSession::new(user)),
        Err(e) => {
            send_frame(
                socket,
                &ServerFrame::push("auth_error", json!({"error": e.to_string()})),
            )
            .await;
            None
        }
    }
}

/// Start forwarding a room's events into this connection's outbound
/// channel. Joining an already-joined room is a no-op.
fn join_room(
    state: &AppState,
    rooms: &mut HashMap<String, JoinHandle<()>>,
    room: String,
    tx: mpsc::Sender<Envelope>,
) {
    if rooms.contains_key(&room) {
        return;
    }
    let mut subscription = state.bus.subscribe(&room);
    let handle = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    rooms.insert(room, handle);
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) {
    if let Ok(raw) = serde_json::to_string(frame) {
        let _ = socket.send(Message::Text(raw)).await;
    }
}
