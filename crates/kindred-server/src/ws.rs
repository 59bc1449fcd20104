//! WebSocket endpoint: the real-time client protocol.
//!
//! One socket = one coordinator connection. A writer task drains the
//! connection's send queue with a per-event deadline; the reader loop
//! parses client frames and dispatches them. The first frame must be
//! `authenticate` with a valid token whose subject matches the claimed id.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use kindred_coordinator::ConnId;
use kindred_shared::protocol::{ClientEvent, ServerEvent};
use kindred_shared::ChatError;

use crate::api::AppState;
use crate::auth::verify_token;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (conn_id, queue) = state.coordinator.attach();
    let (mut sink, mut stream) = socket.split();

    let send_timeout = state.config.coordinator.send_timeout;
    let outbound = queue.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.pop().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "unserializable outbound event");
                    continue;
                }
            };
            match tokio::time::timeout(send_timeout, sink.send(Message::Text(frame.into()))).await
            {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(conn = %conn_id, "outbound send deadline exceeded, closing");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if !state.ws_limiter.check(conn_id).await {
                    state
                        .coordinator
                        .push_to(conn_id, ChatError::RateLimited.to_event());
                    continue;
                }
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => dispatch(&state, conn_id, event).await,
                    Err(e) => {
                        debug!(conn = %conn_id, error = %e, "malformed client frame");
                        state.coordinator.push_to(
                            conn_id,
                            ChatError::InvalidContent("malformed frame".into()).to_event(),
                        );
                    }
                }
            }
            Message::Close(_) => break,
            // Ping/pong handled by the websocket layer.
            _ => {}
        }
        if queue.is_closed() {
            break;
        }
    }

    // Detaching closes the queue, so the writer drains and exits.
    state.coordinator.disconnect(conn_id).await;
    state.ws_limiter.forget(&conn_id).await;
    let _ = writer.await;
}

async fn dispatch(state: &AppState, conn: ConnId, event: ClientEvent) {
    let coordinator = &state.coordinator;

    let event = match event {
        ClientEvent::Authenticate { user_id, token } => {
            let verified = token
                .as_deref()
                .and_then(|t| verify_token(t, &state.config.jwt_secret).ok())
                .is_some_and(|subject| subject == user_id);
            if !verified {
                coordinator.push_to(
                    conn,
                    ServerEvent::AuthError {
                        reason: "invalid or missing token".into(),
                    },
                );
                return;
            }
            if let Err(e) = coordinator.authenticate(conn, user_id).await {
                coordinator.push_to(
                    conn,
                    ServerEvent::AuthError {
                        reason: e.to_string(),
                    },
                );
            }
            return;
        }
        other => other,
    };

    let Some(user) = coordinator.user_of(conn) else {
        coordinator.push_to(conn, ChatError::AuthRequired.to_event());
        return;
    };

    let result = match event {
        ClientEvent::Authenticate { .. } => return,
        ClientEvent::StartSearch => coordinator.start_search(user).await,
        ClientEvent::EndSearch => coordinator.end_search(user).await,
        ClientEvent::AcceptMatch { match_id } => coordinator.accept_match(user, match_id).await,
        ClientEvent::RejectMatch { match_id } => coordinator.reject_match(user, match_id).await,
        ClientEvent::SendMessage {
            session_id,
            content,
        } => coordinator
            .send_message(user, session_id, &content)
            .await
            .map(|_| ()),
        ClientEvent::Typing { session_id } => coordinator.typing(user, session_id).await,
        ClientEvent::StopTyping { session_id } => coordinator.stop_typing(user, session_id).await,
        ClientEvent::ReadAll { session_id } => coordinator.read_all(user, session_id).await,
        ClientEvent::JoinSession { session_id } => coordinator.join_session(user, session_id).await,
    };
    if let Err(e) = result {
        coordinator.push_to(conn, e.to_event());
    }
}
