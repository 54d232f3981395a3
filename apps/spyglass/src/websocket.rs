use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{self, events, Frame};
use crate::registry::Connection;
use crate::rooms::{self, Admission, ConnectRequest};
use crate::AppState;

/// Connect-time parameters, handshake style: everything rides the upgrade
/// request's query string. `sessionInfo` and `agentInfo` arrive JSON-encoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub peer_id: String,
    pub identity: String,
    #[serde(default)]
    pub session_info: Option<String>,
    #[serde(default)]
    pub agent_info: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: AppState) {
    let connection_id = protocol::generate_connection_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    // Writer task: drain the outbound queue into the socket. Ends when every
    // sender is gone or the peer stops reading.
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(id = %writer_id, %err, "dropping unserializable frame"),
            }
        }
        debug!(id = %writer_id, "writer task ended");
    });

    // Pass/fail gate; token validation design lives outside this service.
    if !authorized(&state, &params) {
        warn!(id = %connection_id, "unauthorized connect refused");
        let _ = tx.send(Frame::with_payload(
            events::ERROR,
            "unauthorized".into(),
        ));
        return;
    }

    let Some(identity) = protocol::Identity::parse(&params.identity) else {
        warn!(id = %connection_id, identity = %params.identity, "unknown identity refused");
        let _ = tx.send(Frame::with_payload(
            events::ERROR,
            "unknown identity".into(),
        ));
        return;
    };

    let session_info = match params.session_info.as_deref() {
        None => None,
        Some(raw) => match protocol::parse_object(raw) {
            Some(bag) => Some(bag),
            None => {
                warn!(id = %connection_id, "ignoring malformed sessionInfo");
                None
            }
        },
    };

    let admission = rooms::admit(
        &state.registry,
        ConnectRequest {
            connection_id: connection_id.clone(),
            identity,
            peer_id: params.peer_id.clone(),
            session_info,
            agent_info: params.agent_info.clone(),
            tx: tx.clone(),
        },
    );

    let conn: Option<Arc<Connection>> = match admission {
        Admission::Admitted(conn) => Some(conn),
        Admission::Refused(reason) => {
            debug!(id = %connection_id, ?reason, "admission refused, closing");
            return;
        }
        // Unroutable peers stay connected but exchange nothing.
        Admission::Unrouted => None,
    };

    while let Some(result) = stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                debug!(id = %connection_id, %err, "socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if let Some(conn) = conn.as_ref() {
                    dispatch_text(&state, conn, &text).await;
                }
            }
            // Some clients ship JSON in binary frames; accept those too.
            Message::Binary(data) => {
                if let (Some(conn), Ok(text)) = (conn.as_ref(), String::from_utf8(data)) {
                    dispatch_text(&state, conn, &text).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(conn) = conn.as_ref() {
        rooms::retire(&state.registry, conn);
    }
    debug!(id = %connection_id, "socket closed");
}

async fn dispatch_text(state: &AppState, conn: &Arc<Connection>, text: &str) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(id = %conn.id, %err, "ignoring unparseable frame");
            return;
        }
    };
    match frame.event.as_str() {
        events::UPDATE_EVENT => {
            rooms::handle_update(&state.registry, conn, frame.payload).await;
        }
        events::ERROR | events::CONNECT_ERROR | events::CONNECT_FAILED => {
            warn!(id = %conn.id, event = %frame.event, payload = %frame.payload, "client reported error");
        }
        _ => rooms::relay(&state.registry, conn, &frame.event, frame.payload),
    }
}

fn authorized(state: &AppState, params: &ConnectParams) -> bool {
    match state.config.ws_token.as_deref() {
        None => true,
        Some(expected) => params.token.as_deref() == Some(expected),
    }
}
