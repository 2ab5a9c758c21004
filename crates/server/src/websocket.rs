//! WebSocket transport: one task pair per socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use relaydesk_protocol::{ClientMessage, ServerMessage};

use crate::error::{validate_agent_id, validate_participant, HandoffError, HandoffResult};
use crate::registry::{offer, ConnectionHandle, OutboundMessage, Participant, OUTBOUND_BUFFER};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

impl WsParams {
    /// Exactly one of `userId` / `agentId` identifies the socket.
    fn participant(&self) -> HandoffResult<Participant> {
        let user = self.user_id.as_deref().filter(|v| !v.is_empty());
        let agent = self.agent_id.as_deref().filter(|v| !v.is_empty());
        match (user, agent) {
            (Some(user_id), None) => {
                validate_participant("user", user_id)?;
                Ok(Participant::User(user_id.to_string()))
            }
            (None, Some(agent_id)) => {
                validate_agent_id(agent_id)?;
                Ok(Participant::Agent(agent_id.to_string()))
            }
            _ => Err(HandoffError::InvalidIdentity {
                kind: "connection",
                value: "exactly one of userId or agentId is required".to_string(),
            }),
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let participant = match params.participant() {
        Ok(participant) => participant,
        Err(e) => return e.into_response(),
    };
    let session_id = params.session_id.filter(|v| !v.is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, participant, session_id))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    participant: Participant,
    session_id: Option<String>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_BUFFER);
    let handle = ConnectionHandle::new(outbound_tx.clone());
    let conn_id = handle.id;

    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        participant = %participant,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Close(reason) => {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    if let Some(replaced) = state
        .handoff
        .registry()
        .register(participant.clone(), handle)
    {
        offer(&participant, &replaced, OutboundMessage::Close("replaced"));
    }

    state
        .router
        .on_open(&participant, session_id.as_deref())
        .await;

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let frame: ClientMessage = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(&text, 240),
                    "Failed to parse client message"
                );
                let _ = outbound_tx
                    .send(OutboundMessage::Json(ServerMessage::delivery_failed(
                        None,
                        "malformed_frame",
                    )))
                    .await;
                continue;
            }
        };

        state.router.route(&participant, frame).await;
    }

    state.router.on_close(&participant, conn_id).await;

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        participant = %participant,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user: Option<&str>, agent: Option<&str>) -> WsParams {
        WsParams {
            user_id: user.map(str::to_string),
            agent_id: agent.map(str::to_string),
            session_id: None,
        }
    }

    #[test]
    fn socket_identity_comes_from_exactly_one_param() {
        assert_eq!(
            params(Some("u1"), None).participant().unwrap(),
            Participant::User("u1".into())
        );
        assert_eq!(
            params(None, Some("a1")).participant().unwrap(),
            Participant::Agent("a1".into())
        );
        assert!(params(Some("u1"), Some("a1")).participant().is_err());
        assert!(params(None, None).participant().is_err());
        assert!(params(Some(""), Some("a1")).participant().is_ok());
    }

    #[test]
    fn system_sentinel_cannot_connect_as_agent() {
        assert!(params(None, Some("System")).participant().is_err());
    }

    #[test]
    fn query_string_uses_camel_case_keys() {
        let Query(parsed): Query<WsParams> =
            Query::try_from_uri(&"/ws?userId=u1&sessionId=s1".parse::<axum::http::Uri>().unwrap())
                .unwrap();
        assert_eq!(parsed.user_id.as_deref(), Some("u1"));
        assert_eq!(parsed.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn log_preview_is_char_bounded() {
        assert_eq!(truncate_for_log("héllo", 2), "hé");
    }
}
