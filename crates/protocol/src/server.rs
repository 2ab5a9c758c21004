//! Server → Client messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Chat relay
    Message {
        sender: Sender,
        message: String,
    },
    History {
        sender: Sender,
        message: String,
        timestamp: DateTime<Utc>,
    },

    // State sync
    Snapshot {
        sender: Sender,
        mode: SessionMode,
        status: SessionStatus,
        #[serde(rename = "assignedAgent")]
        assigned_agent: Assignee,
    },
    SessionEnded {
        sender: Sender,
        #[serde(rename = "sessionId")]
        session_id: String,
        status: SessionStatus,
        reason: String,
    },

    // Dashboards
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
        action: String,
    },

    // Errors
    DeliveryFailed {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        reason: String,
    },
}

impl ServerMessage {
    /// State-sync frame describing who owns `session`.
    pub fn snapshot(session: &Session) -> Self {
        ServerMessage::Snapshot {
            sender: Sender::System,
            mode: session.mode,
            status: session.status,
            assigned_agent: session.assigned_agent.clone(),
        }
    }

    pub fn relay(sender: Sender, message: impl Into<String>) -> Self {
        ServerMessage::Message {
            sender,
            message: message.into(),
        }
    }

    pub fn history(message: &ChatMessage) -> Self {
        ServerMessage::History {
            sender: message.sender,
            message: message.text.clone(),
            timestamp: message.timestamp,
        }
    }

    pub fn ended(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerMessage::SessionEnded {
            sender: Sender::System,
            session_id: session_id.into(),
            status: SessionStatus::Completed,
            reason: reason.into(),
        }
    }

    pub fn delivery_failed(session_id: Option<String>, reason: impl Into<String>) -> Self {
        ServerMessage::DeliveryFailed {
            session_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_frame_keeps_sender_and_message_keys() {
        let json = serde_json::to_value(ServerMessage::relay(Sender::Agent, "hi")).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["sender"], "agent");
        assert_eq!(json["message"], "hi");
    }

    #[test]
    fn snapshot_frame_uses_assigned_agent_key() {
        let now = Utc::now();
        let session = Session {
            id: "s".into(),
            user_id: "u".into(),
            assigned_agent: Assignee::System,
            mode: SessionMode::System,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        };
        let json = serde_json::to_value(ServerMessage::snapshot(&session)).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["sender"], "system");
        assert_eq!(json["mode"], "system");
        assert_eq!(json["status"], "active");
        assert_eq!(json["assignedAgent"], "System");
    }

    #[test]
    fn history_frame_is_tagged() {
        let message = ChatMessage {
            id: 1,
            session_id: "s".into(),
            sender: Sender::User,
            text: "hello".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(ServerMessage::history(&message)).unwrap();
        assert_eq!(json["type"], "history");
        assert_eq!(json["sender"], "user");
        assert_eq!(json["message"], "hello");
    }

    #[test]
    fn delivery_failed_omits_missing_session() {
        let json =
            serde_json::to_value(ServerMessage::delivery_failed(None, "malformed frame")).unwrap();
        assert_eq!(json["type"], "delivery_failed");
        assert!(json.get("sessionId").is_none());
    }
}
