//! Core types shared across the protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Assigned-agent value for sessions owned by the AI responder.
pub const SYSTEM_AGENT: &str = "System";

/// Who currently answers within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    System,
    Human,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::System => "system",
            SessionMode::Human => "human",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(SessionMode::System),
            "human" => Some(SessionMode::Human),
            _ => None,
        }
    }
}

/// Session lifecycle status. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingForAgent,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::WaitingForAgent => "waiting_for_agent",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "waiting_for_agent" => Some(SessionStatus::WaitingForAgent),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    /// Statuses that count as an open conversation.
    pub const OPEN: [SessionStatus; 2] = [SessionStatus::Active, SessionStatus::WaitingForAgent];

    pub fn is_open(self) -> bool {
        self != SessionStatus::Completed
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
    System,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Agent => "agent",
            Sender::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "agent" => Some(Sender::Agent),
            "system" | "ai" => Some(Sender::System),
            _ => None,
        }
    }
}

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(AgentStatus::Available),
            "busy" => Some(AgentStatus::Busy),
            _ => None,
        }
    }
}

/// Current owner of a session. Serializes to the agent id or the
/// `System` sentinel, so `mode` and `assignedAgent` cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Assignee {
    System,
    Agent(String),
}

impl Assignee {
    pub fn from_wire(value: &str) -> Self {
        if value == SYSTEM_AGENT || value.is_empty() {
            Assignee::System
        } else {
            Assignee::Agent(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Assignee::System => SYSTEM_AGENT,
            Assignee::Agent(id) => id,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Assignee::System => None,
            Assignee::Agent(id) => Some(id),
        }
    }

    /// The mode implied by this owner.
    pub fn mode(&self) -> SessionMode {
        match self {
            Assignee::System => SessionMode::System,
            Assignee::Agent(_) => SessionMode::Human,
        }
    }
}

impl Serialize for Assignee {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Assignee {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Assignee::from_wire(&raw))
    }
}

/// A support conversation as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: String,
    pub user_id: String,
    pub assigned_agent: Assignee,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// `mode == human` iff `assigned_agent` is a real agent.
    pub fn is_consistent(&self) -> bool {
        self.mode == self.assigned_agent.mode()
    }

    /// The agent answering this session, if a human owns it.
    pub fn human_agent(&self) -> Option<&str> {
        match self.mode {
            SessionMode::Human => self.assigned_agent.agent_id(),
            SessionMode::System => None,
        }
    }
}

/// An append-only chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Agent record (owned by the excluded CRUD layer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
}

/// Read-only user profile details shown to agents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignee_sentinel_maps_to_system_mode() {
        assert_eq!(Assignee::from_wire("System"), Assignee::System);
        assert_eq!(Assignee::from_wire(""), Assignee::System);
        assert_eq!(Assignee::System.mode(), SessionMode::System);
        assert_eq!(
            Assignee::from_wire("agent-7").mode(),
            SessionMode::Human
        );
    }

    #[test]
    fn session_serializes_with_wire_field_names() {
        let now = Utc::now();
        let session = Session {
            id: "s-1".into(),
            user_id: "u@example.com".into(),
            assigned_agent: Assignee::Agent("a-1".into()),
            mode: SessionMode::Human,
            status: SessionStatus::WaitingForAgent,
            created_at: now,
            last_activity: now,
        };
        let value = serde_json::to_value(&session).expect("serialize");
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["userId"], "u@example.com");
        assert_eq!(value["assignedAgent"], "a-1");
        assert_eq!(value["mode"], "human");
        assert_eq!(value["status"], "waiting_for_agent");
        assert!(session.is_consistent());
    }

    #[test]
    fn mismatched_mode_is_inconsistent() {
        let now = Utc::now();
        let session = Session {
            id: "s-2".into(),
            user_id: "u".into(),
            assigned_agent: Assignee::System,
            mode: SessionMode::Human,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        };
        assert!(!session.is_consistent());
        assert_eq!(session.human_agent(), None);
    }

    #[test]
    fn legacy_ai_sender_parses_as_system() {
        assert_eq!(Sender::parse("ai"), Some(Sender::System));
        assert_eq!(Sender::parse("robot"), None);
    }
}
