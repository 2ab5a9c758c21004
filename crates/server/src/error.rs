//! Error taxonomy for handoff and routing operations.

use thiserror::Error;

/// Failures surfaced by control-plane operations
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("invalid {kind} id: {value:?}")]
    InvalidIdentity { kind: &'static str, value: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("agent {0} is not available")]
    AgentUnavailable(String),

    #[error("{0} kept changing, try again")]
    Contended(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("completion provider unavailable: {0}")]
    UpstreamUnavailable(#[from] relaydesk_completion::CompletionError),
}

impl HandoffError {
    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            HandoffError::InvalidIdentity { .. } => "invalid_identity",
            HandoffError::NotFound(_) => "not_found",
            HandoffError::AgentUnavailable(_) => "agent_unavailable",
            HandoffError::Contended(_) => "contended",
            HandoffError::StoreUnavailable(_) => "store_unavailable",
            HandoffError::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

/// Failures talking to the session store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store call `{op}` timed out after {timeout_ms} ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("store worker failed: {0}")]
    Worker(String),

    #[error("corrupt {column} value in store: {value:?}")]
    Corrupt { column: &'static str, value: String },
}

pub type HandoffResult<T> = Result<T, HandoffError>;

const MAX_ID_LEN: usize = 128;

/// Validate a user or agent identity.
pub fn validate_participant(kind: &'static str, value: &str) -> HandoffResult<()> {
    let ok = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && !value.chars().any(|c| c.is_whitespace() || c.is_control());
    if ok {
        Ok(())
    } else {
        Err(HandoffError::InvalidIdentity {
            kind,
            value: value.to_string(),
        })
    }
}

/// Validate an agent identity; the system sentinel is reserved.
pub fn validate_agent_id(value: &str) -> HandoffResult<()> {
    validate_participant("agent", value)?;
    if value == relaydesk_protocol::SYSTEM_AGENT {
        return Err(HandoffError::InvalidIdentity {
            kind: "agent",
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Validate a session identity (UUID).
pub fn validate_session_id(value: &str) -> HandoffResult<()> {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| HandoffError::InvalidIdentity {
            kind: "session",
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_ids_reject_blank_and_whitespace() {
        assert!(validate_participant("user", "alice@example.com").is_ok());
        assert!(validate_participant("user", "").is_err());
        assert!(validate_participant("user", "two words").is_err());
        assert!(validate_participant("user", &"x".repeat(129)).is_err());
    }

    #[test]
    fn system_sentinel_is_not_an_agent() {
        let err = validate_agent_id("System").unwrap_err();
        assert_eq!(err.code(), "invalid_identity");
        assert!(validate_agent_id("agent-1").is_ok());
    }

    #[test]
    fn session_ids_must_be_uuids() {
        assert!(validate_session_id(&relaydesk_protocol::new_id()).is_ok());
        assert!(validate_session_id("65f0c0ffee").is_err());
    }
}
