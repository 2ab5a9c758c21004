//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::Sender;

/// A chat frame sent by a user or agent socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    pub session_id: String,
    pub sender: Sender,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_chat_frame() {
        let raw = r#"{"sessionId":"abc","sender":"user","message":"hello"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.session_id, "abc");
        assert_eq!(msg.sender, Sender::User);
        assert_eq!(msg.message, "hello");
    }

    #[test]
    fn rejects_frame_without_session() {
        let raw = r#"{"sender":"agent","message":"hi"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }
}
