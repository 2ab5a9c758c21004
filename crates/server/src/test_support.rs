//! Fixtures shared by the async tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use relaydesk_completion::{Completer, CompletionError};
use relaydesk_protocol::{new_id, Assignee, ServerMessage, Session, SessionStatus};

use crate::handoff::Handoff;
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundMessage, Participant, OUTBOUND_BUFFER};
use crate::store::Store;

pub(crate) fn test_store() -> Store {
    Store::open_in_memory(Duration::from_secs(5)).expect("in-memory store")
}

pub(crate) fn test_handoff() -> (Handoff, Arc<ConnectionRegistry>) {
    let registry = Arc::new(ConnectionRegistry::new());
    (Handoff::new(test_store(), Arc::clone(&registry)), registry)
}

/// Millisecond-truncated now, so values survive a store round trip unchanged.
pub(crate) fn now_ms() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub(crate) fn session_for(user_id: &str, assignee: Assignee, at: DateTime<Utc>) -> Session {
    Session {
        id: new_id(),
        user_id: user_id.to_string(),
        mode: assignee.mode(),
        assigned_agent: assignee,
        status: SessionStatus::Active,
        created_at: at,
        last_activity: at,
    }
}

/// Register a fake socket and return its outbound queue.
pub(crate) fn connect(
    registry: &ConnectionRegistry,
    participant: Participant,
) -> mpsc::Receiver<OutboundMessage> {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    registry.register(participant, ConnectionHandle::new(tx));
    rx
}

/// Everything queued so far, JSON frames only.
pub(crate) fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let OutboundMessage::Json(frame) = message {
            frames.push(frame);
        }
    }
    frames
}

/// Wait for the next JSON frame (AI replies arrive from a spawned task).
pub(crate) async fn next_frame(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        if let OutboundMessage::Json(frame) = message {
            return frame;
        }
    }
}

/// Completer that plays back queued results, then fails.
#[derive(Default)]
pub(crate) struct ScriptedCompleter {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedCompleter {
    pub(crate) fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::EmptyReply))
    }
}
