//! Live connection registry: at most one socket per participant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use relaydesk_protocol::ServerMessage;

/// Buffered frames per connection before new frames are dropped
pub const OUTBOUND_BUFFER: usize = 100;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for a socket's send task
#[derive(Debug)]
pub enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
    /// Close the socket after flushing what is queued.
    Close(&'static str),
}

/// Who is on the other end of a socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Participant {
    User(String),
    Agent(String),
}

impl Participant {
    pub fn id(&self) -> &str {
        match self {
            Participant::User(id) | Participant::Agent(id) => id,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Participant::User(_) => "user",
            Participant::Agent(_) => "agent",
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role(), self.id())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub tx: mpsc::Sender<OutboundMessage>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }
}

/// Participant -> live socket. Handles are cloned out before any await.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Participant, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, returning the handle it replaced (if any).
    pub fn register(&self, participant: Participant, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let replaced = self.connections.insert(participant.clone(), handle);
        if let Some(old) = &replaced {
            debug!(
                component = "registry",
                event = "registry.connection.replaced",
                participant = %participant,
                old_connection_id = old.id,
                "Replacing existing connection"
            );
        }
        replaced
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    /// Returns true when this call removed it.
    pub fn remove(&self, participant: &Participant, connection_id: u64) -> bool {
        self.connections
            .remove_if(participant, |_, handle| handle.id == connection_id)
            .is_some()
    }

    pub fn lookup(&self, participant: &Participant) -> Option<ConnectionHandle> {
        self.connections.get(participant).map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub fn is_connected(&self, participant: &Participant) -> bool {
        self.connections.contains_key(participant)
    }

    /// Queue `message` for `participant` without waiting on its socket.
    /// Returns false if nobody is connected, the socket is gone, or its
    /// queue is full (the frame is dropped).
    pub fn send(&self, participant: &Participant, message: ServerMessage) -> bool {
        let Some(handle) = self.lookup(participant) else {
            return false;
        };
        offer(participant, &handle, OutboundMessage::Json(message))
    }

    /// Queue `message` for every connected agent. A stalled agent loses the
    /// frame; the others still get it.
    pub fn broadcast_agents(&self, message: ServerMessage) {
        let agents: Vec<(Participant, ConnectionHandle)> = self
            .connections
            .iter()
            .filter(|entry| matches!(entry.key(), Participant::Agent(_)))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (participant, handle) in agents {
            offer(&participant, &handle, OutboundMessage::Json(message.clone()));
        }
    }
}

/// Non-blocking enqueue. A full queue means the client stopped reading.
pub fn offer(participant: &Participant, handle: &ConnectionHandle, frame: OutboundMessage) -> bool {
    match handle.tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                component = "registry",
                event = "registry.outbound.full",
                participant = %participant,
                connection_id = handle.id,
                "Outbound queue full, frame dropped"
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn latest_registration_wins() {
        let registry = ConnectionRegistry::new();
        let user = Participant::User("u1".into());
        let (first, _first_rx) = handle();
        let (second, mut second_rx) = handle();
        let first_id = first.id;

        assert!(registry.register(user.clone(), first).is_none());
        let replaced = registry.register(user.clone(), second).unwrap();
        assert_eq!(replaced.id, first_id);

        assert!(registry.send(&user, ServerMessage::relay(relaydesk_protocol::Sender::Agent, "hi")));
        assert!(matches!(second_rx.recv().await, Some(OutboundMessage::Json(_))));
    }

    #[tokio::test]
    async fn stale_close_does_not_remove_newer_socket() {
        let registry = ConnectionRegistry::new();
        let agent = Participant::Agent("a1".into());
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let (first_id, second_id) = (first.id, second.id);

        registry.register(agent.clone(), first);
        registry.register(agent.clone(), second);

        assert!(!registry.remove(&agent, first_id));
        assert!(registry.is_connected(&agent));
        assert!(registry.remove(&agent, second_id));
        assert!(!registry.is_connected(&agent));
    }

    #[tokio::test]
    async fn send_to_absent_participant_reports_failure() {
        let registry = ConnectionRegistry::new();
        let sent = registry.send(
            &Participant::User("ghost".into()),
            ServerMessage::delivery_failed(None, "x"),
        );
        assert!(!sent);
    }

    #[tokio::test]
    async fn broadcast_reaches_agents_only() {
        let registry = ConnectionRegistry::new();
        let (agent, mut agent_rx) = handle();
        let (user, mut user_rx) = handle();
        registry.register(Participant::Agent("a1".into()), agent);
        registry.register(Participant::User("u1".into()), user);

        registry.broadcast_agents(ServerMessage::delivery_failed(None, "x"));
        assert!(agent_rx.try_recv().is_ok());
        assert!(user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_agent_does_not_block_broadcast() {
        let registry = ConnectionRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let slow = ConnectionHandle::new(slow_tx);
        slow.tx
            .try_send(OutboundMessage::Close("filler"))
            .unwrap();
        let (fast, mut fast_rx) = handle();
        registry.register(Participant::Agent("slow".into()), slow);
        registry.register(Participant::Agent("fast".into()), fast);

        registry.broadcast_agents(ServerMessage::delivery_failed(None, "x"));
        assert!(matches!(fast_rx.try_recv(), Ok(OutboundMessage::Json(_))));

        let sent = registry.send(
            &Participant::Agent("slow".into()),
            ServerMessage::delivery_failed(None, "y"),
        );
        assert!(!sent);
        assert!(registry.is_connected(&Participant::Agent("slow".into())));
    }
}
