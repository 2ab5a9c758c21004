//! Real-time routing: connect-time state sync, chat relay and the
//! system responder's turn.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use relaydesk_completion::Completer;
use relaydesk_protocol::{ClientMessage, Sender, ServerMessage, Session, SessionMode, SessionStatus};

use crate::error::{validate_session_id, HandoffError};
use crate::handoff::Handoff;
use crate::registry::Participant;
use crate::store::{SessionFilter, SessionPatch};

#[derive(Clone)]
pub struct ChatRouter {
    handoff: Handoff,
    completer: Arc<dyn Completer>,
}

impl ChatRouter {
    pub fn new(handoff: Handoff, completer: Arc<dyn Completer>) -> Self {
        Self { handoff, completer }
    }

    /// State sync for a freshly registered socket.
    pub async fn on_open(&self, participant: &Participant, session_id: Option<&str>) {
        match participant {
            Participant::User(user_id) => {
                if let Err(e) = self.handoff.dedupe_user(user_id).await {
                    warn!(
                        component = "routing",
                        event = "routing.open.dedupe_failed",
                        user_id = %user_id,
                        error = %e,
                        "Could not deduplicate user sessions"
                    );
                }
                let Some(session_id) = session_id else {
                    return;
                };
                match self.handoff.session_info(session_id).await {
                    Ok(session) => {
                        self.registry_send(participant, ServerMessage::snapshot(&session));
                    }
                    Err(e) => debug!(
                        component = "routing",
                        event = "routing.open.snapshot_skipped",
                        session_id = %session_id,
                        error = %e,
                        "No snapshot for requested session"
                    ),
                }
            }
            Participant::Agent(agent_id) => {
                let filter = SessionFilter {
                    assigned_agent: Some(agent_id.clone()),
                    mode: Some(SessionMode::Human),
                    statuses: vec![SessionStatus::Active],
                    ..Default::default()
                };
                let sessions = match self.handoff.store().find_sessions(filter).await {
                    Ok(sessions) => sessions,
                    Err(e) => {
                        warn!(
                            component = "routing",
                            event = "routing.open.lookup_failed",
                            agent_id = %agent_id,
                            error = %e,
                            "Could not load agent sessions"
                        );
                        return;
                    }
                };
                for session in &sessions {
                    self.registry_send(
                        &Participant::User(session.user_id.clone()),
                        ServerMessage::snapshot(session),
                    );
                }
                debug!(
                    component = "routing",
                    event = "routing.open.agent_synced",
                    agent_id = %agent_id,
                    sessions = sessions.len(),
                    "Re-announced agent to its users"
                );
            }
        }
    }

    /// Relay one inbound chat frame.
    pub async fn route(&self, origin: &Participant, frame: ClientMessage) {
        let session = match self.load_open(&frame.session_id).await {
            Ok(session) => session,
            Err(reason) => {
                warn!(
                    component = "routing",
                    event = "routing.chat.dropped",
                    origin = %origin,
                    session_id = %frame.session_id,
                    reason = reason,
                    "Chat frame dropped"
                );
                self.registry_send(
                    origin,
                    ServerMessage::delivery_failed(Some(frame.session_id), reason),
                );
                return;
            }
        };

        self.persist(&session, frame.sender, &frame.message).await;

        let user = Participant::User(session.user_id.clone());
        let relay = ServerMessage::relay(frame.sender, frame.message.clone());

        match (session.mode, frame.sender) {
            (SessionMode::System, Sender::User) => {
                self.registry_send(&user, relay);
                self.spawn_reply(session, frame.message);
            }
            (SessionMode::Human, Sender::User) => {
                if let Some(agent_id) = session.human_agent() {
                    let agent = Participant::Agent(agent_id.to_string());
                    if !self.handoff.registry().send(&agent, relay.clone()) {
                        debug!(
                            component = "routing",
                            event = "routing.chat.agent_offline",
                            session_id = %session.id,
                            agent_id = %agent_id,
                            "Assigned agent not connected"
                        );
                    }
                }
                self.registry_send(&user, relay);
            }
            (_, _) => {
                self.registry_send(&user, relay);
            }
        }
    }

    /// Drop the registry entry. An agent whose current socket closed gives
    /// its sessions back to the system responder.
    pub async fn on_close(&self, participant: &Participant, connection_id: u64) {
        let removed = self.handoff.registry().remove(participant, connection_id);
        if !removed {
            debug!(
                component = "routing",
                event = "routing.close.superseded",
                participant = %participant,
                connection_id = connection_id,
                "Closed socket was already replaced"
            );
            return;
        }

        if let Participant::Agent(agent_id) = participant {
            if let Err(e) = self.handoff.agent_disconnected(agent_id).await {
                warn!(
                    component = "routing",
                    event = "routing.close.recovery_failed",
                    agent_id = %agent_id,
                    error = %e,
                    "Could not return agent sessions to system"
                );
            }
        }
    }

    async fn load_open(&self, session_id: &str) -> Result<Session, &'static str> {
        if validate_session_id(session_id).is_err() {
            return Err("invalid_session");
        }
        match self
            .handoff
            .store()
            .find_session(SessionFilter::by_id(session_id))
            .await
        {
            Ok(Some(session)) if session.status.is_open() => Ok(session),
            Ok(Some(_)) => Err("session_completed"),
            Ok(None) => Err("session_not_found"),
            Err(_) => Err("store_unavailable"),
        }
    }

    /// Store the message and refresh activity. Failures are logged; the
    /// relay goes ahead regardless.
    async fn persist(&self, session: &Session, sender: Sender, text: &str) {
        let store = self.handoff.store();
        let now = Utc::now();
        if let Err(e) = store.append_message(&session.id, sender, text, now).await {
            warn!(
                component = "routing",
                event = "routing.chat.persist_failed",
                session_id = %session.id,
                error = %e,
                "Message not persisted"
            );
        }
        if let Err(e) = store
            .update_sessions(SessionFilter::by_id(&session.id), SessionPatch::touch(now))
            .await
        {
            warn!(
                component = "routing",
                event = "routing.chat.touch_failed",
                session_id = %session.id,
                error = %e,
                "Activity not refreshed"
            );
        }
    }

    /// Run the system responder off the connection task.
    fn spawn_reply(&self, session: Session, prompt: String) {
        let router = self.clone();
        tokio::spawn(async move {
            let user = Participant::User(session.user_id.clone());
            match router.completer.complete(&prompt).await {
                Ok(reply) => {
                    info!(
                        component = "routing",
                        event = "routing.ai.replied",
                        session_id = %session.id,
                        provider = router.completer.name(),
                        reply_chars = reply.chars().count(),
                        "System reply ready"
                    );
                    router.persist(&session, Sender::System, &reply).await;
                    router.registry_send(&user, ServerMessage::relay(Sender::System, reply));
                }
                Err(e) => {
                    let e = HandoffError::from(e);
                    warn!(
                        component = "routing",
                        event = "routing.ai.failed",
                        session_id = %session.id,
                        provider = router.completer.name(),
                        error = %e,
                        "System reply failed"
                    );
                    router.registry_send(
                        &user,
                        ServerMessage::delivery_failed(Some(session.id.clone()), "ai_unavailable"),
                    );
                }
            }
        });
    }

    fn registry_send(&self, participant: &Participant, frame: ServerMessage) {
        if !self.handoff.registry().send(participant, frame) {
            debug!(
                component = "routing",
                event = "routing.send.undelivered",
                participant = %participant,
                "Participant not connected"
            );
        }
    }
}
