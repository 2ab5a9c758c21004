//! Handoff service - executes the session state machine.
//!
//! Each operation reads the session, asks [`transition`] what should
//! change, persists it as one guarded [`Changeset`], and only then
//! performs the resulting effects (snapshots, history replay, dashboard
//! events). A guard that no longer matches means another writer got
//! there first; the read is retried a bounded number of times.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use relaydesk_protocol::{
    new_id, AgentStatus, Assignee, ChatMessage, ServerMessage, Session, SessionMode, SessionStatus,
    UserInfo,
};

use crate::error::{
    validate_agent_id, validate_participant, validate_session_id, HandoffError, HandoffResult,
};
use crate::registry::{ConnectionRegistry, Participant};
use crate::store::{Changeset, Commit, SessionFilter, Store};
use crate::transition::{
    released_agents, resume_status, transition, Effect, HandoffAction, Input, Rejection,
    StartStatus,
};

/// Re-reads allowed when a guarded write loses a race
const MAX_ATTEMPTS: usize = 3;

/// Window for a user's history when no status filter is given
const HISTORY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session: Session,
    pub start_status: StartStatus,
}

/// Result of takeover / assign / transfer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffOutcome {
    pub session: Session,
    pub messages: Vec<ChatMessage>,
    pub user_info: Option<UserInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub last_message: Option<ChatMessage>,
}

#[derive(Clone)]
pub struct Handoff {
    store: Store,
    registry: Arc<ConnectionRegistry>,
}

impl Handoff {
    pub fn new(store: Store, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // -- state machine ----------------------------------------------------

    /// Resume the user's open session, or open a new one.
    pub async fn start(&self, user_id: &str, agent_id: Option<&str>) -> HandoffResult<StartOutcome> {
        validate_participant("user", user_id)?;
        if let Some(agent_id) = agent_id {
            validate_agent_id(agent_id)?;
        }

        self.dedupe_user(user_id).await?;

        for _ in 0..MAX_ATTEMPTS {
            let existing = self
                .store
                .find_sessions(SessionFilter::open_for_user(user_id))
                .await?
                .into_iter()
                .next();

            let Some(before) = existing else {
                return self.create(user_id, agent_id).await;
            };

            let agent_reachable = self.agent_reachable(&before).await?;
            let start_status = resume_status(&before, agent_reachable);
            let (after, effects) =
                transition(before.clone(), Input::Resume { agent_reachable }, Utc::now())
                    .map_err(|rejection| rejected(&before.id, rejection))?;

            match self.commit(&before, &after, None, &effects).await? {
                Commit::Applied { .. } => {
                    info!(
                        component = "handoff",
                        event = "handoff.session.resumed",
                        session_id = %after.id,
                        user_id = %user_id,
                        start_status = ?start_status,
                        "Resumed open session"
                    );
                    self.perform(&after, effects).await?;
                    return Ok(StartOutcome {
                        session: after,
                        start_status,
                    });
                }
                _ => continue,
            }
        }

        Err(contended(user_id))
    }

    async fn create(&self, user_id: &str, agent_id: Option<&str>) -> HandoffResult<StartOutcome> {
        let now = Utc::now();
        let mut session = Session {
            id: new_id(),
            user_id: user_id.to_string(),
            assigned_agent: Assignee::System,
            mode: Assignee::System.mode(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        };
        self.store.insert_session(session.clone()).await?;

        if let Some(agent_id) = agent_id {
            let mut human = session.clone();
            human.assigned_agent = Assignee::Agent(agent_id.to_string());
            human.mode = human.assigned_agent.mode();

            let changes = Changeset {
                claim_agent: Some(agent_id.to_string()),
                replace: vec![(session.clone(), human.clone())],
                strict: true,
                ..Default::default()
            };
            match self.store.commit(changes).await? {
                Commit::Applied { .. } => session = human,
                other => debug!(
                    component = "handoff",
                    event = "handoff.start.agent_unavailable",
                    agent_id = %agent_id,
                    outcome = ?other,
                    "Requested agent not free, starting in system mode"
                ),
            }
        }

        info!(
            component = "handoff",
            event = "handoff.session.created",
            session_id = %session.id,
            user_id = %user_id,
            mode = session.mode.as_str(),
            "Session created"
        );
        self.registry.broadcast_agents(ServerMessage::SessionCreated {
            session: session.clone(),
        });

        Ok(StartOutcome {
            session,
            start_status: StartStatus::New,
        })
    }

    /// Claim a system-owned active session (the given one, or the oldest).
    pub async fn takeover(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> HandoffResult<HandoffOutcome> {
        validate_agent_id(agent_id)?;
        if let Some(session_id) = session_id {
            validate_session_id(session_id)?;
        }
        self.require_available(agent_id).await?;

        for _ in 0..MAX_ATTEMPTS {
            let filter = SessionFilter {
                id: session_id.map(str::to_string),
                ..SessionFilter::system_owned()
            };
            let before = self.store.find_session(filter).await?.ok_or_else(|| {
                HandoffError::NotFound(match session_id {
                    Some(id) => format!("system session {id}"),
                    None => "system session".to_string(),
                })
            })?;

            if let Some(outcome) = self.claim(before, agent_id, HandoffAction::Takeover).await? {
                return Ok(outcome);
            }
        }

        Err(contended(agent_id))
    }

    /// Hand an active session (any mode) to `agent_id`.
    pub async fn assign(&self, agent_id: &str, session_id: &str) -> HandoffResult<HandoffOutcome> {
        self.claim_by_id(agent_id, session_id, HandoffAction::Assign)
            .await
    }

    /// Escalate an active session to another agent.
    pub async fn transfer(&self, session_id: &str, agent_id: &str) -> HandoffResult<HandoffOutcome> {
        self.claim_by_id(agent_id, session_id, HandoffAction::Transfer)
            .await
    }

    async fn claim_by_id(
        &self,
        agent_id: &str,
        session_id: &str,
        action: HandoffAction,
    ) -> HandoffResult<HandoffOutcome> {
        validate_agent_id(agent_id)?;
        validate_session_id(session_id)?;
        self.require_available(agent_id).await?;

        for _ in 0..MAX_ATTEMPTS {
            let before = self.load(session_id).await?;
            if let Some(outcome) = self.claim(before, agent_id, action).await? {
                return Ok(outcome);
            }
        }

        Err(contended(session_id))
    }

    /// One claim attempt. `Ok(None)` means the session changed under us.
    async fn claim(
        &self,
        before: Session,
        agent_id: &str,
        action: HandoffAction,
    ) -> HandoffResult<Option<HandoffOutcome>> {
        let input = Input::Claim {
            agent_id: agent_id.to_string(),
            action,
        };
        let (after, effects) = transition(before.clone(), input, Utc::now())
            .map_err(|rejection| rejected(&before.id, rejection))?;

        match self
            .commit(&before, &after, Some(agent_id), &effects)
            .await?
        {
            Commit::Applied { .. } => {}
            Commit::AgentUnavailable => {
                return Err(HandoffError::AgentUnavailable(agent_id.to_string()))
            }
            Commit::Stale(session_id) => {
                debug!(
                    component = "handoff",
                    event = "handoff.claim.stale",
                    session_id = %session_id,
                    agent_id = %agent_id,
                    "Session changed before claim, re-reading"
                );
                return Ok(None);
            }
        }

        info!(
            component = "handoff",
            event = "handoff.session.claimed",
            session_id = %after.id,
            agent_id = %agent_id,
            action = action.as_str(),
            previous_owner = %before.assigned_agent.as_str(),
            "Session handed to agent"
        );

        let messages = self.perform(&after, effects).await?.unwrap_or_default();
        let user_info = self.store.find_user(&after.user_id).await?;

        Ok(Some(HandoffOutcome {
            session: after,
            messages,
            user_info,
        }))
    }

    /// Complete a session. Ending an ended session only refreshes activity.
    pub async fn end(&self, session_id: &str) -> HandoffResult<Session> {
        validate_session_id(session_id)?;

        for _ in 0..MAX_ATTEMPTS {
            let before = self.load(session_id).await?;
            let input = Input::End {
                reason: "ended".to_string(),
            };
            let (after, effects) = transition(before.clone(), input, Utc::now())
                .map_err(|rejection| rejected(&before.id, rejection))?;

            if let Commit::Applied { .. } = self.commit(&before, &after, None, &effects).await? {
                if before.status.is_open() {
                    info!(
                        component = "handoff",
                        event = "handoff.session.ended",
                        session_id = %after.id,
                        "Session ended"
                    );
                }
                self.perform(&after, effects).await?;
                return Ok(after);
            }
        }

        Err(contended(session_id))
    }

    /// Collapse a user's open sessions to the most recently active one.
    pub async fn dedupe_user(&self, user_id: &str) -> HandoffResult<Option<Session>> {
        validate_participant("user", user_id)?;

        let mut open = self
            .store
            .find_sessions(SessionFilter::open_for_user(user_id))
            .await?
            .into_iter();
        let keep = open.next();
        let extra: Vec<Session> = open.collect();
        if extra.is_empty() {
            return Ok(keep);
        }

        let changes = Changeset {
            release_agents: extra
                .iter()
                .filter_map(|s| s.human_agent().map(str::to_string))
                .collect(),
            delete: extra.clone(),
            ..Default::default()
        };
        let Commit::Applied { skipped } = self.store.commit(changes).await? else {
            return Ok(keep);
        };

        let removed: Vec<&Session> = extra.iter().filter(|s| !skipped.contains(&s.id)).collect();
        info!(
            component = "handoff",
            event = "handoff.user.deduplicated",
            user_id = %user_id,
            removed = removed.len(),
            kept = ?keep.as_ref().map(|s| s.id.as_str()),
            "Removed duplicate open sessions"
        );
        for session in removed {
            self.registry
                .broadcast_agents(ServerMessage::ended(&session.id, "deduplicated"));
        }

        Ok(keep)
    }

    /// Return every session held by a departed agent to the system responder.
    pub async fn agent_disconnected(&self, agent_id: &str) -> HandoffResult<Vec<Session>> {
        let now = Utc::now();
        let held = self
            .store
            .find_sessions(SessionFilter::held_by_agent(agent_id))
            .await?;

        let mut planned = Vec::with_capacity(held.len());
        for before in held {
            match transition(before.clone(), Input::AgentLost, now) {
                Ok((after, effects)) => planned.push((before, after, effects)),
                Err(rejection) => debug!(
                    component = "handoff",
                    event = "handoff.agent_lost.skipped",
                    session_id = %before.id,
                    rejection = ?rejection,
                    "Session no longer held"
                ),
            }
        }

        let changes = Changeset {
            replace: planned
                .iter()
                .map(|(before, after, _)| (before.clone(), after.clone()))
                .collect(),
            free_agents: vec![agent_id.to_string()],
            ..Default::default()
        };
        let skipped = match self.store.commit(changes).await? {
            Commit::Applied { skipped } => skipped,
            _ => Vec::new(),
        };

        let mut demoted = Vec::new();
        for (_, after, effects) in planned {
            if skipped.contains(&after.id) {
                continue;
            }
            self.perform(&after, effects).await?;
            demoted.push(after);
        }

        info!(
            component = "handoff",
            event = "handoff.agent.disconnected",
            agent_id = %agent_id,
            demoted = demoted.len(),
            "Agent sessions returned to system"
        );
        Ok(demoted)
    }

    // -- reads ------------------------------------------------------------

    pub async fn session_info(&self, session_id: &str) -> HandoffResult<Session> {
        validate_session_id(session_id)?;
        self.load(session_id).await
    }

    pub async fn messages(&self, session_id: &str) -> HandoffResult<Vec<ChatMessage>> {
        validate_session_id(session_id)?;
        Ok(self.store.messages(session_id).await?)
    }

    pub async fn user_active_session(&self, user_id: &str) -> HandoffResult<Option<Session>> {
        validate_participant("user", user_id)?;
        Ok(self
            .store
            .find_sessions(SessionFilter::open_for_user(user_id))
            .await?
            .into_iter()
            .next())
    }

    /// A user's sessions, newest activity first. Without a status filter
    /// only the last 30 days are returned.
    pub async fn user_sessions(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
    ) -> HandoffResult<Vec<SessionSummary>> {
        validate_participant("user", user_id)?;
        let filter = SessionFilter {
            user_id: Some(user_id.to_string()),
            statuses: status.into_iter().collect(),
            active_since: match status {
                Some(_) => None,
                None => Some(Utc::now() - ChronoDuration::days(HISTORY_WINDOW_DAYS)),
            },
            ..Default::default()
        };

        let sessions = self.store.find_sessions(filter).await?;
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let last_message = self.store.last_message(&session.id).await?;
            summaries.push(SessionSummary {
                session,
                last_message,
            });
        }
        Ok(summaries)
    }

    /// The agent's own open sessions plus every system-owned active one.
    pub async fn active_sessions_for_agent(&self, agent_id: &str) -> HandoffResult<Vec<Session>> {
        validate_agent_id(agent_id)?;
        let mut sessions = self
            .store
            .find_sessions(SessionFilter::held_by_agent(agent_id))
            .await?;
        sessions.extend(self.store.find_sessions(SessionFilter::system_owned()).await?);
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Every session the agent has held in human mode, any status, newest activity first.
    pub async fn agent_sessions(&self, agent_id: &str) -> HandoffResult<Vec<Session>> {
        validate_agent_id(agent_id)?;
        let filter = SessionFilter {
            assigned_agent: Some(agent_id.to_string()),
            mode: Some(SessionMode::Human),
            ..Default::default()
        };
        Ok(self.store.find_sessions(filter).await?)
    }

    pub async fn system_sessions(&self) -> HandoffResult<Vec<Session>> {
        Ok(self
            .store
            .find_sessions(SessionFilter::system_owned())
            .await?)
    }

    pub async fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> HandoffResult<()> {
        validate_agent_id(agent_id)?;
        self.store.set_agent_status(agent_id, status).await?;
        info!(
            component = "handoff",
            event = "handoff.agent.status",
            agent_id = %agent_id,
            status = status.as_str(),
            "Agent status updated"
        );
        Ok(())
    }

    // -- helpers ----------------------------------------------------------

    async fn load(&self, session_id: &str) -> HandoffResult<Session> {
        self.store
            .find_session(SessionFilter::by_id(session_id))
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("session {session_id}")))
    }

    async fn require_available(&self, agent_id: &str) -> HandoffResult<()> {
        match self.store.find_agent(agent_id).await? {
            Some(agent) if agent.status == AgentStatus::Available => Ok(()),
            _ => Err(HandoffError::AgentUnavailable(agent_id.to_string())),
        }
    }

    /// A human owner still counts while its agent record says busy.
    async fn agent_reachable(&self, session: &Session) -> HandoffResult<bool> {
        let Some(agent_id) = session.human_agent() else {
            return Ok(false);
        };
        Ok(self
            .store
            .find_agent(agent_id)
            .await?
            .is_some_and(|agent| agent.status == AgentStatus::Busy))
    }

    async fn commit(
        &self,
        before: &Session,
        after: &Session,
        claim_agent: Option<&str>,
        effects: &[Effect],
    ) -> HandoffResult<Commit> {
        let changes = Changeset {
            claim_agent: claim_agent.map(str::to_string),
            replace: vec![(before.clone(), after.clone())],
            release_agents: released_agents(effects),
            strict: true,
            ..Default::default()
        };
        Ok(self.store.commit(changes).await?)
    }

    /// Deliver effects for a committed `session`. Returns the replayed
    /// history when one was requested.
    pub(crate) async fn perform(
        &self,
        session: &Session,
        effects: Vec<Effect>,
    ) -> HandoffResult<Option<Vec<ChatMessage>>> {
        let user = Participant::User(session.user_id.clone());
        let mut replayed = None;

        for effect in effects {
            match effect {
                Effect::NotifyUser(frame) => {
                    self.registry.send(&user, frame);
                }
                Effect::ReplayHistory { agent_id } => {
                    let history = self.store.messages(&session.id).await?;
                    let agent = Participant::Agent(agent_id);
                    for message in &history {
                        if !self.registry.send(&agent, ServerMessage::history(message)) {
                            warn!(
                                component = "handoff",
                                event = "handoff.replay.undelivered",
                                session_id = %session.id,
                                agent = %agent,
                                "Agent not connected for history replay"
                            );
                            break;
                        }
                    }
                    replayed = Some(history);
                }
                Effect::Dashboard(frame) => self.registry.broadcast_agents(frame),
                // applied inside the commit
                Effect::ReleaseAgent(_) => {}
            }
        }

        Ok(replayed)
    }

    /// Tell the user and dashboards a session is gone.
    pub(crate) fn announce_ended(&self, session: &Session, reason: &str) {
        let frame = ServerMessage::ended(&session.id, reason);
        self.registry.send(&Participant::User(session.user_id.clone()), frame.clone());
        self.registry.broadcast_agents(frame);
    }
}

fn rejected(session_id: &str, rejection: Rejection) -> HandoffError {
    let what = match rejection {
        Rejection::Completed => "open session",
        Rejection::NotActive => "active session",
        Rejection::NotSystemOwned => "system session",
        Rejection::NotHumanOwned => "agent-held session",
    };
    HandoffError::NotFound(format!("{what} {session_id}"))
}

fn contended(key: &str) -> HandoffError {
    warn!(
        component = "handoff",
        event = "handoff.write.contended",
        key = %key,
        attempts = MAX_ATTEMPTS,
        "Guarded write kept losing races"
    );
    HandoffError::Contended(format!("session for {key}"))
}
