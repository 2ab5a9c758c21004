//! Pure ownership state machine
//!
//! `transition(session, input, now) -> (session, effects)` decides how a
//! session's owner and status change and what must be announced. No IO:
//! the handoff service persists the result with a guarded write and then
//! performs the effects.

use chrono::{DateTime, Utc};
use serde::Serialize;

use relaydesk_protocol::{Assignee, ServerMessage, Session, SessionMode, SessionStatus};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Which API moved the session to a human
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffAction {
    Takeover,
    Assign,
    Transfer,
}

impl HandoffAction {
    pub fn as_str(self) -> &'static str {
        match self {
            HandoffAction::Takeover => "takeover",
            HandoffAction::Assign => "assign",
            HandoffAction::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Input {
    /// The user asked to start while this session was still open.
    Resume { agent_reachable: bool },
    /// A human agent takes the session.
    Claim {
        agent_id: String,
        action: HandoffAction,
    },
    /// The owning agent's socket went away.
    AgentLost,
    /// Mark completed.
    End { reason: String },
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Push a frame to the session's user.
    NotifyUser(ServerMessage),
    /// Replay the stored history to the new owner.
    ReplayHistory { agent_id: String },
    /// Push a frame to every connected agent.
    Dashboard(ServerMessage),
    /// Set the agent available unless it still holds another open session.
    ReleaseAgent(String),
}

/// Why an input does not apply to the session as read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Completed,
    NotActive,
    NotSystemOwned,
    NotHumanOwned,
}

/// Reported by `start` for an existing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    New,
    Continued,
    ContinuedSystem,
    TransferredToSystem,
}

/// The label `start` reports when resuming `session`.
pub fn resume_status(session: &Session, agent_reachable: bool) -> StartStatus {
    match session.mode {
        SessionMode::System => StartStatus::ContinuedSystem,
        SessionMode::Human if agent_reachable => StartStatus::Continued,
        SessionMode::Human => StartStatus::TransferredToSystem,
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: Session,
    input: Input,
    now: DateTime<Utc>,
) -> Result<(Session, Vec<Effect>), Rejection> {
    let mut effects = Vec::new();

    match input {
        Input::Resume { agent_reachable } => {
            if !state.status.is_open() {
                return Err(Rejection::Completed);
            }
            let previous = state.human_agent().map(str::to_string);
            state.status = SessionStatus::Active;
            state.last_activity = now;

            if let (Some(agent_id), false) = (previous, agent_reachable) {
                assign(&mut state, Assignee::System);
                effects.push(Effect::NotifyUser(ServerMessage::snapshot(&state)));
                effects.push(Effect::Dashboard(updated(&state, "returned_to_system")));
                effects.push(Effect::ReleaseAgent(agent_id));
            }
        }

        Input::Claim { agent_id, action } => {
            if !state.status.is_open() {
                return Err(Rejection::Completed);
            }
            if action == HandoffAction::Takeover
                && (state.mode != SessionMode::System || state.status != SessionStatus::Active)
            {
                return Err(Rejection::NotSystemOwned);
            }
            if state.status != SessionStatus::Active {
                return Err(Rejection::NotActive);
            }

            let previous = state.human_agent().map(str::to_string);
            assign(&mut state, Assignee::Agent(agent_id.clone()));
            state.status = SessionStatus::Active;
            state.last_activity = now;

            effects.push(Effect::NotifyUser(ServerMessage::snapshot(&state)));
            effects.push(Effect::ReplayHistory {
                agent_id: agent_id.clone(),
            });
            effects.push(Effect::Dashboard(updated(&state, action.as_str())));
            if let Some(previous) = previous.filter(|p| *p != agent_id) {
                effects.push(Effect::ReleaseAgent(previous));
            }
        }

        Input::AgentLost => {
            if !state.status.is_open() {
                return Err(Rejection::Completed);
            }
            if state.mode != SessionMode::Human {
                return Err(Rejection::NotHumanOwned);
            }
            assign(&mut state, Assignee::System);
            state.status = SessionStatus::Active;
            state.last_activity = now;

            effects.push(Effect::NotifyUser(ServerMessage::snapshot(&state)));
            effects.push(Effect::Dashboard(updated(&state, "agent_disconnected")));
        }

        Input::End { reason } => {
            state.last_activity = now;
            // ending twice only refreshes activity
            if state.status.is_open() {
                let previous = state.human_agent().map(str::to_string);
                state.status = SessionStatus::Completed;

                effects.push(Effect::NotifyUser(ServerMessage::ended(&state.id, reason.clone())));
                effects.push(Effect::Dashboard(ServerMessage::ended(&state.id, reason)));
                if let Some(previous) = previous {
                    effects.push(Effect::ReleaseAgent(previous));
                }
            }
        }
    }

    debug_assert!(state.is_consistent());
    Ok((state, effects))
}

/// Owner and mode always change together.
fn assign(state: &mut Session, owner: Assignee) {
    state.mode = owner.mode();
    state.assigned_agent = owner;
}

fn updated(state: &Session, action: &str) -> ServerMessage {
    ServerMessage::SessionUpdated {
        session: state.clone(),
        action: action.to_string(),
    }
}

/// Agents the committed write must release.
pub fn released_agents(effects: &[Effect]) -> Vec<String> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::ReleaseAgent(agent_id) => Some(agent_id.clone()),
            _ => None,
        })
        .collect()
}
