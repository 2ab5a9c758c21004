//! Stale-session reaper
//!
//! Periodically deletes open sessions idle longer than the inactivity
//! window, releases the agents they held, and tells whoever is connected.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use relaydesk_protocol::{Session, SessionStatus};

use crate::error::HandoffResult;
use crate::handoff::Handoff;
use crate::store::{Changeset, Commit, SessionFilter};

pub struct Reaper {
    handoff: Handoff,
    interval: Duration,
    window: Duration,
}

impl Reaper {
    pub fn new(handoff: Handoff, interval: Duration, window: Duration) -> Self {
        Self {
            handoff,
            interval,
            window,
        }
    }

    /// Run forever (call from tokio::spawn). The first sweep happens one
    /// interval after start.
    pub async fn run(self) {
        info!(
            component = "reaper",
            event = "reaper.started",
            interval_secs = self.interval.as_secs(),
            window_secs = self.window.as_secs(),
            "Reaper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match reap_stale(&self.handoff, Utc::now(), self.window).await {
                Ok(reaped) if reaped.is_empty() => {
                    debug!(component = "reaper", event = "reaper.sweep.idle", "Nothing to reap");
                }
                Ok(reaped) => {
                    info!(
                        component = "reaper",
                        event = "reaper.sweep.reaped",
                        reaped = reaped.len(),
                        "Reaped stale sessions"
                    );
                }
                Err(e) => {
                    error!(
                        component = "reaper",
                        event = "reaper.sweep.failed",
                        error = %e,
                        "Reaper sweep failed"
                    );
                }
            }
        }
    }
}

/// Delete open sessions whose last activity is older than `now - window`.
/// Returns the sessions actually removed.
pub async fn reap_stale(
    handoff: &Handoff,
    now: DateTime<Utc>,
    window: Duration,
) -> HandoffResult<Vec<Session>> {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let stale = handoff
        .store()
        .find_sessions(SessionFilter {
            statuses: SessionStatus::OPEN.to_vec(),
            active_before: Some(cutoff),
            ..Default::default()
        })
        .await?;
    if stale.is_empty() {
        return Ok(stale);
    }

    let changes = Changeset {
        release_agents: stale
            .iter()
            .filter_map(|s| s.human_agent().map(str::to_string))
            .collect(),
        delete: stale.clone(),
        ..Default::default()
    };
    let skipped = match handoff.store().commit(changes).await? {
        Commit::Applied { skipped } => skipped,
        _ => Vec::new(),
    };

    let reaped: Vec<Session> = stale
        .into_iter()
        .filter(|s| !skipped.contains(&s.id))
        .collect();
    for session in &reaped {
        debug!(
            component = "reaper",
            event = "reaper.session.expired",
            session_id = %session.id,
            user_id = %session.user_id,
            last_activity = %session.last_activity,
            "Session expired"
        );
        handoff.announce_ended(session, "expired");
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Participant;
    use crate::test_support::{connect, drain, now_ms, session_for, test_handoff};
    use relaydesk_protocol::{AgentStatus, Assignee, Sender, ServerMessage};

    const WINDOW: Duration = Duration::from_secs(30 * 60);

    #[tokio::test]
    async fn stale_sessions_vanish_and_fresh_ones_stay() {
        let (handoff, registry) = test_handoff();
        let now = now_ms();
        let stale = session_for("u1", Assignee::System, now - chrono::Duration::minutes(31));
        let fresh = session_for("u2", Assignee::System, now - chrono::Duration::minutes(29));
        handoff.store().insert_session(stale.clone()).await.unwrap();
        handoff.store().insert_session(fresh.clone()).await.unwrap();
        handoff
            .store()
            .append_message(&stale.id, Sender::User, "anyone?", stale.last_activity)
            .await
            .unwrap();
        let mut user = connect(&registry, Participant::User("u1".into()));

        let reaped = reap_stale(&handoff, now, WINDOW).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, stale.id);

        assert!(handoff
            .store()
            .find_session(SessionFilter::by_id(&stale.id))
            .await
            .unwrap()
            .is_none());
        assert!(handoff.messages(&stale.id).await.unwrap().is_empty());
        assert!(handoff
            .store()
            .find_session(SessionFilter::by_id(&fresh.id))
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            drain(&mut user),
            vec![ServerMessage::ended(&stale.id, "expired")]
        );
    }

    #[tokio::test]
    async fn reaping_releases_the_agent() {
        let (handoff, _registry) = test_handoff();
        let now = now_ms();
        let stale = session_for(
            "u1",
            Assignee::Agent("a1".into()),
            now - chrono::Duration::hours(2),
        );
        handoff.store().insert_session(stale).await.unwrap();
        handoff
            .store()
            .set_agent_status("a1", AgentStatus::Busy)
            .await
            .unwrap();

        reap_stale(&handoff, now, WINDOW).await.unwrap();
        let agent = handoff.store().find_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn completed_sessions_are_left_alone() {
        let (handoff, _registry) = test_handoff();
        let now = now_ms();
        let mut done = session_for("u1", Assignee::System, now - chrono::Duration::hours(2));
        done.status = SessionStatus::Completed;
        handoff.store().insert_session(done.clone()).await.unwrap();

        assert!(reap_stale(&handoff, now, WINDOW).await.unwrap().is_empty());
        assert!(handoff.session_info(&done.id).await.is_ok());
    }
}
