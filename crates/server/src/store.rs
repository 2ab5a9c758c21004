//! Session store adapter - SQLite-backed collections for sessions,
//! messages, agents and (read-only) users.
//!
//! Every call runs on `spawn_blocking`; the configured store timeout
//! bounds the wait for the connection. Writes that must not race are expressed as filtered
//! updates inside one IMMEDIATE transaction (see [`Changeset`]).

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use relaydesk_protocol::{
    Agent, AgentStatus, Assignee, ChatMessage, Sender, Session, SessionMode, SessionStatus,
    UserInfo,
};

use crate::error::StoreError;
use crate::migration_runner::run_migrations;

const CALL_PENDING: u8 = 0;
const CALL_RUNNING: u8 = 1;
const CALL_ABANDONED: u8 = 2;

const SESSION_COLUMNS: &str =
    "id, user_id, assigned_agent, mode, status, created_at, last_activity";

/// Filter over the sessions collection. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub assigned_agent: Option<String>,
    pub mode: Option<SessionMode>,
    /// Empty means any status
    pub statuses: Vec<SessionStatus>,
    pub active_before: Option<DateTime<Utc>>,
    pub active_since: Option<DateTime<Utc>>,
}

impl SessionFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// Non-completed sessions for a user
    pub fn open_for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            statuses: SessionStatus::OPEN.to_vec(),
            ..Default::default()
        }
    }

    /// Non-completed sessions a human agent is answering
    pub fn held_by_agent(agent_id: &str) -> Self {
        Self {
            assigned_agent: Some(agent_id.to_string()),
            mode: Some(SessionMode::Human),
            statuses: SessionStatus::OPEN.to_vec(),
            ..Default::default()
        }
    }

    /// Active sessions the AI responder owns
    pub fn system_owned() -> Self {
        Self {
            mode: Some(SessionMode::System),
            statuses: vec![SessionStatus::Active],
            ..Default::default()
        }
    }

    /// Matches `session` only while none of its ownership fields changed.
    pub fn exact(session: &Session) -> Self {
        Self {
            id: Some(session.id.clone()),
            assigned_agent: Some(session.assigned_agent.as_str().to_string()),
            mode: Some(session.mode),
            statuses: vec![session.status],
            ..Default::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(id) = &self.id {
            clauses.push("id = ?".into());
            values.push(Value::Text(id.clone()));
        }
        if let Some(user_id) = &self.user_id {
            clauses.push("user_id = ?".into());
            values.push(Value::Text(user_id.clone()));
        }
        if let Some(agent) = &self.assigned_agent {
            clauses.push("assigned_agent = ?".into());
            values.push(Value::Text(agent.clone()));
        }
        if let Some(mode) = self.mode {
            clauses.push("mode = ?".into());
            values.push(Value::Text(mode.as_str().into()));
        }
        if !self.statuses.is_empty() {
            let marks = vec!["?"; self.statuses.len()].join(", ");
            clauses.push(format!("status IN ({marks})"));
            values.extend(
                self.statuses
                    .iter()
                    .map(|s| Value::Text(s.as_str().into())),
            );
        }
        if let Some(before) = self.active_before {
            clauses.push("last_activity < ?".into());
            values.push(Value::Integer(before.timestamp_millis()));
        }
        if let Some(since) = self.active_since {
            clauses.push("last_activity >= ?".into());
            values.push(Value::Integer(since.timestamp_millis()));
        }

        if clauses.is_empty() {
            ("1 = 1".into(), values)
        } else {
            (clauses.join(" AND "), values)
        }
    }
}

/// Fields to `$set` on matching sessions. Owner and mode move together.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub assignee: Option<Assignee>,
    pub status: Option<SessionStatus>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: Some(now),
            ..Default::default()
        }
    }

    /// Patch that turns any session into `session`'s mutable state.
    pub fn replace_with(session: &Session) -> Self {
        Self {
            assignee: Some(session.assigned_agent.clone()),
            status: Some(session.status),
            last_activity: Some(session.last_activity),
        }
    }

    fn set_clause(&self) -> Option<(String, Vec<Value>)> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(assignee) = &self.assignee {
            sets.push("assigned_agent = ?");
            values.push(Value::Text(assignee.as_str().to_string()));
            sets.push("mode = ?");
            values.push(Value::Text(assignee.mode().as_str().into()));
        }
        if let Some(status) = self.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().into()));
        }
        if let Some(ts) = self.last_activity {
            // activity never moves backwards
            sets.push("last_activity = MAX(last_activity, ?)");
            values.push(Value::Integer(ts.timestamp_millis()));
        }

        if sets.is_empty() {
            None
        } else {
            Some((sets.join(", "), values))
        }
    }
}

/// A group of writes applied atomically.
///
/// Order inside the transaction: agent claim, session replacements,
/// session deletions, unconditional agent frees, conditional releases.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// Agent that must flip `available -> busy`, or the whole set aborts.
    pub claim_agent: Option<String>,
    /// `(expected, replacement)` pairs applied only while `expected` still matches.
    pub replace: Vec<(Session, Session)>,
    /// Sessions removed (with their messages) only if unchanged since read.
    pub delete: Vec<Session>,
    /// Agents set `available` no matter what they hold.
    pub free_agents: Vec<String>,
    /// Agents set `available` only if they hold no other open human session.
    pub release_agents: Vec<String>,
    /// Abort everything if any replacement or deletion no longer matches.
    pub strict: bool,
}

/// Result of applying a [`Changeset`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    /// Written. `skipped` lists session ids that had changed underneath (lenient sets only).
    Applied { skipped: Vec<String> },
    /// The claimed agent was not `available` at write time.
    AgentUnavailable,
    /// A strict set found this session changed; nothing was written.
    Stale(String),
}

/// SQLite-backed store (cheap to clone)
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&mut conn)?;
        Ok(Self::from_connection(conn, timeout))
    }

    #[cfg(test)]
    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self::from_connection(conn, timeout))
    }

    fn from_connection(conn: Connection, timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        }
    }

    /// Run `f` against the connection on a blocking thread.
    ///
    /// The timeout bounds the wait for the connection. A call that times out
    /// never runs `f`; one that already started is awaited to completion, so
    /// a `Timeout` error always means nothing was written.
    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let timeout_ms = self.timeout.as_millis() as u64;
        let claim = Arc::new(AtomicU8::new(CALL_PENDING));
        let worker_claim = Arc::clone(&claim);
        let conn = Arc::clone(&self.conn);
        let mut task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Worker("connection lock poisoned".into()))?;
            if worker_claim
                .compare_exchange(CALL_PENDING, CALL_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(StoreError::Timeout { op, timeout_ms });
            }
            f(&mut guard)
        });

        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let abandoned = claim
                    .compare_exchange(CALL_PENDING, CALL_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if abandoned {
                    warn!(
                        component = "store",
                        event = "store.call.timeout",
                        op = op,
                        timeout_ms = timeout_ms,
                        "Store call timed out"
                    );
                    return Err(StoreError::Timeout { op, timeout_ms });
                }
                debug!(
                    component = "store",
                    event = "store.call.slow",
                    op = op,
                    timeout_ms = timeout_ms,
                    "Store call passed its timeout mid-flight, awaiting result"
                );
                task.await
            }
        };

        joined.map_err(|join_err| StoreError::Worker(join_err.to_string()))?
    }

    // -- sessions ---------------------------------------------------------

    pub async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        self.call("insert_session", move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, assigned_agent, mode, status, created_at, last_activity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.user_id,
                    session.assigned_agent.as_str(),
                    session.mode.as_str(),
                    session.status.as_str(),
                    session.created_at.timestamp_millis(),
                    session.last_activity.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// First match in creation order.
    pub async fn find_session(&self, filter: SessionFilter) -> Result<Option<Session>, StoreError> {
        self.call("find_session", move |conn| {
            let (clause, values) = filter.where_clause();
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE {clause}
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            );
            let row = conn
                .query_row(&sql, params_from_iter(values), read_session_row)
                .optional()?;
            row.map(SessionRow::into_session).transpose()
        })
        .await
    }

    /// All matches, most recently active first.
    pub async fn find_sessions(&self, filter: SessionFilter) -> Result<Vec<Session>, StoreError> {
        self.call("find_sessions", move |conn| select_sessions(conn, &filter))
            .await
    }

    /// `$set` `patch` on every match. Returns the number of sessions changed.
    pub async fn update_sessions(
        &self,
        filter: SessionFilter,
        patch: SessionPatch,
    ) -> Result<usize, StoreError> {
        self.call("update_sessions", move |conn| {
            Ok(update_where(conn, &filter, &patch)?)
        })
        .await
    }

    /// Apply a [`Changeset`] in one IMMEDIATE transaction.
    pub async fn commit(&self, changes: Changeset) -> Result<Commit, StoreError> {
        self.call("commit", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(agent_id) = &changes.claim_agent {
                let claimed = tx.execute(
                    "UPDATE agents SET status = 'busy' WHERE id = ?1 AND status = 'available'",
                    params![agent_id],
                )?;
                if claimed == 0 {
                    return Ok(Commit::AgentUnavailable);
                }
            }

            let mut skipped = Vec::new();

            for (expected, replacement) in &changes.replace {
                let changed = update_where(
                    &tx,
                    &SessionFilter::exact(expected),
                    &SessionPatch::replace_with(replacement),
                )?;
                if changed == 0 {
                    if changes.strict {
                        return Ok(Commit::Stale(expected.id.clone()));
                    }
                    skipped.push(expected.id.clone());
                }
            }

            for session in &changes.delete {
                let deleted = tx.execute(
                    "DELETE FROM sessions WHERE id = ?1 AND status = ?2 AND last_activity = ?3",
                    params![
                        session.id,
                        session.status.as_str(),
                        session.last_activity.timestamp_millis()
                    ],
                )?;
                if deleted == 0 {
                    if changes.strict {
                        return Ok(Commit::Stale(session.id.clone()));
                    }
                    skipped.push(session.id.clone());
                    continue;
                }
                tx.execute(
                    "DELETE FROM messages WHERE session_id = ?1",
                    params![session.id],
                )?;
            }

            for agent_id in &changes.free_agents {
                tx.execute(
                    "UPDATE agents SET status = 'available' WHERE id = ?1",
                    params![agent_id],
                )?;
            }

            for agent_id in &changes.release_agents {
                tx.execute(
                    "UPDATE agents SET status = 'available'
                     WHERE id = ?1 AND NOT EXISTS (
                        SELECT 1 FROM sessions
                        WHERE assigned_agent = ?1 AND mode = 'human' AND status != 'completed'
                     )",
                    params![agent_id],
                )?;
            }

            tx.commit()?;
            if !skipped.is_empty() {
                debug!(
                    component = "store",
                    event = "store.commit.skipped",
                    skipped = ?skipped,
                    "Sessions changed before commit"
                );
            }
            Ok(Commit::Applied { skipped })
        })
        .await
    }

    // -- messages ---------------------------------------------------------

    pub async fn append_message(
        &self,
        session_id: &str,
        sender: Sender,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ChatMessage, StoreError> {
        let session_id = session_id.to_string();
        let text = text.to_string();
        self.call("append_message", move |conn| {
            conn.execute(
                "INSERT INTO messages (session_id, sender, text, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![session_id, sender.as_str(), text, timestamp.timestamp_millis()],
            )?;
            Ok(ChatMessage {
                id: conn.last_insert_rowid(),
                session_id,
                sender,
                text,
                timestamp,
            })
        })
        .await
    }

    /// Full history in timestamp order (insertion order breaks ties).
    pub async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.call("messages", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, session_id, sender, text, timestamp FROM messages
                 WHERE session_id = ?1 ORDER BY timestamp ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map(params![session_id], read_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(MessageRow::into_message).collect()
        })
        .await
    }

    pub async fn last_message(&self, session_id: &str) -> Result<Option<ChatMessage>, StoreError> {
        let session_id = session_id.to_string();
        self.call("last_message", move |conn| {
            let row = conn
                .query_row(
                    "SELECT seq, session_id, sender, text, timestamp FROM messages
                     WHERE session_id = ?1 ORDER BY timestamp DESC, seq DESC LIMIT 1",
                    params![session_id],
                    read_message_row,
                )
                .optional()?;
            row.map(MessageRow::into_message).transpose()
        })
        .await
    }

    // -- agents & users ---------------------------------------------------

    pub async fn find_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let agent_id = agent_id.to_string();
        self.call("find_agent", move |conn| {
            let row: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT id, name, status FROM agents WHERE id = ?1",
                    params![agent_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            row.map(|(id, name, status)| -> Result<Agent, StoreError> {
                Ok(Agent {
                    id,
                    name,
                    status: AgentStatus::parse(&status).ok_or(StoreError::Corrupt {
                        column: "agents.status",
                        value: status,
                    })?,
                })
            })
            .transpose()
        })
        .await
    }

    /// Record an agent's self-reported availability, creating the agent if needed.
    pub async fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.call("set_agent_status", move |conn| {
            conn.execute(
                "INSERT INTO agents (id, status) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status",
                params![agent_id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Users are keyed by id or, for legacy sessions, by email.
    pub async fn find_user(&self, user_id: &str) -> Result<Option<UserInfo>, StoreError> {
        let user_id = user_id.to_string();
        self.call("find_user", move |conn| {
            Ok(conn
                .query_row(
                    "SELECT name, email FROM users WHERE id = ?1 OR email = ?1 LIMIT 1",
                    params![user_id],
                    |row| {
                        Ok(UserInfo {
                            name: row.get(0)?,
                            email: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    #[cfg(test)]
    pub async fn insert_user(&self, id: &str, name: &str, email: &str) -> Result<(), StoreError> {
        let (id, name, email) = (id.to_string(), name.to_string(), email.to_string());
        self.call("insert_user", move |conn| {
            conn.execute(
                "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)",
                params![id, name, email],
            )?;
            Ok(())
        })
        .await
    }
}

fn update_where(
    conn: &Connection,
    filter: &SessionFilter,
    patch: &SessionPatch,
) -> rusqlite::Result<usize> {
    let Some((set, mut values)) = patch.set_clause() else {
        return Ok(0);
    };
    let (clause, where_values) = filter.where_clause();
    values.extend(where_values);
    let sql = format!("UPDATE sessions SET {set} WHERE {clause}");
    conn.execute(&sql, params_from_iter(values))
}

fn select_sessions(conn: &Connection, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
    let (clause, values) = filter.where_clause();
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE {clause}
         ORDER BY last_activity DESC, created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), read_session_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SessionRow::into_session).collect()
}

struct SessionRow {
    id: String,
    user_id: String,
    assigned_agent: String,
    mode: String,
    status: String,
    created_at: i64,
    last_activity: i64,
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        assigned_agent: row.get(2)?,
        mode: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        last_activity: row.get(6)?,
    })
}

impl SessionRow {
    fn into_session(self) -> Result<Session, StoreError> {
        let mode = SessionMode::parse(&self.mode).ok_or(StoreError::Corrupt {
            column: "sessions.mode",
            value: self.mode.clone(),
        })?;
        let status = SessionStatus::parse(&self.status).ok_or(StoreError::Corrupt {
            column: "sessions.status",
            value: self.status.clone(),
        })?;
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            assigned_agent: Assignee::from_wire(&self.assigned_agent),
            mode,
            status,
            created_at: millis_to_datetime("sessions.created_at", self.created_at)?,
            last_activity: millis_to_datetime("sessions.last_activity", self.last_activity)?,
        })
    }
}

struct MessageRow {
    seq: i64,
    session_id: String,
    sender: String,
    text: String,
    timestamp: i64,
}

fn read_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        session_id: row.get(1)?,
        sender: row.get(2)?,
        text: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

impl MessageRow {
    fn into_message(self) -> Result<ChatMessage, StoreError> {
        let sender = Sender::parse(&self.sender).ok_or(StoreError::Corrupt {
            column: "messages.sender",
            value: self.sender.clone(),
        })?;
        Ok(ChatMessage {
            id: self.seq,
            session_id: self.session_id,
            sender,
            text: self.text,
            timestamp: millis_to_datetime("messages.timestamp", self.timestamp)?,
        })
    }
}

fn millis_to_datetime(column: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(StoreError::Corrupt {
        column,
        value: millis.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{now_ms, session_for, test_store};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn find_by_filter_respects_status_set_and_mode() {
        let store = test_store();
        let now = now_ms();
        let open = session_for("u1", Assignee::System, now);
        let mut done = session_for("u1", Assignee::System, now);
        done.status = SessionStatus::Completed;
        store.insert_session(open.clone()).await.unwrap();
        store.insert_session(done.clone()).await.unwrap();

        let found = store
            .find_sessions(SessionFilter::open_for_user("u1"))
            .await
            .unwrap();
        assert_eq!(found, vec![open.clone()]);

        let system = store
            .find_session(SessionFilter::system_owned())
            .await
            .unwrap();
        assert_eq!(system.map(|s| s.id), Some(open.id));
    }

    #[tokio::test]
    async fn patch_moves_owner_and_mode_together() {
        let store = test_store();
        let session = session_for("u1", Assignee::System, now_ms());
        store.insert_session(session.clone()).await.unwrap();

        let changed = store
            .update_sessions(
                SessionFilter::by_id(&session.id),
                SessionPatch {
                    assignee: Some(Assignee::Agent("a1".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let stored = store
            .find_session(SessionFilter::by_id(&session.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.mode, SessionMode::Human);
        assert_eq!(stored.assigned_agent, Assignee::Agent("a1".into()));
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn claim_of_busy_agent_writes_nothing() {
        let store = test_store();
        store.set_agent_status("a1", AgentStatus::Busy).await.unwrap();
        let before = session_for("u1", Assignee::System, now_ms());
        store.insert_session(before.clone()).await.unwrap();
        let mut after = before.clone();
        after.assigned_agent = Assignee::Agent("a1".into());
        after.mode = SessionMode::Human;

        let commit = store
            .commit(Changeset {
                claim_agent: Some("a1".into()),
                replace: vec![(before.clone(), after)],
                strict: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(commit, Commit::AgentUnavailable);

        let stored = store
            .find_session(SessionFilter::by_id(&before.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, before);
    }

    #[tokio::test]
    async fn stale_strict_changeset_rolls_back_agent_claim() {
        let store = test_store();
        store
            .set_agent_status("a1", AgentStatus::Available)
            .await
            .unwrap();
        let before = session_for("u1", Assignee::System, now_ms());
        store.insert_session(before.clone()).await.unwrap();

        // someone else completed it meanwhile
        store
            .update_sessions(
                SessionFilter::by_id(&before.id),
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut after = before.clone();
        after.assigned_agent = Assignee::Agent("a1".into());
        after.mode = SessionMode::Human;
        let commit = store
            .commit(Changeset {
                claim_agent: Some("a1".into()),
                replace: vec![(before.clone(), after)],
                strict: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(commit, Commit::Stale(before.id.clone()));

        let agent = store.find_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn release_keeps_agent_busy_while_holding_another_session() {
        let store = test_store();
        store.set_agent_status("a1", AgentStatus::Busy).await.unwrap();
        let held = session_for("u1", Assignee::Agent("a1".into()), now_ms());
        store.insert_session(held).await.unwrap();

        store
            .commit(Changeset {
                release_agents: vec!["a1".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let agent = store.find_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);

        store
            .commit(Changeset {
                free_agents: vec!["a1".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let agent = store.find_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn timed_out_commit_leaves_no_trace() {
        let store = Store::open_in_memory(std::time::Duration::from_millis(50)).unwrap();
        store
            .set_agent_status("a1", AgentStatus::Available)
            .await
            .unwrap();
        let before = session_for("u1", Assignee::System, now_ms());
        store.insert_session(before.clone()).await.unwrap();
        let mut after = before.clone();
        after.assigned_agent = Assignee::Agent("a1".into());
        after.mode = SessionMode::Human;

        let conn = Arc::clone(&store.conn);
        let holder = std::thread::spawn(move || {
            let _guard = conn.lock().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(200));
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = store
            .commit(Changeset {
                claim_agent: Some("a1".into()),
                replace: vec![(before.clone(), after)],
                strict: true,
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(StoreError::Timeout { op: "commit", .. })));

        holder.join().unwrap();
        // let the abandoned worker take the lock and bow out
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let agent = store.find_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);
        let stored = store
            .find_session(SessionFilter::by_id(&before.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, before);
    }

    #[tokio::test]
    async fn replace_keeps_newer_activity() {
        let store = test_store();
        let now = now_ms();
        let before = session_for("u1", Assignee::System, now - ChronoDuration::minutes(5));
        store.insert_session(before.clone()).await.unwrap();

        // a chat message lands between read and write
        store
            .update_sessions(SessionFilter::by_id(&before.id), SessionPatch::touch(now))
            .await
            .unwrap();

        let mut after = before.clone();
        after.status = SessionStatus::Completed;
        after.last_activity = now - ChronoDuration::minutes(1);
        let commit = store
            .commit(Changeset {
                replace: vec![(before.clone(), after)],
                strict: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(commit, Commit::Applied { skipped: vec![] });

        let stored = store
            .find_session(SessionFilter::by_id(&before.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.last_activity, now);
    }

    #[tokio::test]
    async fn delete_skips_sessions_touched_since_read() {
        let store = test_store();
        let now = now_ms();
        let stale = session_for("u1", Assignee::System, now - ChronoDuration::hours(1));
        store.insert_session(stale.clone()).await.unwrap();
        store
            .append_message(&stale.id, Sender::User, "hi", now)
            .await
            .unwrap();
        store
            .update_sessions(SessionFilter::by_id(&stale.id), SessionPatch::touch(now))
            .await
            .unwrap();

        let commit = store
            .commit(Changeset {
                delete: vec![stale.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            commit,
            Commit::Applied {
                skipped: vec![stale.id.clone()]
            }
        );
        assert!(store
            .find_session(SessionFilter::by_id(&stale.id))
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.messages(&stale.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages_replay_in_timestamp_then_insert_order() {
        let store = test_store();
        let now = now_ms();
        store
            .append_message("s1", Sender::System, "second", now)
            .await
            .unwrap();
        store
            .append_message("s1", Sender::User, "first", now - ChronoDuration::seconds(1))
            .await
            .unwrap();
        store
            .append_message("s1", Sender::Agent, "third", now)
            .await
            .unwrap();

        let texts: Vec<String> = store
            .messages("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);

        let last = store.last_message("s1").await.unwrap().unwrap();
        assert_eq!(last.text, "third");
    }

    #[tokio::test]
    async fn users_resolve_by_id_or_email() {
        let store = test_store();
        store
            .insert_user("u-1", "Ada", "ada@example.com")
            .await
            .unwrap();
        let by_email = store.find_user("ada@example.com").await.unwrap();
        assert_eq!(by_email.map(|u| u.name), Some("Ada".to_string()));
        assert!(store.find_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaydesk.db");
        let session = session_for("u1", Assignee::System, now_ms());
        {
            let store = Store::open(&path, Duration::from_secs(5)).unwrap();
            store.insert_session(session.clone()).await.unwrap();
        }
        let store = Store::open(&path, Duration::from_secs(5)).unwrap();
        let found = store
            .find_session(SessionFilter::by_id(&session.id))
            .await
            .unwrap();
        assert_eq!(found, Some(session));
    }
}
