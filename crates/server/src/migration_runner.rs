//! Lightweight migration runner for rusqlite.
//!
//! Migrations are compiled into the binary, tracked in `schema_versions`,
//! and any pending ones run in order when the store opens.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

/// Numbered migrations, oldest first.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "001_initial",
    include_str!("../migrations/001_initial.sql"),
)];

/// Run all pending migrations against the given connection.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        "Migration check complete"
    );

    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('sessions', 'messages', 'agents', 'users')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
