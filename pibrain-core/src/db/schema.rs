//! Database schema and migrations.
//!
//! Uses SQLite with embedded migrations managed via `PRAGMA user_version`.
//! A migration may be prefixed with a `-- REQUIRES: <capability>` directive;
//! the capability is checked against compiled-in SQLite features (currently
//! only `fts5`) and the migration is skipped, rather than failing the whole
//! batch, when the capability is unavailable.

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 4;

/// SQL migrations, indexed by version number (migration `N` is `MIGRATIONS[N-1]`).
const MIGRATIONS: &[&str] = &[
    // Version 1: nodes, relational core.
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id               TEXT NOT NULL,
        version          INTEGER NOT NULL,
        session_file     TEXT NOT NULL,
        segment_start    TEXT NOT NULL,
        segment_end      TEXT NOT NULL,
        segment_start_at DATETIME NOT NULL,
        analyzed_at      DATETIME NOT NULL,
        project          TEXT,
        node_type        TEXT NOT NULL,
        outcome          TEXT NOT NULL,
        model            TEXT NOT NULL,
        tokens_in        INTEGER NOT NULL DEFAULT 0,
        tokens_out       INTEGER NOT NULL DEFAULT 0,
        cost_usd         REAL NOT NULL DEFAULT 0,
        duration_ms      INTEGER NOT NULL DEFAULT 0,
        prompt_version   TEXT NOT NULL,
        summary          TEXT NOT NULL,
        decisions        JSON NOT NULL DEFAULT '[]',
        tags             JSON NOT NULL DEFAULT '[]',
        topics           JSON NOT NULL DEFAULT '[]',
        previous_versions JSON NOT NULL DEFAULT '[]',
        content          JSON NOT NULL,
        json_path        TEXT NOT NULL,
        is_current       INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (id, version)
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_current ON nodes(id) WHERE is_current = 1;
    CREATE INDEX IF NOT EXISTS idx_nodes_session_file ON nodes(session_file);
    CREATE INDEX IF NOT EXISTS idx_nodes_segment_start_at ON nodes(segment_start_at);
    CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project);

    CREATE TABLE IF NOT EXISTS edges (
        id         TEXT PRIMARY KEY,
        source     TEXT NOT NULL,
        target     TEXT NOT NULL,
        edge_type  TEXT NOT NULL,
        metadata   JSON NOT NULL DEFAULT '{}',
        created_by TEXT NOT NULL,
        created_at DATETIME NOT NULL,
        UNIQUE(source, target, edge_type)
    );

    CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);

    CREATE TABLE IF NOT EXISTS jobs (
        id           TEXT PRIMARY KEY,
        job_type     TEXT NOT NULL,
        status       TEXT NOT NULL,
        priority     INTEGER NOT NULL DEFAULT 0,
        payload      JSON NOT NULL,
        retry_count  INTEGER NOT NULL DEFAULT 0,
        max_retries  INTEGER NOT NULL DEFAULT 5,
        queued_at    DATETIME NOT NULL,
        available_at DATETIME,
        last_error   TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, queued_at);
    "#,
    // Version 2: child observation tables, cascade-deleted with their node.
    r#"
    CREATE TABLE IF NOT EXISTS lessons (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id    TEXT NOT NULL,
        level      TEXT NOT NULL,
        summary    TEXT NOT NULL,
        tags       JSON NOT NULL DEFAULT '[]',
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_lessons_node_id ON lessons(node_id);

    CREATE TABLE IF NOT EXISTS model_quirks (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id    TEXT NOT NULL,
        model      TEXT NOT NULL,
        frequency  INTEGER NOT NULL DEFAULT 1,
        severity   TEXT NOT NULL,
        summary    TEXT NOT NULL,
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_model_quirks_node_id ON model_quirks(node_id);

    CREATE TABLE IF NOT EXISTS tool_errors (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id    TEXT NOT NULL,
        tool       TEXT NOT NULL,
        error_type TEXT NOT NULL,
        model      TEXT NOT NULL,
        summary    TEXT NOT NULL,
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tool_errors_node_id ON tool_errors(node_id);
    CREATE INDEX IF NOT EXISTS idx_tool_errors_fingerprint ON tool_errors(tool, error_type, model);

    CREATE TABLE IF NOT EXISTS daemon_decisions (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id    TEXT NOT NULL,
        summary    TEXT NOT NULL,
        created_at DATETIME NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_daemon_decisions_node_id ON daemon_decisions(node_id);
    "#,
    // Version 3: aggregation tables (patterns, insights, clusters, effectiveness).
    r#"
    CREATE TABLE IF NOT EXISTS failure_patterns (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        tool        TEXT NOT NULL,
        error_type  TEXT NOT NULL,
        model       TEXT NOT NULL,
        occurrences INTEGER NOT NULL DEFAULT 1,
        node_ids    JSON NOT NULL DEFAULT '[]',
        created_at  DATETIME NOT NULL,
        updated_at  DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS lesson_patterns (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint      TEXT NOT NULL UNIQUE,
        error_fingerprint TEXT NOT NULL,
        model            TEXT NOT NULL,
        occurrences      INTEGER NOT NULL DEFAULT 1,
        node_ids         JSON NOT NULL DEFAULT '[]',
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS aggregated_insights (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint    TEXT NOT NULL UNIQUE,
        model          TEXT NOT NULL,
        insight_type   TEXT NOT NULL,
        node_ids       JSON NOT NULL DEFAULT '[]',
        confidence     REAL NOT NULL DEFAULT 0,
        prompt_included INTEGER NOT NULL DEFAULT 0,
        prompt_version TEXT,
        summary        TEXT NOT NULL,
        created_at     DATETIME NOT NULL,
        updated_at     DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS clusters (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        label      TEXT NOT NULL,
        node_ids   JSON NOT NULL DEFAULT '[]',
        centroid   JSON,
        is_noise   INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS prompt_effectiveness (
        insight_id      INTEGER NOT NULL,
        prompt_version  TEXT NOT NULL,
        before_count    INTEGER NOT NULL DEFAULT 0,
        after_count     INTEGER NOT NULL DEFAULT 0,
        session_count   INTEGER NOT NULL DEFAULT 0,
        significant     INTEGER NOT NULL DEFAULT 0,
        improvement_pct REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (insight_id, prompt_version)
    );
    "#,
    // Version 4: full-text search over current-version node content.
    r#"-- REQUIRES: fts5
    CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
        node_id UNINDEXED,
        summary,
        decisions,
        lessons,
        tags,
        topics,
        content='',
        tokenize='porter unicode61'
    );
    "#,
];

/// Capabilities this binary's SQLite build may lack. A migration tagged
/// `-- REQUIRES: fts5` is skipped (not applied, not an error) when the
/// loaded SQLite was compiled without the corresponding feature.
fn capability_available(conn: &Connection, capability: &str) -> bool {
    match capability {
        "fts5" => conn
            .query_row(
                "SELECT 1 FROM pragma_compile_options WHERE compile_options = 'ENABLE_FTS5'",
                [],
                |_| Ok(()),
            )
            .is_ok(),
        _ => true,
    }
}

fn requires_directive(migration: &str) -> Option<&str> {
    migration
        .trim_start()
        .strip_prefix("-- REQUIRES: ")
        .and_then(|rest| rest.lines().next())
        .map(|s| s.trim())
}

/// Applies migrations above the database's current `user_version`, in order.
/// Idempotent by construction: a migration whose version is already applied
/// is never re-run.
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current = get_schema_version(conn)?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i32;
        if version <= current {
            continue;
        }

        if let Some(capability) = requires_directive(migration) {
            if !capability_available(conn, capability) {
                tracing::warn!(capability, version, "skipping migration, capability unavailable");
                conn.pragma_update(None, "user_version", version)?;
                continue;
            }
        }

        conn.execute_batch(migration)?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        for table in ["nodes", "edges", "jobs", "lessons", "model_quirks", "tool_errors", "failure_patterns"] {
            let exists: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_capability_gate_never_fails_the_batch() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(run_migrations(&conn).is_ok());
    }
}
