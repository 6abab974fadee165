//! SQL migration definitions for the orchestration history database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: workflow_instances, workflow_events",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per orchestration instance
CREATE TABLE IF NOT EXISTS workflow_instances (
    id           TEXT PRIMARY KEY,
    project      TEXT NOT NULL,
    state        TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    summary_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_instances_project ON workflow_instances(project, created_at);

-- At most one running instance per project
CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_running
    ON workflow_instances(project) WHERE status = 'running';

-- Recorded step results, replayed on resume
CREATE TABLE IF NOT EXISTS workflow_events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id TEXT NOT NULL REFERENCES workflow_instances(id) ON DELETE CASCADE,
    step_id     TEXT NOT NULL,
    result_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE(instance_id, step_id)
);

CREATE INDEX IF NOT EXISTS idx_events_instance ON workflow_events(instance_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
