#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    idempotency_key TEXT,
    state TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempt INTEGER NOT NULL DEFAULT 0,
    recoveries INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_attempt_at_ms INTEGER,
    lease_holder TEXT,
    lease_expires_at_ms INTEGER,
    heartbeat_at_ms INTEGER,
    started_at_ms INTEGER,
    result TEXT,
    error TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_idempotency_key
    ON tasks (idempotency_key)
    WHERE idempotency_key IS NOT NULL AND state != 'failed';

CREATE INDEX IF NOT EXISTS idx_tasks_ready
    ON tasks (state, priority DESC, created_at_ms);

CREATE INDEX IF NOT EXISTS idx_tasks_heartbeat
    ON tasks (state, heartbeat_at_ms);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    started_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    error_detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_task
    ON runs (task_id, finished_at_ms);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms INTEGER NOT NULL,
    cpu_pct REAL NOT NULL,
    mem_pct REAL NOT NULL,
    op_count INTEGER NOT NULL,
    error_count INTEGER NOT NULL,
    concurrency_limit INTEGER NOT NULL,
    paused INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_metrics_timestamp
    ON metrics (timestamp_ms);
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_sessions",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER,
    status TEXT NOT NULL,
    stats TEXT
);
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_contiguous() {
        for (index, migration) in migrations().iter().enumerate() {
            assert_eq!(migration.version, index as i64 + 1);
        }
        assert_eq!(current_schema_version(), 2);
    }
}
