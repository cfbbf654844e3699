use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};

use super::error::StoreError;
use super::migrations::{current_schema_version, migrations};
use crate::domain::{
    Enqueued, MetricSample, NewTask, QueueCounts, RunId, RunOutcome, RunRecord, SessionId,
    SessionRecord, SessionStatus, TaskId, TaskRecord, TaskState, TaskType,
};
use crate::ports::{Clock, GcReport, Lease, StoreResult, SystemClock, TaskFailure, TaskStore};

const TASK_COLUMNS: &str = "id, task_type, payload, idempotency_key, state, priority, attempt, \
    recoveries, max_attempts, next_attempt_at_ms, lease_holder, lease_expires_at_ms, \
    heartbeat_at_ms, started_at_ms, result, error, created_at_ms, updated_at_ms";

const RUN_COLUMNS: &str =
    "id, task_id, attempt_number, started_at_ms, finished_at_ms, outcome, error_detail";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite 実装の TaskStore
///
/// 1 つの DB ファイルを複数プロセスが共有できます。
/// 書き込みはすべて `BEGIN IMMEDIATE` のトランザクション内で、
/// `(id, state[, lease_holder])` を条件にした UPDATE として行います。
/// 影響行数が 0 なら「他の誰かが先に遷移させた」と判断します。
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    default_max_attempts: u32,
}

impl fmt::Debug for SqliteTaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTaskStore")
            .field("default_max_attempts", &self.default_max_attempts)
            .finish_non_exhaustive()
    }
}

impl SqliteTaskStore {
    /// Open (or create) the database at `path` and bring the schema up to date.
    pub fn open(path: impl AsRef<Path>, default_max_attempts: u32) -> StoreResult<Self> {
        Self::open_with_clock(path, default_max_attempts, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        default_max_attempts: u32,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, default_max_attempts, clock)
    }

    pub fn open_in_memory(default_max_attempts: u32, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, default_max_attempts, clock)
    }

    fn from_connection(
        mut conn: Connection,
        default_max_attempts: u32,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode returns a row, so it can't go through execute().
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        apply_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
            default_max_attempts: default_max_attempts.max(1),
        })
    }

    pub fn schema_version(&self) -> StoreResult<i64> {
        self.with_connection(|conn| Ok(read_schema_version(conn)?))
    }

    /// Most recent sessions first.
    pub fn recent_sessions(&self, limit: usize) -> StoreResult<Vec<SessionRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at_ms, finished_at_ms, status, stats FROM sessions \
                 ORDER BY started_at_ms DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![to_i64(limit)], row_to_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn with_connection<T>(
        &self,
        operation: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        operation(&conn)
    }

    /// Run `operation` inside `BEGIN IMMEDIATE`, committing on `Ok`.
    ///
    /// IMMEDIATE takes the write lock up front, so concurrent claimers in
    /// other processes serialize here instead of failing at commit time.
    fn with_transaction<T>(
        &self,
        operation: impl FnOnce(&Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = operation(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl TaskStore for SqliteTaskStore {
    fn enqueue(&self, task: NewTask) -> StoreResult<Enqueued> {
        let now = self.now();
        let max_attempts = task.max_attempts.unwrap_or(self.default_max_attempts).max(1);

        self.with_transaction(|tx| {
            if let Some(key) = task.idempotency_key.as_deref() {
                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {TASK_COLUMNS} FROM tasks \
                             WHERE idempotency_key = ?1 AND state != 'failed' \
                             ORDER BY created_at_ms DESC LIMIT 1"
                        ),
                        params![key],
                        row_to_task,
                    )
                    .optional()?;

                if let Some(existing) = existing {
                    return Ok(match existing.state {
                        TaskState::Succeeded => Enqueued::Completed {
                            task_id: existing.id,
                            result: existing.result,
                        },
                        _ => Enqueued::Pending(existing.id),
                    });
                }
            }

            let id = TaskId::generate();
            let now_ms = to_ms(now);
            tx.execute(
                "INSERT INTO tasks (id, task_type, payload, idempotency_key, state, priority, \
                 attempt, recoveries, max_attempts, created_at_ms, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    task.task_type.as_str(),
                    serde_json::to_string(&task.payload)?,
                    task.idempotency_key,
                    TaskState::Queued.as_str(),
                    task.priority,
                    max_attempts,
                    now_ms,
                ],
            )?;
            Ok(Enqueued::Created(id))
        })
    }

    fn reserve_batch(&self, limit: usize, lease: &Lease) -> StoreResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let now_ms = to_ms(now);
        let expires_ms = to_ms(later(now, lease.duration));

        self.with_transaction(|tx| {
            // retry_scheduled -> queued once the backoff has elapsed
            tx.execute(
                "UPDATE tasks SET state = 'queued', next_attempt_at_ms = NULL, updated_at_ms = ?1 \
                 WHERE state = 'retry_scheduled' AND next_attempt_at_ms <= ?1",
                params![now_ms],
            )?;

            let candidates: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM tasks WHERE state = 'queued' \
                     ORDER BY priority DESC, created_at_ms ASC, rowid ASC LIMIT ?1",
                )?;
                let ids = stmt
                    .query_map(params![to_i64(limit)], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                let changed = tx.execute(
                    "UPDATE tasks SET state = 'reserved', lease_holder = ?2, \
                     lease_expires_at_ms = ?3, heartbeat_at_ms = ?4, updated_at_ms = ?4 \
                     WHERE id = ?1 AND state = 'queued'",
                    params![id, lease.holder, expires_ms, now_ms],
                )?;
                if changed == 1 {
                    let record = tx.query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                        params![id],
                        row_to_task,
                    )?;
                    claimed.push(record);
                }
            }
            Ok(claimed)
        })
    }

    fn mark_in_progress(&self, task_id: TaskId, lease: &Lease) -> StoreResult<TaskRecord> {
        let now = self.now();
        let now_ms = to_ms(now);
        let expires_ms = to_ms(later(now, lease.duration));

        self.with_transaction(|tx| {
            let changed = tx.execute(
                "UPDATE tasks SET state = 'in_progress', attempt = attempt + 1, \
                 started_at_ms = ?3, heartbeat_at_ms = ?3, lease_expires_at_ms = ?4, \
                 updated_at_ms = ?3 \
                 WHERE id = ?1 AND state = 'reserved' AND lease_holder = ?2",
                params![task_id.to_string(), lease.holder, now_ms, expires_ms],
            )?;
            if changed == 0 {
                return Err(lease_lost(task_id, lease));
            }
            Ok(tx.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id.to_string()],
                row_to_task,
            )?)
        })
    }

    fn heartbeat(&self, task_id: TaskId, lease: &Lease) -> StoreResult<()> {
        let now = self.now();
        let now_ms = to_ms(now);
        let expires_ms = to_ms(later(now, lease.duration));

        self.with_transaction(|tx| {
            let changed = tx.execute(
                "UPDATE tasks SET heartbeat_at_ms = ?3, lease_expires_at_ms = ?4, \
                 updated_at_ms = ?3 \
                 WHERE id = ?1 AND lease_holder = ?2 AND state IN ('reserved', 'in_progress')",
                params![task_id.to_string(), lease.holder, now_ms, expires_ms],
            )?;
            if changed == 0 {
                return Err(lease_lost(task_id, lease));
            }
            Ok(())
        })
    }

    fn complete(
        &self,
        task_id: TaskId,
        lease: &Lease,
        result: &serde_json::Value,
    ) -> StoreResult<()> {
        let now = self.now();
        let result_json = serde_json::to_string(result)?;

        self.with_transaction(|tx| {
            let record = fetch_leased(tx, task_id, lease)?;
            let changed = tx.execute(
                "UPDATE tasks SET state = 'succeeded', result = ?3, error = NULL, \
                 lease_holder = NULL, lease_expires_at_ms = NULL, updated_at_ms = ?4 \
                 WHERE id = ?1 AND lease_holder = ?2 AND state IN ('reserved', 'in_progress')",
                params![task_id.to_string(), lease.holder, result_json, to_ms(now)],
            )?;
            if changed == 0 {
                return Err(lease_lost(task_id, lease));
            }
            insert_run(tx, &finished_run(&record, now, RunOutcome::Succeeded, None))?;
            Ok(())
        })
    }

    fn fail(
        &self,
        task_id: TaskId,
        lease: &Lease,
        failure: &TaskFailure,
    ) -> StoreResult<TaskState> {
        let now = self.now();

        self.with_transaction(|tx| {
            let record = fetch_leased(tx, task_id, lease)?;
            let next_state = if failure.retryable && record.has_retry_budget() {
                TaskState::RetryScheduled
            } else {
                TaskState::Failed
            };
            let next_attempt_ms = match next_state {
                TaskState::RetryScheduled => Some(to_ms(later(now, failure.backoff))),
                _ => None,
            };

            let changed = tx.execute(
                "UPDATE tasks SET state = ?3, error = ?4, next_attempt_at_ms = ?5, \
                 lease_holder = NULL, lease_expires_at_ms = NULL, updated_at_ms = ?6 \
                 WHERE id = ?1 AND lease_holder = ?2 AND state IN ('reserved', 'in_progress')",
                params![
                    task_id.to_string(),
                    lease.holder,
                    next_state.as_str(),
                    failure.error,
                    next_attempt_ms,
                    to_ms(now),
                ],
            )?;
            if changed == 0 {
                return Err(lease_lost(task_id, lease));
            }
            insert_run(
                tx,
                &finished_run(&record, now, RunOutcome::Failed, Some(failure.error.clone())),
            )?;
            Ok(next_state)
        })
    }

    fn recover_stale(&self, lease_timeout: Duration) -> StoreResult<Vec<TaskId>> {
        let now = self.now();
        let cutoff_ms = to_ms(earlier(now, lease_timeout));

        self.with_transaction(|tx| {
            let stale: Vec<TaskRecord> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE state IN ('reserved', 'in_progress') \
                     AND (heartbeat_at_ms IS NULL OR heartbeat_at_ms < ?1)"
                ))?;
                let rows = stmt
                    .query_map(params![cutoff_ms], row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            let mut recovered = Vec::with_capacity(stale.len());
            for record in stale {
                // Only an in-progress dispatch was counted in `attempt`.
                let changed = tx.execute(
                    "UPDATE tasks SET state = 'queued', \
                     recoveries = recoveries + CASE WHEN state = 'in_progress' THEN 1 ELSE 0 END, \
                     lease_holder = NULL, lease_expires_at_ms = NULL, updated_at_ms = ?3 \
                     WHERE id = ?1 AND state = ?2 \
                     AND (heartbeat_at_ms IS NULL OR heartbeat_at_ms < ?4)",
                    params![
                        record.id.to_string(),
                        record.state.as_str(),
                        to_ms(now),
                        cutoff_ms,
                    ],
                )?;
                if changed == 0 {
                    continue;
                }
                // A reserved task never reached a handler; its run keeps
                // the uncounted attempt number.
                let detail = format!(
                    "lease expired in {} (holder {})",
                    record.state,
                    record.lease_holder.as_deref().unwrap_or("unknown")
                );
                insert_run(
                    tx,
                    &finished_run(&record, now, RunOutcome::Abandoned, Some(detail)),
                )?;
                recovered.push(record.id);
            }
            Ok(recovered)
        })
    }

    fn gc(&self, completed_after: Duration) -> StoreResult<GcReport> {
        let cutoff_ms = to_ms(earlier(self.now(), completed_after));

        self.with_transaction(|tx| {
            let runs = tx.execute(
                "DELETE FROM runs WHERE task_id IN (\
                 SELECT id FROM tasks WHERE state IN ('succeeded', 'failed') \
                 AND updated_at_ms < ?1)",
                params![cutoff_ms],
            )?;
            let tasks = tx.execute(
                "DELETE FROM tasks WHERE state IN ('succeeded', 'failed') AND updated_at_ms < ?1",
                params![cutoff_ms],
            )?;
            Ok(GcReport {
                tasks,
                runs,
                metrics: 0,
            })
        })
    }

    fn get(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![task_id.to_string()],
                    row_to_task,
                )
                .optional()?)
        })
    }

    fn runs_for(&self, task_id: TaskId) -> StoreResult<Vec<RunRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE task_id = ?1 \
                 ORDER BY finished_at_ms ASC, rowid ASC"
            ))?;
            let runs = stmt
                .query_map(params![task_id.to_string()], row_to_run)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
    }

    fn counts_by_state(&self) -> StoreResult<QueueCounts> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
            let rows = stmt
                .query_map([], |row| {
                    let state: TaskState = parse_text(row, 0)?;
                    let count: i64 = row.get(1)?;
                    Ok((state, count))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut counts = QueueCounts::default();
            for (state, count) in rows {
                counts.add(state, usize::try_from(count).unwrap_or(0));
            }
            Ok(counts)
        })
    }

    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO metrics (timestamp_ms, cpu_pct, mem_pct, op_count, error_count, \
                 concurrency_limit, paused) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    to_ms(sample.timestamp),
                    sample.cpu_pct,
                    sample.mem_pct,
                    to_i64(sample.op_count),
                    to_i64(sample.error_count),
                    to_i64(sample.concurrency_limit),
                    sample.paused,
                ],
            )?;
            Ok(())
        })
    }

    fn recent_metrics(&self, limit: usize) -> StoreResult<Vec<MetricSample>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp_ms, cpu_pct, mem_pct, op_count, error_count, \
                 concurrency_limit, paused FROM metrics ORDER BY timestamp_ms DESC, id DESC \
                 LIMIT ?1",
            )?;
            let samples = stmt
                .query_map(params![to_i64(limit)], |row| {
                    Ok(MetricSample {
                        timestamp: time_column(row, 0)?,
                        cpu_pct: row.get(1)?,
                        mem_pct: row.get(2)?,
                        op_count: unsigned_column(row, 3)?,
                        error_count: unsigned_column(row, 4)?,
                        concurrency_limit: unsigned_column(row, 5)?,
                        paused: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(samples)
        })
    }

    fn gc_metrics(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff_ms = to_ms(earlier(self.now(), older_than));
        self.with_connection(|conn| {
            Ok(conn.execute(
                "DELETE FROM metrics WHERE timestamp_ms < ?1",
                params![cutoff_ms],
            )?)
        })
    }

    fn start_session(&self) -> StoreResult<SessionId> {
        let id = SessionId::generate();
        let now_ms = to_ms(self.now());
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, started_at_ms, status) VALUES (?1, ?2, ?3)",
                params![id.to_string(), now_ms, SessionStatus::Running.as_str()],
            )?;
            Ok(id)
        })
    }

    fn finish_session(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        stats: &serde_json::Value,
    ) -> StoreResult<()> {
        let now_ms = to_ms(self.now());
        let stats_json = serde_json::to_string(stats)?;
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET finished_at_ms = ?2, status = ?3, stats = ?4 WHERE id = ?1",
                params![session_id.to_string(), now_ms, status.as_str(), stats_json],
            )?;
            Ok(())
        })
    }
}

fn apply_migrations(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at_ms INTEGER NOT NULL
        );",
    )?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let found = read_schema_version(&tx)?;
    let supported = current_schema_version();
    if found > supported {
        return Err(StoreError::SchemaTooNew { found, supported });
    }

    for migration in migrations().iter().filter(|m| m.version > found) {
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, Utc::now().timestamp_millis()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn read_schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
}

fn fetch_leased(tx: &Transaction<'_>, task_id: TaskId, lease: &Lease) -> StoreResult<TaskRecord> {
    tx.query_row(
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE id = ?1 AND lease_holder = ?2 AND state IN ('reserved', 'in_progress')"
        ),
        params![task_id.to_string(), lease.holder],
        row_to_task,
    )
    .optional()?
    .ok_or_else(|| lease_lost(task_id, lease))
}

fn lease_lost(task_id: TaskId, lease: &Lease) -> StoreError {
    StoreError::LeaseLost {
        task_id,
        holder: lease.holder.clone(),
    }
}

fn finished_run(
    record: &TaskRecord,
    finished_at: DateTime<Utc>,
    outcome: RunOutcome,
    error_detail: Option<String>,
) -> RunRecord {
    RunRecord {
        id: RunId::generate(),
        task_id: record.id,
        attempt_number: record.attempt,
        started_at: record
            .started_at
            .or(record.heartbeat_at)
            .unwrap_or(finished_at),
        finished_at,
        outcome,
        error_detail,
    }
}

fn insert_run(tx: &Transaction<'_>, run: &RunRecord) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO runs (id, task_id, attempt_number, started_at_ms, finished_at_ms, outcome, \
         error_detail) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.id.to_string(),
            run.task_id.to_string(),
            run.attempt_number,
            to_ms(run.started_at),
            to_ms(run.finished_at),
            run.outcome.as_str(),
            run.error_detail,
        ],
    )?;
    Ok(())
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: parse_text(row, 0)?,
        task_type: TaskType::new(row.get::<_, String>(1)?),
        payload: json_column(row, 2)?,
        idempotency_key: row.get(3)?,
        state: parse_text(row, 4)?,
        priority: row.get(5)?,
        attempt: row.get(6)?,
        recoveries: row.get(7)?,
        max_attempts: row.get(8)?,
        next_attempt_at: optional_time_column(row, 9)?,
        lease_holder: row.get(10)?,
        lease_expires_at: optional_time_column(row, 11)?,
        heartbeat_at: optional_time_column(row, 12)?,
        started_at: optional_time_column(row, 13)?,
        result: row
            .get::<_, Option<String>>(14)?
            .map(|raw| parse_json(14, &raw))
            .transpose()?,
        error: row.get(15)?,
        created_at: time_column(row, 16)?,
        updated_at: time_column(row, 17)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: parse_text(row, 0)?,
        task_id: parse_text(row, 1)?,
        attempt_number: row.get(2)?,
        started_at: time_column(row, 3)?,
        finished_at: time_column(row, 4)?,
        outcome: parse_text(row, 5)?,
        error_detail: row.get(6)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: parse_text(row, 0)?,
        started_at: time_column(row, 1)?,
        finished_at: optional_time_column(row, 2)?,
        status: parse_text(row, 3)?,
        stats: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_json(4, &raw))
            .transpose()?,
    })
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|err| conversion_error(idx, Type::Text, err.to_string()))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    parse_json(idx, &raw)
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_ms(idx, ms)
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_ms(idx, ms))
        .transpose()
}

fn unsigned_column<T: TryFrom<i64>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|_| conversion_error(idx, Type::Integer, format!("{raw} out of range")))
}

fn from_ms(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {ms} out of range")))
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(std::io::Error::other(message)))
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(chrono_duration(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(chrono_duration(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn store_with_clock() -> (SqliteTaskStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(start()));
        let store = SqliteTaskStore::open_in_memory(3, clock.clone()).unwrap();
        (store, clock)
    }

    fn lease(holder: &str) -> Lease {
        Lease::new(holder, Duration::from_secs(60))
    }

    fn created(outcome: Enqueued) -> TaskId {
        match outcome {
            Enqueued::Created(id) => id,
            other => panic!("expected a new task, got {other:?}"),
        }
    }

    fn dispatch(store: &SqliteTaskStore, holder: &str) -> TaskRecord {
        let lease = lease(holder);
        let mut claimed = store.reserve_batch(1, &lease).unwrap();
        assert_eq!(claimed.len(), 1, "expected one ready task");
        let task = claimed.remove(0);
        store.mark_in_progress(task.id, &lease).unwrap()
    }

    #[test]
    fn enqueue_creates_queued_task_with_default_budget() {
        let (store, _) = store_with_clock();
        let id = created(store.enqueue(NewTask::new("demo", json!({"value": 1}))).unwrap());

        let task = store.get(id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.payload, json!({"value": 1}));
        assert_eq!(task.created_at, start());
    }

    #[test]
    fn duplicate_key_returns_existing_task() {
        let (store, _) = store_with_clock();
        let first = store
            .enqueue(NewTask::new("demo", json!({})).with_idempotency_key("k1"))
            .unwrap();
        let second = store
            .enqueue(NewTask::new("demo", json!({})).with_idempotency_key("k1"))
            .unwrap();

        assert!(first.is_created());
        assert_eq!(second, Enqueued::Pending(first.task_id()));
        assert_eq!(store.counts_by_state().unwrap().total(), 1);
    }

    #[test]
    fn duplicate_key_after_success_returns_result() {
        let (store, _) = store_with_clock();
        let id = created(
            store
                .enqueue(NewTask::new("demo", json!({})).with_idempotency_key("k1"))
                .unwrap(),
        );
        let task = dispatch(&store, "w1");
        store.complete(task.id, &lease("w1"), &json!({"ok": true})).unwrap();

        let again = store
            .enqueue(NewTask::new("demo", json!({})).with_idempotency_key("k1"))
            .unwrap();
        assert_eq!(
            again,
            Enqueued::Completed {
                task_id: id,
                result: Some(json!({"ok": true})),
            }
        );
    }

    #[test]
    fn failed_task_releases_its_key() {
        let (store, _) = store_with_clock();
        store
            .enqueue(
                NewTask::new("demo", json!({}))
                    .with_idempotency_key("k1")
                    .with_max_attempts(1),
            )
            .unwrap();
        let task = dispatch(&store, "w1");
        let failure = TaskFailure {
            error: "boom".into(),
            retryable: false,
            backoff: Duration::ZERO,
        };
        assert_eq!(store.fail(task.id, &lease("w1"), &failure).unwrap(), TaskState::Failed);

        let again = store
            .enqueue(NewTask::new("demo", json!({})).with_idempotency_key("k1"))
            .unwrap();
        assert!(again.is_created());
        assert_ne!(again.task_id(), task.id);
    }

    #[test]
    fn reserve_orders_by_priority_then_fifo() {
        let (store, clock) = store_with_clock();
        let low = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());
        clock.advance(chrono::Duration::milliseconds(1));
        let high = created(
            store
                .enqueue(NewTask::new("demo", json!({})).with_priority(5))
                .unwrap(),
        );
        let low_second = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());

        let claimed = store.reserve_batch(10, &lease("w1")).unwrap();
        let order: Vec<TaskId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high, low, low_second]);
        assert!(claimed.iter().all(|t| t.state == TaskState::Reserved));
        assert!(claimed.iter().all(|t| t.lease_holder.as_deref() == Some("w1")));
    }

    #[test]
    fn reserve_respects_limit_and_skips_claimed() {
        let (store, _) = store_with_clock();
        for _ in 0..3 {
            store.enqueue(NewTask::new("demo", json!({}))).unwrap();
        }
        assert_eq!(store.reserve_batch(2, &lease("w1")).unwrap().len(), 2);
        assert_eq!(store.reserve_batch(2, &lease("w2")).unwrap().len(), 1);
        assert!(store.reserve_batch(2, &lease("w3")).unwrap().is_empty());
        assert!(store.reserve_batch(0, &lease("w3")).unwrap().is_empty());
    }

    #[test]
    fn mark_in_progress_counts_attempt() {
        let (store, _) = store_with_clock();
        store.enqueue(NewTask::new("demo", json!({}))).unwrap();
        let task = dispatch(&store, "w1");
        assert_eq!(task.state, TaskState::InProgress);
        assert_eq!(task.attempt, 1);
        assert_eq!(task.started_at, Some(start()));
    }

    #[test]
    fn foreign_holder_cannot_touch_lease() {
        let (store, _) = store_with_clock();
        store.enqueue(NewTask::new("demo", json!({}))).unwrap();
        let task = dispatch(&store, "w1");

        let err = store.heartbeat(task.id, &lease("w2")).unwrap_err();
        assert!(err.is_lease_lost());
        let err = store.complete(task.id, &lease("w2"), &json!(null)).unwrap_err();
        assert!(err.is_lease_lost());
        assert_eq!(store.get(task.id).unwrap().unwrap().state, TaskState::InProgress);
    }

    #[test]
    fn complete_records_result_and_run() {
        let (store, clock) = store_with_clock();
        store.enqueue(NewTask::new("demo", json!({}))).unwrap();
        let task = dispatch(&store, "w1");
        clock.advance(chrono::Duration::seconds(2));
        store.complete(task.id, &lease("w1"), &json!({"result": 4})).unwrap();

        let done = store.get(task.id).unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result, Some(json!({"result": 4})));
        assert_eq!(done.lease_holder, None);

        let runs = store.runs_for(task.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
        assert_eq!(runs[0].attempt_number, 1);
        assert_eq!(runs[0].finished_at - runs[0].started_at, chrono::Duration::seconds(2));

        // a second completion is rejected
        assert!(store.complete(task.id, &lease("w1"), &json!({})).unwrap_err().is_lease_lost());
    }

    #[test]
    fn retryable_failure_schedules_retry_until_budget_runs_out() {
        let (store, clock) = store_with_clock();
        let id = created(
            store
                .enqueue(NewTask::new("demo", json!({})).with_max_attempts(2))
                .unwrap(),
        );
        let failure = TaskFailure {
            error: "timeout".into(),
            retryable: true,
            backoff: Duration::from_secs(10),
        };

        dispatch(&store, "w1");
        assert_eq!(
            store.fail(id, &lease("w1"), &failure).unwrap(),
            TaskState::RetryScheduled
        );
        let scheduled = store.get(id).unwrap().unwrap();
        assert_eq!(scheduled.next_attempt_at, Some(start() + chrono::Duration::seconds(10)));

        // not ready before the backoff elapses
        assert!(store.reserve_batch(1, &lease("w1")).unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(10));

        let second = dispatch(&store, "w1");
        assert_eq!(second.attempt, 2);
        assert_eq!(store.fail(id, &lease("w1"), &failure).unwrap(), TaskState::Failed);

        let failed = store.get(id).unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("timeout"));
        assert_eq!(store.runs_for(id).unwrap().len(), 2);
    }

    #[test]
    fn permanent_failure_is_terminal_immediately() {
        let (store, _) = store_with_clock();
        let id = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());
        dispatch(&store, "w1");
        let failure = TaskFailure {
            error: "bad payload".into(),
            retryable: false,
            backoff: Duration::from_secs(10),
        };
        assert_eq!(store.fail(id, &lease("w1"), &failure).unwrap(), TaskState::Failed);
        assert_eq!(store.get(id).unwrap().unwrap().next_attempt_at, None);
    }

    #[test]
    fn recover_stale_requeues_without_consuming_budget() {
        let (store, clock) = store_with_clock();
        let id = created(
            store
                .enqueue(NewTask::new("demo", json!({})).with_max_attempts(1))
                .unwrap(),
        );
        dispatch(&store, "crashed");

        // fresh heartbeat: nothing to recover
        assert!(store.recover_stale(Duration::from_secs(60)).unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.recover_stale(Duration::from_secs(60)).unwrap(), vec![id]);

        let requeued = store.get(id).unwrap().unwrap();
        assert_eq!(requeued.state, TaskState::Queued);
        assert_eq!(requeued.attempt, 1);
        assert_eq!(requeued.recoveries, 1);
        assert_eq!(requeued.lease_holder, None);

        let runs = store.runs_for(id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Abandoned);

        // the crashed worker's lease is gone
        assert!(store.heartbeat(id, &lease("crashed")).unwrap_err().is_lease_lost());

        // the recovered dispatch still has its one real attempt
        let again = dispatch(&store, "w2");
        assert_eq!(again.attempt, 2);
        assert_eq!(again.counted_attempts(), 1);
    }

    #[test]
    fn recover_stale_leaves_reserved_attempt_uncounted() {
        let (store, clock) = store_with_clock();
        let id = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());
        store.reserve_batch(1, &lease("w1")).unwrap();

        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(store.recover_stale(Duration::from_secs(60)).unwrap(), vec![id]);

        let task = store.get(id).unwrap().unwrap();
        assert_eq!((task.attempt, task.recoveries), (0, 0));

        let runs = store.runs_for(id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Abandoned);
        assert_eq!(runs[0].attempt_number, 0);
        assert!(runs[0].error_detail.as_deref().unwrap().contains("reserved"));
    }

    #[test]
    fn heartbeat_keeps_task_alive() {
        let (store, clock) = store_with_clock();
        let id = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());
        dispatch(&store, "w1");

        clock.advance(chrono::Duration::seconds(45));
        store.heartbeat(id, &lease("w1")).unwrap();
        clock.advance(chrono::Duration::seconds(45));

        assert!(store.recover_stale(Duration::from_secs(60)).unwrap().is_empty());
    }

    #[test]
    fn gc_removes_old_terminal_tasks_and_runs() {
        let (store, clock) = store_with_clock();
        let done = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());
        let task = dispatch(&store, "w1");
        assert_eq!(task.id, done);
        store.complete(done, &lease("w1"), &json!({})).unwrap();
        let pending = created(store.enqueue(NewTask::new("demo", json!({}))).unwrap());

        clock.advance(chrono::Duration::hours(2));
        let report = store.gc(Duration::from_secs(3600)).unwrap();
        assert_eq!((report.tasks, report.runs), (1, 1));
        assert!(store.get(done).unwrap().is_none());
        assert!(store.get(pending).unwrap().is_some());
    }

    #[test]
    fn counts_group_by_state() {
        let (store, _) = store_with_clock();
        for _ in 0..3 {
            store.enqueue(NewTask::new("demo", json!({}))).unwrap();
        }
        dispatch(&store, "w1");
        let counts = store.counts_by_state().unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.pending(), 3);
    }

    #[test]
    fn metrics_are_returned_newest_first_and_gc_by_age() {
        let (store, clock) = store_with_clock();
        for i in 0..3u64 {
            store
                .insert_metric(&MetricSample {
                    timestamp: clock.now(),
                    cpu_pct: 10.0,
                    mem_pct: 20.0,
                    op_count: i,
                    error_count: 0,
                    concurrency_limit: 4,
                    paused: false,
                })
                .unwrap();
            clock.advance(chrono::Duration::days(1));
        }

        let recent = store.recent_metrics(2).unwrap();
        assert_eq!(recent.iter().map(|m| m.op_count).collect::<Vec<_>>(), vec![2, 1]);

        assert_eq!(store.gc_metrics(Duration::from_secs(2 * 86_400)).unwrap(), 1);
        assert_eq!(store.recent_metrics(10).unwrap().len(), 2);
    }

    #[test]
    fn sessions_are_tracked() {
        let (store, _) = store_with_clock();
        let id = store.start_session().unwrap();
        store
            .finish_session(id, SessionStatus::Stopped, &json!({"completed": 3}))
            .unwrap();

        let sessions = store.recent_sessions(5).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].status, SessionStatus::Stopped);
        assert_eq!(sessions[0].stats, Some(json!({"completed": 3})));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/tasks.db");
        let id = {
            let store = SqliteTaskStore::open(&path, 3).unwrap();
            created(store.enqueue(NewTask::new("demo", json!({"value": 7}))).unwrap())
        };

        let reopened = SqliteTaskStore::open(&path, 3).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), current_schema_version());
        let task = reopened.get(id).unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.payload, json!({"value": 7}));
    }

    #[test]
    fn two_connections_never_claim_the_same_task() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let a = Arc::new(SqliteTaskStore::open(&path, 3).unwrap());
        let b = Arc::new(SqliteTaskStore::open(&path, 3).unwrap());
        for _ in 0..40 {
            a.enqueue(NewTask::new("demo", json!({}))).unwrap();
        }

        let claim = |store: Arc<SqliteTaskStore>, holder: &'static str| {
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                loop {
                    let batch = store.reserve_batch(3, &lease(holder)).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|t| t.id));
                }
                ids
            })
        };
        let left = claim(a, "a");
        let right = claim(b, "b");
        let mut all = left.join().unwrap();
        all.extend(right.join().unwrap());

        let unique: std::collections::HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }
}
