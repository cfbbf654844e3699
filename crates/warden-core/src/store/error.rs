use crate::domain::TaskId;

/// Persistence failure. Isolated per call: callers treat it as transient.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The lease was reclaimed (or the task finished) behind the caller's back.
    #[error("lease on {task_id} is no longer held by '{holder}'")]
    LeaseLost { task_id: TaskId, holder: String },

    #[error("blocking store call did not finish: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("sqlite connection lock poisoned")]
    LockPoisoned,

    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl StoreError {
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StoreError::LeaseLost { .. })
    }

    /// Lock contention between processes (`SQLITE_BUSY` / `SQLITE_LOCKED`).
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32) -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(ffi::Error::new(code), None))
    }

    #[test]
    fn busy_and_locked_are_contention() {
        assert!(sqlite_failure(ffi::SQLITE_BUSY).is_busy());
        assert!(sqlite_failure(ffi::SQLITE_LOCKED).is_busy());
    }

    #[test]
    fn other_failures_are_not_contention() {
        assert!(!sqlite_failure(ffi::SQLITE_CORRUPT).is_busy());
        assert!(!StoreError::LockPoisoned.is_busy());
        let lost = StoreError::LeaseLost {
            task_id: TaskId::generate(),
            holder: "w1".into(),
        };
        assert!(lost.is_lease_lost());
        assert!(!lost.is_busy());
    }
}
