//! SQLite-backed task store.
//!
//! `TaskStore` は同期 API なので、async 側からは [`call`] で
//! blocking スレッドに逃がしてから呼びます。

mod error;
pub mod migrations;
mod sqlite;

use std::sync::Arc;

pub use self::error::StoreError;
pub use self::migrations::{SqliteMigration, current_schema_version, migrations};
pub use self::sqlite::SqliteTaskStore;

use crate::ports::{StoreResult, TaskStore};

/// Run one store operation on the blocking pool.
pub async fn call<T, F>(store: &Arc<dyn TaskStore>, operation: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn TaskStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(store.as_ref())).await?
}
