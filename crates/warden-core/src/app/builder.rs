//! EngineBuilder - Engine の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定の validate と期待 task_type の登録チェック
//! - ports の差し替え（store / clock / probe / escalation sink）はテスト用の入口

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::engine::Engine;
use crate::config::WardenConfig;
use crate::domain::HandlerError;
use crate::error::EngineError;
use crate::executor::ExecutorSettings;
use crate::governance::{LogEscalationSink, SysinfoProbe};
use crate::ports::{Clock, EscalationSink, SystemClock, SystemProbe, TaskStore};
use crate::store::SqliteTaskStore;
use crate::typed::{BlockingHandler, Handler, HandlerRegistry, RegistryError, Task};

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .register::<Resize, _>(ResizeHandler)?
///     .register_fn("demo", |payload| async move { Ok(payload) })?
///     .expect_tasks(&[Resize::TYPE, "demo"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - build() で `WardenConfig::validate()` を通す
/// - expect_tasks() の集合がすべて登録済みかをチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    config: WardenConfig,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Box<dyn SystemProbe>>,
    sink: Option<Arc<dyn EscalationSink>>,
    worker_id: Option<String>,
}

/// BuildError は Engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl EngineBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            store: None,
            clock: None,
            probe: None,
            sink: None,
            worker_id: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// CPU-bound な Handler を登録（blocking プールで実行される）
    pub fn register_blocking<T: Task, H: BlockingHandler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_blocking::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(
        mut self,
        task_type: impl Into<String>,
        func: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.registry.register_fn(task_type, func)?;
        Ok(self)
    }

    pub fn register_blocking_fn<F>(
        mut self,
        task_type: impl Into<String>,
        func: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.registry.register_blocking_fn(task_type, func)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// 既存の store を使う（未指定なら `persistence.db_path` を開く）
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_escalation_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// EngineBuilder を構築して Engine を生成
    ///
    /// # 検証
    /// - 設定値（`ConfigError`）
    /// - expect_tasks() で設定された task_type が全て登録されているか（`BuildError`）
    /// - store を開けるか（`StoreError`）
    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|task_type| !self.registry.contains(task_type))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks).into());
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteTaskStore::open_with_clock(
                &self.config.persistence.db_path,
                self.config.bulk.retry_attempts,
                Arc::clone(&clock),
            )?),
        };
        let probe = self
            .probe
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()));
        let sink = self.sink.or_else(|| {
            let escalation = &self.config.escalation;
            escalation.enabled.then(|| {
                Arc::new(LogEscalationSink::new(
                    escalation.webhook_url.clone(),
                    escalation.email_to.clone(),
                )) as Arc<dyn EscalationSink>
            })
        });
        let worker_id = self
            .worker_id
            .unwrap_or_else(ExecutorSettings::generate_worker_id);

        Ok(Engine::new(
            self.config,
            store,
            Arc::new(self.registry),
            clock,
            probe,
            sink,
            worker_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::ScriptedProbe;
    use crate::ports::FixedClock;
    use chrono::Utc;

    fn builder() -> EngineBuilder {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let store = SqliteTaskStore::open_in_memory(3, Arc::clone(&clock)).unwrap();
        EngineBuilder::new(WardenConfig::default())
            .with_store(Arc::new(store))
            .with_clock(clock)
            .with_probe(Box::new(ScriptedProbe::steady(10.0, 10.0)))
    }

    #[test]
    fn test_build_success() {
        let engine = builder()
            .register_fn("demo", |payload| async move { Ok(payload) })
            .unwrap()
            .expect_tasks(&["demo"])
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let engine = builder()
            .register_fn("demo", |payload| async move { Ok(payload) })
            .unwrap()
            .expect_tasks(&["demo", "resize"])
            .build();
        assert!(matches!(
            engine,
            Err(EngineError::Build(BuildError::MissingTaskTypes(missing))) if missing == vec!["resize".to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = WardenConfig::default();
        config.bulk.max_concurrent = 0;
        let engine = EngineBuilder::new(config).build();
        assert!(matches!(engine, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_duplicate_registration() {
        let result = builder()
            .register_fn("demo", |payload| async move { Ok(payload) })
            .unwrap()
            .register_blocking_fn("demo", Ok);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == "demo"));
    }

    #[test]
    fn test_build_opens_configured_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WardenConfig::default();
        config.persistence.db_path = dir.path().join("nested").join("warden.db");
        let engine = EngineBuilder::new(config)
            .with_probe(Box::new(ScriptedProbe::steady(10.0, 10.0)))
            .build()
            .unwrap();
        assert!(engine.worker_id().starts_with("warden-"));
        assert!(dir.path().join("nested").join("warden.db").exists());
    }
}
