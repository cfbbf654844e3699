//! HandlerRegistry - Handler の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権（dispatch ごとに clone して worker へ渡す）

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::handler::{
    BlockingFnHandler, BlockingHandler, DynBlockingHandler, DynHandler, FnHandler, Handler,
    TypedBlockingHandler, TypedHandler,
};
use super::task::Task;
use crate::domain::HandlerError;

/// 登録済み handler と、その実行場所
#[derive(Clone)]
pub enum HandlerEntry {
    /// tokio の worker 上で await する
    Async(Arc<dyn DynHandler>),
    /// CPU プール（`spawn_blocking` + semaphore）で実行する
    Blocking(Arc<dyn DynBlockingHandler>),
}

impl HandlerEntry {
    pub fn is_blocking(&self) -> bool {
        matches!(self, HandlerEntry::Blocking(_))
    }
}

/// HandlerRegistry は task_type → handler の対応表
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<Resize, _>(ResizeHandler)?;
/// registry.register_blocking::<Checksum, _>(ChecksumHandler)?;
/// registry.register_fn("echo", |payload| async move { Ok(payload) })?;
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let entry = HandlerEntry::Async(Arc::new(TypedHandler::<T, H>::new(handler)));
        self.insert(T::TYPE, entry)
    }

    pub fn register_blocking<T: Task, H: BlockingHandler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let entry = HandlerEntry::Blocking(Arc::new(TypedBlockingHandler::<T, H>::new(handler)));
        self.insert(T::TYPE, entry)
    }

    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<String>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let task_type = task_type.into();
        let entry = HandlerEntry::Async(Arc::new(FnHandler::new(task_type.clone(), func)));
        self.insert(&task_type, entry)
    }

    pub fn register_blocking_fn<F>(
        &mut self,
        task_type: impl Into<String>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        let entry = HandlerEntry::Blocking(Arc::new(BlockingFnHandler::new(task_type.clone(), func)));
        self.insert(&task_type, entry)
    }

    pub fn get(&self, task_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Sorted, so log lines and error messages are stable.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn insert(&mut self, task_type: &str, entry: HandlerEntry) -> Result<(), RegistryError> {
        if self.handlers.contains_key(task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type.to_string()));
        }
        self.handlers.insert(task_type.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::task::fixtures::{Checksum, Double};
    use async_trait::async_trait;

    struct DoubleHandler;

    #[async_trait]
    impl Handler<Double> for DoubleHandler {
        async fn handle(&self, task: Double) -> Result<i64, HandlerError> {
            Ok(task.value * 2)
        }
    }

    struct ChecksumHandler;

    impl BlockingHandler<Checksum> for ChecksumHandler {
        fn handle(&self, task: Checksum) -> Result<u64, HandlerError> {
            Ok(task.data.len() as u64)
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Double, _>(DoubleHandler).unwrap();

        let entry = registry.get(Double::TYPE).unwrap();
        assert!(!entry.is_blocking());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Double, _>(DoubleHandler).unwrap();
        let result = registry.register::<Double, _>(DoubleHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == Double::TYPE));

        let result = registry.register_fn(Double::TYPE, |p| async move { Ok(p) });
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn blocking_entries_are_marked() {
        let mut registry = HandlerRegistry::new();
        registry.register_blocking::<Checksum, _>(ChecksumHandler).unwrap();
        registry
            .register_blocking_fn("sum", |p| Ok(serde_json::json!(p.as_array().map_or(0, Vec::len))))
            .unwrap();

        assert!(registry.get(Checksum::TYPE).unwrap().is_blocking());
        assert!(registry.get("sum").unwrap().is_blocking());
    }

    #[test]
    fn registered_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("zeta", |p| async move { Ok(p) }).unwrap();
        registry.register::<Double, _>(DoubleHandler).unwrap();
        registry.register_fn("alpha", |p| async move { Ok(p) }).unwrap();

        assert_eq!(
            registry.registered_types(),
            vec!["alpha".to_string(), Double::TYPE.to_string(), "zeta".to_string()]
        );
        assert_eq!(registry.len(), 3);
    }
}
