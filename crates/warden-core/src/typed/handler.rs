//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`, `BlockingHandler<T>`)
//! - Object-safe trait (`DynHandler`, `DynBlockingHandler`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `DynHandler`)
//!
//! Async handler は I/O 待ちの仕事向けで、tokio の worker 上で走ります。
//! Blocking handler は CPU を占有する仕事向けで、executor が専用の
//! CPU プールへ回します（async 側のスケジューラを止めないため）。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::task::Task;
use crate::domain::HandlerError;

/// Handler は Task を実行して結果を返す
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<Resize> for ResizeHandler {
///     async fn handle(&self, task: Resize) -> Result<Value, HandlerError> {
///         fetch(&task.path).await.map_err(|e| HandlerError::transient(e.to_string()))?;
///         Ok(json!({"ok": true}))
///     }
/// }
/// ```
///
/// # エラー分類
/// - `HandlerError::transient`: バックオフ後に再試行（予算内なら）
/// - `HandlerError::permanent`: 即座に `failed`
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

/// CPU-bound handler, run on the blocking pool.
pub trait BlockingHandler<T: Task>: Send + Sync {
    fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, HandlerEntry>` に格納するため、payload と結果は
/// どちらも `serde_json::Value` で受け渡します。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError>;
    fn task_type(&self) -> &str;
}

pub trait DynBlockingHandler: Send + Sync {
    fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError>;
    fn task_type(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError> {
        let task: T = decode::<T>(payload)?;
        let output = self.handler.handle(task).await?;
        encode::<T>(output)
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

pub struct TypedBlockingHandler<T: Task, H: BlockingHandler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: BlockingHandler<T>> TypedBlockingHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<T: Task, H: BlockingHandler<T>> DynBlockingHandler for TypedBlockingHandler<T, H> {
    fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError> {
        let task: T = decode::<T>(payload)?;
        let output = self.handler.handle(task)?;
        encode::<T>(output)
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }
}

/// Closure handler for string-named task types with raw JSON payloads.
pub struct FnHandler<F> {
    task_type: String,
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(task_type: impl Into<String>, func: F) -> Self {
        Self {
            task_type: task_type.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError> {
        (self.func)(payload).await
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// Blocking counterpart of [`FnHandler`].
pub struct BlockingFnHandler<F> {
    task_type: String,
    func: F,
}

impl<F> BlockingFnHandler<F> {
    pub fn new(task_type: impl Into<String>, func: F) -> Self {
        Self {
            task_type: task_type.into(),
            func,
        }
    }
}

impl<F> DynBlockingHandler for BlockingFnHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn handle_dyn(&self, payload: Value) -> Result<Value, HandlerError> {
        (self.func)(payload)
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }
}

// A payload that doesn't decode will never decode: permanent.
fn decode<T: Task>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload)
        .map_err(|e| HandlerError::permanent(format!("invalid payload for {}: {e}", T::TYPE)))
}

fn encode<T: Task>(output: T::Output) -> Result<Value, HandlerError> {
    serde_json::to_value(output)
        .map_err(|e| HandlerError::permanent(format!("unserializable result for {}: {e}", T::TYPE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use crate::typed::task::fixtures::{Checksum, Double};
    use serde_json::json;

    struct DoubleHandler;

    #[async_trait]
    impl Handler<Double> for DoubleHandler {
        async fn handle(&self, task: Double) -> Result<i64, HandlerError> {
            if task.value < 0 {
                return Err(HandlerError::permanent("negative"));
            }
            Ok(task.value * 2)
        }
    }

    struct ChecksumHandler;

    impl BlockingHandler<Checksum> for ChecksumHandler {
        fn handle(&self, task: Checksum) -> Result<u64, HandlerError> {
            Ok(task.data.bytes().map(u64::from).sum())
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_encodes() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        assert_eq!(handler.handle_dyn(json!({"value": 21})).await.unwrap(), json!(42));
        assert_eq!(handler.task_type(), Double::TYPE);
    }

    #[tokio::test]
    async fn bad_payload_is_permanent() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let err = handler.handle_dyn(json!({"value": "x"})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.message().contains(Double::TYPE));
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let handler = TypedHandler::<Double, _>::new(DoubleHandler);
        let err = handler.handle_dyn(json!({"value": -1})).await.unwrap_err();
        assert_eq!(err, HandlerError::permanent("negative"));
    }

    #[test]
    fn blocking_handler_runs_inline() {
        let handler = TypedBlockingHandler::<Checksum, _>::new(ChecksumHandler);
        assert_eq!(handler.handle_dyn(json!({"data": "ab"})).unwrap(), json!(195));
    }

    #[tokio::test]
    async fn fn_handler_wraps_closure() {
        let handler = FnHandler::new("echo", |payload: Value| async move { Ok::<_, HandlerError>(payload) });
        assert_eq!(handler.task_type(), "echo");
        assert_eq!(handler.handle_dyn(json!([1, 2])).await.unwrap(), json!([1, 2]));
    }
}
