//! Typed - 型付き Task API
//!
//! このモジュールは task_type の typo を型で排除し、
//! Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` / `BlockingHandler<T>` - 型安全
//! - **内部（Dyn）**: `DynHandler` / `DynBlockingHandler` - object-safe, type erasure

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{
    BlockingFnHandler, BlockingHandler, DynBlockingHandler, DynHandler, FnHandler, Handler,
    TypedBlockingHandler, TypedHandler,
};
pub use self::registry::{HandlerEntry, HandlerRegistry, RegistryError};
pub use self::task::Task;
