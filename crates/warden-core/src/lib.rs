//! warden-core
//!
//! Durable, self-governing task engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, run, metric, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, SystemProbe, EscalationSink）
//! - **store**: SQLite による TaskStore 実装
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **executor**: 同時実行数つきのディスパッチループ、リトライ、heartbeat
//! - **governance**: テレメトリ駆動の throttle / pause / escalation
//! - **app**: EngineBuilder, Engine, 保守ループ
//! - **config**: YAML + 環境変数の設定

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod governance;
pub mod ports;
pub mod store;
pub mod typed;

pub use self::app::{Engine, EngineBuilder, SessionSummary, StatsView, TaskView};
pub use self::config::{ConfigError, WardenConfig};
pub use self::error::EngineError;
