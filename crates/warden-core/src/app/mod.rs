//! App - アプリケーション層
//!
//! このモジュールは、ports と各コンポーネントを組み合わせて Engine を組み立てます。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: Engine の構築とワイヤリング（起動時検証つき）
//! - **Engine**: enqueue / run / stats / inspect の表面
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **GcLoop**: 終端タスクと古いメトリクスの削除
//! - **status**: `stats` / `inspect` のビュー

pub mod builder;
pub mod engine;
pub mod gc_loop;
pub mod reaper_loop;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::{Engine, SessionSummary};
pub use self::gc_loop::GcLoop;
pub use self::reaper_loop::ReaperLoop;
pub use self::status::{StatsView, TaskView};
