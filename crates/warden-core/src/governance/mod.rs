//! Governance - テレメトリ駆動の閉ループ制御
//!
//! # 学習ポイント
//! - 判定（`Governor`）は純粋関数。時刻もサンプルから取るのでテストが決定的
//! - 副作用（probe、store、ログ、通知）は `GovernanceLoop` 側に寄せる
//! - executor と共有するのは `ExecutorControl`（limit と paused）だけ

mod controller;
mod escalation;
mod policy;
mod probe;

pub use self::controller::GovernanceLoop;
pub use self::escalation::LogEscalationSink;
pub use self::policy::{GovernanceAction, Governor, GovernorConfig, PauseReason, WindowStats};
pub use self::probe::{ScriptedProbe, SysinfoProbe};
