//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（SQLite、ホスト OS、通知先）へのインターフェースです。
//! Engine はこれらを `Arc<dyn ...>` / `Box<dyn ...>` で受け取り、実装を差し替え可能にします。

pub mod clock;
pub mod escalation;
pub mod probe;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::escalation::{EscalationError, EscalationPayload, EscalationSink};
pub use self::probe::{ProbeError, SystemProbe, SystemReading};
pub use self::task_store::{GcReport, Lease, StoreResult, TaskFailure, TaskStore};
