//! Domain model (ids, tasks, runs, metric samples, handler errors).

pub mod errors;
pub mod ids;
pub mod metric;
pub mod run;
pub mod task;

pub use self::errors::{ErrorKind, HandlerError};
pub use self::ids::{RunId, SessionId, TaskId};
pub use self::metric::MetricSample;
pub use self::run::{RunOutcome, RunRecord, SessionRecord, SessionStatus};
pub use self::task::{Enqueued, NewTask, QueueCounts, TaskRecord, TaskState, TaskType};
