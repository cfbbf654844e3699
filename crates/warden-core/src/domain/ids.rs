//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type で型付けしています。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 生成順序でソートできる（FIFO の tie-break に使う）
//! - **分散生成可能**: 複数の executor インスタンスが調整なしで生成できる
//!
//! 永続化では `Display` の文字列（`task-01H...`）をそのまま保存し、
//! `FromStr` で読み戻します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "task-", "run-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData なので実行時のサイズは ULID と同じ 16 bytes です。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id stamped with the current wall-clock time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {expected}id '{raw}'")]
pub struct ParseIdError {
    expected: &'static str,
    raw: String,
}

/// Accepts both the prefixed form (`task-01H...`) and a bare ULID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(body)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                expected: T::prefix(),
                raw: s.to_string(),
            })
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn prefix() -> &'static str {
        "session-"
    }
}

/// Identifier of a Task (the persisted unit of work).
pub type TaskId = Id<Task>;

/// Identifier of a Run (one execution attempt of a Task).
pub type RunId = Id<Run>;

/// Identifier of a Session (one `resume` lifetime of the engine).
pub type SessionId = Id<Session>;
