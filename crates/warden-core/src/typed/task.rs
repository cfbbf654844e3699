//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Associated Types (`type Output`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     path: String,
///     width: u32,
/// }
///
/// impl Task for Resize {
///     const TYPE: &'static str = "images.resize.v1";
///     type Output = serde_json::Value;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に payload (JSON) へ変換するため
/// - `DeserializeOwned`: 保存済み payload から復元するため
/// - `Send + Sync + 'static`: worker task / blocking pool へ move するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}` を推奨
    /// - 単純な名前（`demo`）でも構わない
    const TYPE: &'static str;

    /// Handler が成功時に返す値。`result` カラムに JSON で保存されます。
    type Output: Serialize + Send + 'static;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::Task;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Double {
        pub value: i64,
    }

    impl Task for Double {
        const TYPE: &'static str = "test.double.v1";
        type Output = i64;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Checksum {
        pub data: String,
    }

    impl Task for Checksum {
        const TYPE: &'static str = "test.checksum.v1";
        type Output = u64;
    }
}
