//! Built-in demo handlers.
//!
//! - `demo`: echoes `value` back as `result`
//! - `demo.checksum`: CPU-bound FNV-1a over `data`, repeated `rounds` times
//! - `demo.fail`: fails the way the payload asks (`"transient"` / `"permanent"`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::EngineBuilder;
use warden_core::domain::HandlerError;
use warden_core::typed::{BlockingHandler, Handler, RegistryError, Task};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demo {
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemoOutput {
    pub result: Value,
}

impl Task for Demo {
    const TYPE: &'static str = "demo";
    type Output = DemoOutput;
}

pub struct DemoHandler;

#[async_trait]
impl Handler<Demo> for DemoHandler {
    async fn handle(&self, task: Demo) -> Result<DemoOutput, HandlerError> {
        Ok(DemoOutput { result: task.value })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checksum {
    pub data: String,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 {
    1
}

impl Task for Checksum {
    const TYPE: &'static str = "demo.checksum";
    type Output = String;
}

pub struct ChecksumHandler;

impl BlockingHandler<Checksum> for ChecksumHandler {
    fn handle(&self, task: Checksum) -> Result<String, HandlerError> {
        if task.rounds == 0 {
            return Err(HandlerError::permanent("rounds must be at least 1"));
        }
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for _ in 0..task.rounds {
            for byte in task.data.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
        }
        Ok(format!("{hash:016x}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub kind: FailKind,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailKind {
    Transient,
    Permanent,
}

impl Task for Fail {
    const TYPE: &'static str = "demo.fail";
    type Output = ();
}

pub struct FailHandler;

#[async_trait]
impl Handler<Fail> for FailHandler {
    async fn handle(&self, task: Fail) -> Result<(), HandlerError> {
        let message = task.message.unwrap_or_else(|| "requested failure".to_string());
        Err(match task.kind {
            FailKind::Transient => HandlerError::transient(message),
            FailKind::Permanent => HandlerError::permanent(message),
        })
    }
}

pub fn register(builder: EngineBuilder) -> Result<EngineBuilder, RegistryError> {
    Ok(builder
        .register::<Demo, _>(DemoHandler)?
        .register_blocking::<Checksum, _>(ChecksumHandler)?
        .register::<Fail, _>(FailHandler)?
        .expect_tasks(&[Demo::TYPE, Checksum::TYPE, Fail::TYPE]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn demo_echoes_value_as_result() {
        let output = DemoHandler.handle(Demo { value: json!(42) }).await.unwrap();
        assert_eq!(serde_json::to_value(output).unwrap(), json!({"result": 42}));
    }

    #[test]
    fn checksum_is_stable_and_round_sensitive() {
        let one = ChecksumHandler
            .handle(Checksum { data: "warden".into(), rounds: 1 })
            .unwrap();
        let again = ChecksumHandler
            .handle(Checksum { data: "warden".into(), rounds: 1 })
            .unwrap();
        let two = ChecksumHandler
            .handle(Checksum { data: "warden".into(), rounds: 2 })
            .unwrap();
        assert_eq!(one, again);
        assert_ne!(one, two);
        assert_eq!(one.len(), 16);
    }

    #[tokio::test]
    async fn fail_handler_classifies_as_asked() {
        let transient = FailHandler
            .handle(Fail { kind: FailKind::Transient, message: None })
            .await
            .unwrap_err();
        assert!(transient.is_retryable());

        let permanent = FailHandler
            .handle(Fail { kind: FailKind::Permanent, message: Some("bad input".into()) })
            .await
            .unwrap_err();
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.message(), "bad input");
    }
}
