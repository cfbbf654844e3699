//! Config - YAML + 環境変数による設定
//!
//! # 学習ポイント
//! - `#[serde(default)]` で「書いたところだけ上書き」の設定ファイル
//! - `WARDEN_<SECTION>_<KEY>` の環境変数で個別に上書き
//! - `validate()` はループ起動前に呼ぶ（fail-fast）
//!
//! ```yaml
//! bulk:
//!   max_concurrent: 4
//! governance:
//!   pause_after_error_burst:
//!     threshold: 10
//!     duration_s: 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{ExecutorSettings, RetryPolicy};
use crate::governance::GovernorConfig;

pub const DEFAULT_CONFIG_FILE: &str = "warden.yml";
pub const ENV_PREFIX: &str = "WARDEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
    pub bulk: BulkConfig,
    pub governance: GovernanceConfig,
    pub telemetry: TelemetryConfig,
    pub persistence: PersistenceConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkConfig {
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    pub lease_timeout_s: u64,
    pub heartbeat_interval_s: u64,
    pub drain_timeout_s: u64,
    pub poll_interval_ms: u64,
    pub cpu_workers: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retry_attempts: 3,
            retry_delay_seconds: 5,
            retry_max_delay_seconds: 300,
            lease_timeout_s: 60,
            heartbeat_interval_s: 15,
            drain_timeout_s: 30,
            poll_interval_ms: 500,
            cpu_workers: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    pub window_s: u64,
    pub pause_after_error_burst: PauseAfterErrorBurst,
    pub human_review_after_pause_bursts: usize,
    /// Rolling window for counting pause events.
    pub pause_burst_window_s: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            cpu_high_pct: 85.0,
            mem_high_pct: 90.0,
            window_s: 30,
            pause_after_error_burst: PauseAfterErrorBurst::default(),
            human_review_after_pause_bursts: 3,
            pause_burst_window_s: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PauseAfterErrorBurst {
    pub threshold: u64,
    pub duration_s: u64,
}

impl Default for PauseAfterErrorBurst {
    fn default() -> Self {
        Self {
            threshold: 10,
            duration_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub sample_interval_s: u64,
    pub log_interval_s: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_interval_s: 5,
            log_interval_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    pub db_path: PathBuf,
    pub gc_completed_after_days: u64,
    pub metrics_retention_days: u64,
    /// How often the reaper and GC loops run.
    pub maintenance_interval_s: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/warden.db"),
            gc_completed_after_days: 7,
            metrics_retention_days: 7,
            maintenance_interval_s: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub email_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub level: String,
    pub json_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
            json_stderr: false,
        }
    }
}

impl WardenConfig {
    /// Load from `path` (or `warden.yml` if present), apply environment
    /// overrides, then validate.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_with(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Apply `WARDEN_<SECTION>_<KEY>` overrides read through `lookup`.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        macro_rules! env_override {
            ($key:literal => $field:expr) => {
                let var = format!("{ENV_PREFIX}_{}", $key);
                if let Some(raw) = lookup(&var) {
                    $field = EnvValue::parse_env(raw.trim()).ok_or(ConfigError::InvalidEnv {
                        var,
                        value: raw.clone(),
                    })?;
                }
            };
        }

        env_override!("BULK_MAX_CONCURRENT" => self.bulk.max_concurrent);
        env_override!("BULK_RETRY_ATTEMPTS" => self.bulk.retry_attempts);
        env_override!("BULK_RETRY_DELAY_SECONDS" => self.bulk.retry_delay_seconds);
        env_override!("BULK_RETRY_MAX_DELAY_SECONDS" => self.bulk.retry_max_delay_seconds);
        env_override!("BULK_LEASE_TIMEOUT_S" => self.bulk.lease_timeout_s);
        env_override!("BULK_HEARTBEAT_INTERVAL_S" => self.bulk.heartbeat_interval_s);
        env_override!("BULK_DRAIN_TIMEOUT_S" => self.bulk.drain_timeout_s);
        env_override!("BULK_POLL_INTERVAL_MS" => self.bulk.poll_interval_ms);
        env_override!("BULK_CPU_WORKERS" => self.bulk.cpu_workers);
        env_override!("GOVERNANCE_CPU_HIGH_PCT" => self.governance.cpu_high_pct);
        env_override!("GOVERNANCE_MEM_HIGH_PCT" => self.governance.mem_high_pct);
        env_override!("GOVERNANCE_WINDOW_S" => self.governance.window_s);
        env_override!("GOVERNANCE_PAUSE_AFTER_ERROR_BURST_THRESHOLD"
            => self.governance.pause_after_error_burst.threshold);
        env_override!("GOVERNANCE_PAUSE_AFTER_ERROR_BURST_DURATION_S"
            => self.governance.pause_after_error_burst.duration_s);
        env_override!("GOVERNANCE_HUMAN_REVIEW_AFTER_PAUSE_BURSTS"
            => self.governance.human_review_after_pause_bursts);
        env_override!("GOVERNANCE_PAUSE_BURST_WINDOW_S" => self.governance.pause_burst_window_s);
        env_override!("TELEMETRY_SAMPLE_INTERVAL_S" => self.telemetry.sample_interval_s);
        env_override!("TELEMETRY_LOG_INTERVAL_S" => self.telemetry.log_interval_s);
        env_override!("PERSISTENCE_DB_PATH" => self.persistence.db_path);
        env_override!("PERSISTENCE_GC_COMPLETED_AFTER_DAYS"
            => self.persistence.gc_completed_after_days);
        env_override!("PERSISTENCE_METRICS_RETENTION_DAYS"
            => self.persistence.metrics_retention_days);
        env_override!("PERSISTENCE_MAINTENANCE_INTERVAL_S"
            => self.persistence.maintenance_interval_s);
        env_override!("ESCALATION_ENABLED" => self.escalation.enabled);
        env_override!("ESCALATION_WEBHOOK_URL" => self.escalation.webhook_url);
        env_override!("ESCALATION_EMAIL_TO" => self.escalation.email_to);
        env_override!("LOGGING_DIR" => self.logging.dir);
        env_override!("LOGGING_LEVEL" => self.logging.level);
        env_override!("LOGGING_JSON_STDERR" => self.logging.json_stderr);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bulk = &self.bulk;
        let gov = &self.governance;
        let telemetry = &self.telemetry;

        ensure(bulk.max_concurrent >= 1, "bulk.max_concurrent must be at least 1")?;
        ensure(bulk.retry_attempts >= 1, "bulk.retry_attempts must be at least 1")?;
        ensure(bulk.cpu_workers >= 1, "bulk.cpu_workers must be at least 1")?;
        ensure(bulk.poll_interval_ms >= 1, "bulk.poll_interval_ms must be at least 1")?;
        ensure(
            bulk.retry_max_delay_seconds >= bulk.retry_delay_seconds,
            "bulk.retry_max_delay_seconds must not be below bulk.retry_delay_seconds",
        )?;
        ensure(bulk.heartbeat_interval_s >= 1, "bulk.heartbeat_interval_s must be at least 1")?;
        ensure(
            bulk.heartbeat_interval_s.saturating_mul(2) <= bulk.lease_timeout_s,
            "bulk.heartbeat_interval_s must be at most half of bulk.lease_timeout_s",
        )?;
        ensure(
            is_percentage(gov.cpu_high_pct),
            "governance.cpu_high_pct must be in (0, 100]",
        )?;
        ensure(
            is_percentage(gov.mem_high_pct),
            "governance.mem_high_pct must be in (0, 100]",
        )?;
        ensure(
            telemetry.sample_interval_s >= 1,
            "telemetry.sample_interval_s must be at least 1",
        )?;
        ensure(
            gov.window_s >= telemetry.sample_interval_s,
            "governance.window_s must not be shorter than telemetry.sample_interval_s",
        )?;
        ensure(
            gov.pause_after_error_burst.threshold >= 1,
            "governance.pause_after_error_burst.threshold must be at least 1",
        )?;
        ensure(
            gov.human_review_after_pause_bursts >= 1,
            "governance.human_review_after_pause_bursts must be at least 1",
        )?;
        ensure(
            self.persistence.maintenance_interval_s >= 1,
            "persistence.maintenance_interval_s must be at least 1",
        )?;
        if self.escalation.enabled {
            ensure(
                self.escalation.webhook_url.is_some() || self.escalation.email_to.is_some(),
                "escalation.enabled requires escalation.webhook_url or escalation.email_to",
            )?;
        }
        Ok(())
    }

    pub fn governor_config(&self) -> GovernorConfig {
        let gov = &self.governance;
        GovernorConfig {
            cpu_high_pct: gov.cpu_high_pct,
            mem_high_pct: gov.mem_high_pct,
            window: Duration::from_secs(gov.window_s),
            error_burst_threshold: gov.pause_after_error_burst.threshold,
            pause_duration: Duration::from_secs(gov.pause_after_error_burst.duration_s),
            pause_bursts_before_escalation: gov.human_review_after_pause_bursts,
            pause_burst_window: Duration::from_secs(gov.pause_burst_window_s),
            max_limit: self.bulk.max_concurrent,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.bulk.retry_delay_seconds),
            Duration::from_secs(self.bulk.retry_max_delay_seconds),
        )
    }

    pub fn executor_settings(&self, worker_id: String) -> ExecutorSettings {
        ExecutorSettings {
            worker_id,
            lease_timeout: self.lease_timeout(),
            heartbeat_interval: Duration::from_secs(self.bulk.heartbeat_interval_s),
            poll_interval: Duration::from_millis(self.bulk.poll_interval_ms),
            drain_timeout: Duration::from_secs(self.bulk.drain_timeout_s),
            cpu_workers: self.bulk.cpu_workers,
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk.lease_timeout_s)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.sample_interval_s)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.log_interval_s)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.persistence.maintenance_interval_s)
    }

    pub fn gc_completed_after(&self) -> Duration {
        days(self.persistence.gc_completed_after_days)
    }

    pub fn metrics_retention(&self) -> Duration {
        days(self.persistence.metrics_retention_days)
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}

fn is_percentage(value: f64) -> bool {
    value > 0.0 && value <= 100.0
}

fn ensure(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.to_string()))
    }
}

/// Parsing rules for environment overrides.
trait EnvValue: Sized {
    fn parse_env(raw: &str) -> Option<Self>;
}

macro_rules! env_value_from_str {
    ($($ty:ty),*) => {
        $(impl EnvValue for $ty {
            fn parse_env(raw: &str) -> Option<Self> {
                raw.parse().ok()
            }
        })*
    };
}

env_value_from_str!(u32, u64, usize, f64);

impl EnvValue for bool {
    fn parse_env(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl EnvValue for String {
    fn parse_env(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl EnvValue for PathBuf {
    fn parse_env(raw: &str) -> Option<Self> {
        (!raw.is_empty()).then(|| PathBuf::from(raw))
    }
}

/// Empty clears the value.
impl EnvValue for Option<String> {
    fn parse_env(raw: &str) -> Option<Self> {
        Some((!raw.is_empty()).then(|| raw.to_string()))
    }
}
