//! Structured logging: two append-only JSON Lines files plus stderr.
//!
//! - `<dir>/warden.jsonl`: lifecycle and governance events
//! - `<dir>/metrics.jsonl`: events with target `warden::metrics`
//!
//! Each line is `{timestamp, level, event, ...fields}` (fields flattened).

use anyhow::Context;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use warden_core::config::LoggingConfig;

const METRICS_TARGET: &str = "warden::metrics";
const LOG_ENV: &str = "WARDEN_LOG";

/// Keep alive for the whole process; dropping flushes the file writers.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

pub fn init(config: &LoggingConfig) -> anyhow::Result<LogGuards> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating log directory {}", config.dir.display()))?;

    let env_filter = match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => filter,
        Err(_) => match config.level.parse::<EnvFilter>() {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!(
                    "WARN: logging.level='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                    config.level
                );
                EnvFilter::new("info")
            }
        },
    };

    let (events_writer, events_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&config.dir, "warden.jsonl"));
    let (metrics_writer, metrics_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&config.dir, "metrics.jsonl"));

    subscriber(env_filter, events_writer, metrics_writer, config.json_stderr)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(LogGuards {
        _guards: vec![events_guard, metrics_guard],
    })
}

/// Event log, metrics stream and stderr layers over the given writers.
fn subscriber<E, M>(
    env_filter: EnvFilter,
    events_writer: E,
    metrics_writer: M,
    json_stderr: bool,
) -> impl Subscriber + Send + Sync + 'static
where
    E: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    M: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let events_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(events_writer)
        .with_filter(filter_fn(|meta| meta.target() != METRICS_TARGET));

    let metrics_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(metrics_writer)
        .with_filter(filter_fn(|meta| meta.target() == METRICS_TARGET));

    let stderr_json = json_stderr.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_fn(|meta| meta.target() != METRICS_TARGET))
    });
    let stderr_text = (!json_stderr).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter_fn(|meta| meta.target() != METRICS_TARGET))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(events_layer)
        .with(metrics_layer)
        .with(stderr_json)
        .with(stderr_text)
}
