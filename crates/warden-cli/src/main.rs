//! warden - command line entry point.
//!
//! ```text
//! warden enqueue demo '{"value":42}'
//! warden resume
//! warden stats
//! warden inspect task-01J...
//! ```

mod handlers;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use warden_core::domain::{Enqueued, NewTask, TaskId};
use warden_core::{Engine, EngineBuilder, WardenConfig};

/// Blocking handlers still running after the drain timeout get this long
/// before the process exits anyway.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Durable, self-governing task engine")]
struct Cli {
    /// Configuration file (default: $WARDEN_CONFIG, then ./warden.yml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a task to the queue
    Enqueue {
        /// Handler name, e.g. `demo`
        task_type: String,
        /// JSON payload, e.g. '{"value":42}'
        payload: String,
        #[arg(long)]
        idempotency_key: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Run the executor and governance loops until interrupted
    Resume,
    /// Queue depth by state
    Stats,
    /// Dump a task record and its attempt history
    Inspect { task_id: String },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("WARDEN_CONFIG").map(PathBuf::from));
    let config = WardenConfig::load(config_path.as_deref()).context("loading configuration")?;
    let _log_guards = logging::init(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let result = runtime.block_on(execute(cli.command, config));
    // abandoned blocking handlers must not hold the process open
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

async fn execute(command: Command, config: WardenConfig) -> anyhow::Result<()> {
    let engine = build_engine(config)?;

    match command {
        Command::Enqueue {
            task_type,
            payload,
            idempotency_key,
            priority,
            max_attempts,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut request = NewTask::new(task_type, payload).with_priority(priority);
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(key);
            }
            if let Some(max_attempts) = max_attempts {
                request = request.with_max_attempts(max_attempts);
            }

            let output = match engine.enqueue(request).await? {
                Enqueued::Created(task_id) => json!({ "task_id": task_id, "status": "created" }),
                Enqueued::Pending(task_id) => json!({ "task_id": task_id, "status": "pending" }),
                Enqueued::Completed { task_id, result } => {
                    json!({ "task_id": task_id, "status": "succeeded", "result": result })
                }
            };
            print_json(&output)
        }
        Command::Resume => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = tx.send(true);
            });
            let summary = engine.run(rx).await?;
            print_json(&summary)
        }
        Command::Stats => print_json(&engine.stats().await?),
        Command::Inspect { task_id } => {
            let task_id: TaskId = task_id.parse()?;
            print_json(&engine.inspect(task_id).await?)
        }
    }
}

fn build_engine(config: WardenConfig) -> anyhow::Result<Engine> {
    let builder = handlers::register(EngineBuilder::new(config))?;
    let engine = builder.build().context("building engine")?;
    Ok(engine)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_handler_failed", signal = "ctrl_c", error = %e, "failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(event = "signal_handler_failed", signal = "sigterm", error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(event = "shutdown_requested", "shutdown signal received; draining");
}
