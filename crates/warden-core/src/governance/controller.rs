//! GovernanceLoop - サンプリング → 判定 → アクチュエート
//!
//! # フロー（`sample_interval` ごと）
//! 1. `SystemProbe` で CPU / メモリを読む（失敗したら conservative に pause）
//! 2. `OperationsCounter::take()` で前回からの ops / errors を取る
//! 3. control のロック内で `Governor::evaluate` → アクションを適用
//! 4. サンプルを store と metrics ストリームへ記録、アクションをログ
//! 5. `log_interval` ごとに `governance_summary` を出す

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::policy::{GovernanceAction, Governor};
use crate::domain::MetricSample;
use crate::executor::{ExecutorControl, OperationsCounter};
use crate::ports::{Clock, EscalationSink, SystemProbe, TaskStore};
use crate::store;

const TOP_ERROR_TYPES: usize = 5;

pub struct GovernanceLoop {
    governor: Governor,
    control: Arc<ExecutorControl>,
    counter: Arc<OperationsCounter>,
    store: Arc<dyn TaskStore>,
    probe: Box<dyn SystemProbe>,
    sink: Option<Arc<dyn EscalationSink>>,
    clock: Arc<dyn Clock>,
    sample_interval: Duration,
    log_interval: Duration,
    failing_types: VecDeque<(DateTime<Utc>, BTreeMap<String, u64>)>,
    last_summary: Option<DateTime<Utc>>,
}

impl GovernanceLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        governor: Governor,
        control: Arc<ExecutorControl>,
        counter: Arc<OperationsCounter>,
        store: Arc<dyn TaskStore>,
        probe: Box<dyn SystemProbe>,
        sink: Option<Arc<dyn EscalationSink>>,
        clock: Arc<dyn Clock>,
        sample_interval: Duration,
        log_interval: Duration,
    ) -> Self {
        Self {
            governor,
            control,
            counter,
            store,
            probe,
            sink,
            clock,
            sample_interval,
            log_interval,
            failing_types: VecDeque::new(),
            last_summary: None,
        }
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sample_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the first CPU reading spans an interval
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!(event = "governance_stopped", "governance loop stopped");
    }

    /// One sampling step. Returns the actions that were applied.
    pub async fn tick(&mut self) -> Vec<GovernanceAction> {
        let now = self.clock.now();

        let reading = match self.probe.read() {
            Ok(reading) => reading,
            Err(err) => {
                error!(event = "governance_fault", error = %err, "telemetry unavailable; pausing admission");
                let governor = &mut self.governor;
                let actions = self.control.update(|state| {
                    let actions = governor.fault(now, *state);
                    GovernanceAction::apply_all(&actions, state);
                    actions
                });
                self.report(&actions).await;
                return actions;
            }
        };

        let delta = self.counter.take();
        self.remember_failing_types(now, delta.errors_by_type);

        let governor = &mut self.governor;
        let (sample, actions) = self.control.update(|state| {
            let sample = MetricSample {
                timestamp: now,
                cpu_pct: reading.cpu_pct,
                mem_pct: reading.mem_pct,
                op_count: delta.ops,
                error_count: delta.errors,
                concurrency_limit: state.limit,
                paused: state.paused,
            };
            let actions = governor.evaluate(sample.clone(), *state);
            GovernanceAction::apply_all(&actions, state);
            (sample, actions)
        });

        info!(
            target: "warden::metrics",
            event = "metrics_sample",
            cpu_pct = sample.cpu_pct,
            mem_pct = sample.mem_pct,
            op_count = sample.op_count,
            error_count = sample.error_count,
            concurrency_limit = sample.concurrency_limit,
            paused = sample.paused,
        );
        let persisted = sample.clone();
        if let Err(err) = store::call(&self.store, move |s| s.insert_metric(&persisted)).await {
            warn!(event = "store_error", operation = "insert_metric", error = %err, "metric sample not persisted");
        }

        self.report(&actions).await;
        self.maybe_log_summary(now);
        actions
    }

    async fn report(&self, actions: &[GovernanceAction]) {
        for action in actions {
            match action {
                GovernanceAction::Throttle {
                    from,
                    to,
                    cpu_avg,
                    mem_avg,
                } => warn!(
                    event = "governance_throttle",
                    reason = "resource_pressure",
                    from,
                    to,
                    cpu_avg,
                    mem_avg,
                    "concurrency throttled"
                ),
                GovernanceAction::Pause {
                    reason,
                    until,
                    window_errors,
                } => warn!(
                    event = "governance_pause",
                    reason = reason.as_str(),
                    until = %until.to_rfc3339(),
                    duration_s = self.governor.config().pause_duration.as_secs(),
                    window_errors,
                    "admission paused"
                ),
                GovernanceAction::Resume => {
                    info!(event = "governance_resume", "admission resumed");
                }
                GovernanceAction::Restore { from, to } => {
                    info!(event = "governance_restore", from, to, "concurrency restored");
                }
                GovernanceAction::Escalate(payload) => {
                    let mut payload = payload.clone();
                    payload.top_error_types = self.top_failing_types();
                    let Some(sink) = &self.sink else {
                        warn!(
                            event = "governance_escalation_suppressed",
                            reason = %payload.reason,
                            pause_count = payload.pause_count,
                            window_s = payload.window_s,
                            "repeated pauses; escalation disabled"
                        );
                        continue;
                    };
                    error!(
                        event = "governance_escalation",
                        reason = %payload.reason,
                        pause_count = payload.pause_count,
                        window_s = payload.window_s,
                        concurrency_limit = payload.concurrency_limit,
                        top_error_types = ?payload.top_error_types,
                        "repeated pauses; escalating for human review"
                    );
                    if let Err(err) = sink.escalate(&payload).await {
                        warn!(event = "escalation_failed", error = %err, "escalation sink failed");
                    }
                }
            }
        }
    }

    fn remember_failing_types(&mut self, now: DateTime<Utc>, errors_by_type: BTreeMap<String, u64>) {
        if !errors_by_type.is_empty() {
            self.failing_types.push_back((now, errors_by_type));
        }
        let span = chrono::Duration::from_std(self.governor.config().pause_burst_window)
            .unwrap_or(chrono::Duration::MAX);
        while self
            .failing_types
            .front()
            .is_some_and(|(at, _)| now - *at > span)
        {
            self.failing_types.pop_front();
        }
    }

    fn top_failing_types(&self) -> BTreeMap<String, u64> {
        let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
        for (_, counts) in &self.failing_types {
            for (task_type, n) in counts {
                *totals.entry(task_type.as_str()).or_default() += n;
            }
        }
        let mut ranked: Vec<(&str, u64)> = totals.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(TOP_ERROR_TYPES)
            .map(|(task_type, n)| (task_type.to_string(), n))
            .collect()
    }

    fn maybe_log_summary(&mut self, now: DateTime<Utc>) {
        let interval = chrono::Duration::from_std(self.log_interval).unwrap_or(chrono::Duration::MAX);
        if self.last_summary.is_some_and(|at| now - at < interval) {
            return;
        }
        self.last_summary = Some(now);

        let stats = self.governor.stats();
        let snapshot = self.control.snapshot();
        info!(
            target: "warden::metrics",
            event = "governance_summary",
            cpu_avg = stats.cpu_avg,
            mem_avg = stats.mem_avg,
            active_samples = stats.samples,
            window_ops = stats.ops,
            window_errors = stats.errors,
            concurrency_limit = snapshot.limit,
            paused = snapshot.paused,
            pause_events = self.governor.pause_events(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::escalation::testing::RecordingSink;
    use crate::governance::policy::GovernorConfig;
    use crate::governance::probe::ScriptedProbe;
    use crate::ports::{FixedClock, SystemReading};
    use crate::store::SqliteTaskStore;
    use chrono::TimeZone;

    fn config() -> GovernorConfig {
        GovernorConfig {
            cpu_high_pct: 85.0,
            mem_high_pct: 90.0,
            window: Duration::from_secs(30),
            error_burst_threshold: 10,
            pause_duration: Duration::from_secs(60),
            pause_bursts_before_escalation: 1,
            pause_burst_window: Duration::from_secs(1800),
            max_limit: 4,
        }
    }

    struct Fixture {
        governance: GovernanceLoop,
        control: Arc<ExecutorControl>,
        counter: Arc<OperationsCounter>,
        store: Arc<dyn TaskStore>,
        clock: Arc<FixedClock>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(probe: ScriptedProbe) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        fixture_with_sink(probe, Arc::clone(&sink), true)
    }

    fn fixture_with_sink(probe: ScriptedProbe, sink: Arc<RecordingSink>, attach: bool) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store: Arc<dyn TaskStore> =
            Arc::new(SqliteTaskStore::open_in_memory(3, clock.clone()).unwrap());
        let control = Arc::new(ExecutorControl::new(4));
        let counter = Arc::new(OperationsCounter::new());
        let governance = GovernanceLoop::new(
            Governor::new(config()),
            Arc::clone(&control),
            Arc::clone(&counter),
            Arc::clone(&store),
            Box::new(probe),
            attach.then(|| sink.clone() as Arc<dyn EscalationSink>),
            clock.clone(),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        Fixture {
            governance,
            control,
            counter,
            store,
            clock,
            sink,
        }
    }

    #[tokio::test]
    async fn error_burst_pauses_executor_and_escalates_with_failing_types() {
        let mut f = fixture(ScriptedProbe::steady(20.0, 30.0));
        for _ in 0..7 {
            f.counter.record_failure("demo");
        }
        for _ in 0..5 {
            f.counter.record_failure("resize");
        }

        let actions = f.governance.tick().await;
        assert!(f.control.snapshot().paused);
        assert!(matches!(actions[0], GovernanceAction::Pause { .. }));

        let payloads = f.sink.payloads.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].top_error_types.get("demo"), Some(&7));
        assert_eq!(payloads[0].top_error_types.get("resize"), Some(&5));

        let samples = f.store.recent_metrics(10).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].error_count, 12);
        // recorded as observed, before the controller reacted
        assert!(!samples[0].paused);
    }

    #[tokio::test]
    async fn probe_failure_fails_toward_pause() {
        let mut probe = ScriptedProbe::steady(20.0, 30.0);
        probe.push_failure("sensor offline");
        let mut f = fixture(probe);
        f.counter.record_success();

        f.governance.tick().await;
        assert!(f.control.snapshot().paused);
        // counts are kept for the next successful sample
        assert!(f.store.recent_metrics(10).unwrap().is_empty());

        f.clock.advance(chrono::Duration::seconds(60));
        f.governance.tick().await;
        assert!(!f.control.snapshot().paused);
        assert_eq!(f.store.recent_metrics(1).unwrap()[0].op_count, 1);
    }

    #[tokio::test]
    async fn pressure_throttles_after_full_window() {
        let mut probe = ScriptedProbe::steady(97.0, 40.0);
        probe.push(SystemReading {
            cpu_pct: 99.0,
            mem_pct: 40.0,
        });
        let mut f = fixture(probe);
        for _ in 0..7 {
            f.governance.tick().await;
            f.clock.advance(chrono::Duration::seconds(5));
        }
        assert_eq!(f.control.snapshot().limit, 2);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn escalation_without_sink_is_logged_as_suppressed() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let sink = Arc::new(RecordingSink::default());
        let mut f = fixture_with_sink(ScriptedProbe::steady(20.0, 30.0), Arc::clone(&sink), false);
        for _ in 0..12 {
            f.counter.record_failure("demo");
        }
        let actions = f.governance.tick().await;
        assert!(actions.iter().any(|a| matches!(a, GovernanceAction::Escalate(_))));
        assert!(sink.payloads.lock().unwrap().is_empty());

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        let suppressed = output
            .lines()
            .find(|line| line.contains("governance_escalation_suppressed"))
            .expect("suppressed escalation record");
        assert!(suppressed.contains("WARN"));
        assert!(!output.contains("ERROR"));
    }
}
