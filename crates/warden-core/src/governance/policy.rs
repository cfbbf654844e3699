//! Governor - 純粋なガバナンス判定
//!
//! `evaluate(sample, actuator)` はサンプル窓と現在のアクチュエータ状態だけから
//! アクションを決めます。時刻はサンプルの `timestamp` だけを使うので、
//! 合成したサンプル列を流し込むだけでテストできます（sleep 不要）。
//!
//! # 判定規則
//! - **Pause**: 直近の pause 以降の窓内エラー数が閾値以上 → `pause_duration` だけ停止
//! - **Throttle**: 窓が埋まっていて CPU / メモリ平均が閾値以上 → limit を半分に（下限 1、窓 1 つ分のクールダウン）
//! - **Resume**: `pause_until` を過ぎたあと、最初に健全だったサンプルで解除
//! - **Restore**: 健全な窓が 1 つ続くごとに limit を +1（上限 `max_limit`）
//! - **Escalate**: pause 回数がローリング窓内で閾値に達したら 1 回だけ。下回ったら再武装

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::MetricSample;
use crate::executor::ControlSnapshot;
use crate::ports::EscalationPayload;

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    pub cpu_high_pct: f64,
    pub mem_high_pct: f64,
    pub window: Duration,
    pub error_burst_threshold: u64,
    pub pause_duration: Duration,
    pub pause_bursts_before_escalation: usize,
    pub pause_burst_window: Duration,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    ErrorBurst,
    /// Telemetry could not be read; pausing is the safe default.
    GovernanceFault,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::ErrorBurst => "error_burst",
            PauseReason::GovernanceFault => "governance_fault",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GovernanceAction {
    Throttle {
        from: usize,
        to: usize,
        cpu_avg: f64,
        mem_avg: f64,
    },
    Pause {
        reason: PauseReason,
        until: DateTime<Utc>,
        window_errors: u64,
    },
    Resume,
    Restore {
        from: usize,
        to: usize,
    },
    Escalate(EscalationPayload),
}

impl GovernanceAction {
    /// Apply to the shared actuator state (call under the control lock).
    pub fn apply_all(actions: &[GovernanceAction], state: &mut ControlSnapshot) {
        for action in actions {
            match action {
                GovernanceAction::Throttle { to, .. } | GovernanceAction::Restore { to, .. } => {
                    state.limit = *to;
                }
                GovernanceAction::Pause { .. } => state.paused = true,
                GovernanceAction::Resume => state.paused = false,
                GovernanceAction::Escalate(_) => {}
            }
        }
    }
}

/// Aggregates over the current sample window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: usize,
    pub cpu_avg: f64,
    pub mem_avg: f64,
    pub ops: u64,
    pub errors: u64,
    /// Errors in samples taken after the most recent pause.
    pub errors_since_pause: u64,
}

#[derive(Debug)]
pub struct Governor {
    config: GovernorConfig,
    samples: VecDeque<MetricSample>,
    first_seen: Option<DateTime<Utc>>,
    pause_until: Option<DateTime<Utc>>,
    last_pause_at: Option<DateTime<Utc>>,
    pause_events: VecDeque<DateTime<Utc>>,
    escalation_armed: bool,
    last_throttle_at: Option<DateTime<Utc>>,
    healthy_since: Option<DateTime<Utc>>,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            first_seen: None,
            pause_until: None,
            last_pause_at: None,
            pause_events: VecDeque::new(),
            escalation_armed: true,
            last_throttle_at: None,
            healthy_since: None,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn pause_until(&self) -> Option<DateTime<Utc>> {
        self.pause_until
    }

    /// Pause events inside the escalation window (as of the last evaluation).
    pub fn pause_events(&self) -> usize {
        self.pause_events.len()
    }

    pub fn stats(&self) -> WindowStats {
        let n = self.samples.len();
        if n == 0 {
            return WindowStats::default();
        }
        let mut stats = WindowStats {
            samples: n,
            ..WindowStats::default()
        };
        for sample in &self.samples {
            stats.cpu_avg += sample.cpu_pct;
            stats.mem_avg += sample.mem_pct;
            stats.ops += sample.op_count;
            stats.errors += sample.error_count;
            if self.last_pause_at.is_none_or(|at| sample.timestamp > at) {
                stats.errors_since_pause += sample.error_count;
            }
        }
        stats.cpu_avg /= n as f64;
        stats.mem_avg /= n as f64;
        stats
    }

    pub fn evaluate(
        &mut self,
        sample: MetricSample,
        actuator: ControlSnapshot,
    ) -> Vec<GovernanceAction> {
        let now = sample.timestamp;
        let first_seen = *self.first_seen.get_or_insert(now);
        self.samples.push_back(sample);
        self.trim_samples(now);

        let stats = self.stats();
        let window = chrono_span(self.config.window);
        let window_full = now - first_seen >= window;
        let burst = stats.errors_since_pause >= self.config.error_burst_threshold;
        let pressure = stats.cpu_avg >= self.config.cpu_high_pct
            || stats.mem_avg >= self.config.mem_high_pct;
        let healthy = !burst && !pressure;

        let mut state = actuator;
        let mut actions = Vec::new();

        let pause_active = self.pause_until.is_some_and(|until| now < until);
        if burst && !pause_active {
            actions.push(self.pause(
                now,
                PauseReason::ErrorBurst,
                stats.errors_since_pause,
                &mut state,
            ));
        }

        let mut throttled = false;
        if pressure && window_full && state.limit > 1 && self.throttle_cooled_down(now) {
            let to = (state.limit / 2).max(1);
            actions.push(GovernanceAction::Throttle {
                from: state.limit,
                to,
                cpu_avg: stats.cpu_avg,
                mem_avg: stats.mem_avg,
            });
            state.limit = to;
            self.last_throttle_at = Some(now);
            throttled = true;
        }

        if !healthy {
            self.healthy_since = None;
        }

        if state.paused && healthy && self.pause_until.is_none_or(|until| now >= until) {
            actions.push(GovernanceAction::Resume);
            state.paused = false;
            self.pause_until = None;
            // restore needs a full healthy window after the pause
            self.healthy_since = Some(now);
        } else if state.paused {
            self.healthy_since = None;
        } else if healthy {
            let since = *self.healthy_since.get_or_insert(now);
            if !throttled && state.limit < self.config.max_limit && now - since >= window {
                actions.push(GovernanceAction::Restore {
                    from: state.limit,
                    to: state.limit + 1,
                });
                state.limit += 1;
                self.healthy_since = Some(now);
            }
        }

        actions.extend(self.check_escalation(now, &stats, &state));
        actions
    }

    /// Telemetry failed: pause admission unless a pause is already running.
    pub fn fault(&mut self, now: DateTime<Utc>, actuator: ControlSnapshot) -> Vec<GovernanceAction> {
        if self.pause_until.is_some_and(|until| now < until) {
            return Vec::new();
        }
        let mut state = actuator;
        let mut actions = vec![self.pause(now, PauseReason::GovernanceFault, 0, &mut state)];
        let stats = self.stats();
        actions.extend(self.check_escalation(now, &stats, &state));
        actions
    }

    fn pause(
        &mut self,
        now: DateTime<Utc>,
        reason: PauseReason,
        window_errors: u64,
        state: &mut ControlSnapshot,
    ) -> GovernanceAction {
        let until = now + chrono_span(self.config.pause_duration);
        self.pause_until = Some(until);
        self.last_pause_at = Some(now);
        self.pause_events.push_back(now);
        self.healthy_since = None;
        state.paused = true;
        GovernanceAction::Pause {
            reason,
            until,
            window_errors,
        }
    }

    fn check_escalation(
        &mut self,
        now: DateTime<Utc>,
        stats: &WindowStats,
        state: &ControlSnapshot,
    ) -> Option<GovernanceAction> {
        let span = chrono_span(self.config.pause_burst_window);
        while self.pause_events.front().is_some_and(|at| now - *at > span) {
            self.pause_events.pop_front();
        }

        let count = self.pause_events.len();
        if count < self.config.pause_bursts_before_escalation {
            self.escalation_armed = true;
            return None;
        }
        if !self.escalation_armed {
            return None;
        }
        self.escalation_armed = false;
        Some(GovernanceAction::Escalate(EscalationPayload {
            reason: "repeated_pause".to_string(),
            pause_count: count,
            window_s: self.config.pause_burst_window.as_secs(),
            timestamp: now,
            concurrency_limit: state.limit,
            cpu_avg: stats.cpu_avg,
            mem_avg: stats.mem_avg,
            window_errors: stats.errors,
            top_error_types: Default::default(),
        }))
    }

    fn throttle_cooled_down(&self, now: DateTime<Utc>) -> bool {
        self.last_throttle_at
            .is_none_or(|at| now - at >= chrono_span(self.config.window))
    }

    fn trim_samples(&mut self, now: DateTime<Utc>) {
        let window = chrono_span(self.config.window);
        while self.samples.front().is_some_and(|s| now - s.timestamp > window) {
            self.samples.pop_front();
        }
    }
}

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
