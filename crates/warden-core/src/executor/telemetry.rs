use std::collections::BTreeMap;
use std::sync::Mutex;

/// Handler outcomes since the last `take()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationsDelta {
    pub ops: u64,
    pub errors: u64,
    pub errors_by_type: BTreeMap<String, u64>,
}

/// Counts handler outcomes for the governance sampler.
///
/// Workers record; the governance loop drains with `take()` once per sample,
/// which turns the running counts into per-sample deltas.
#[derive(Debug, Default)]
pub struct OperationsCounter {
    inner: Mutex<OperationsDelta>,
}

impl OperationsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ops += 1;
    }

    pub fn record_failure(&self, task_type: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ops += 1;
        inner.errors += 1;
        *inner.errors_by_type.entry(task_type.to_string()).or_default() += 1;
    }

    pub fn take(&self) -> OperationsDelta {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_returns_delta_and_resets() {
        let counter = OperationsCounter::new();
        counter.record_success();
        counter.record_failure("demo");
        counter.record_failure("demo");
        counter.record_failure("resize");

        let delta = counter.take();
        assert_eq!(delta.ops, 4);
        assert_eq!(delta.errors, 3);
        assert_eq!(delta.errors_by_type.get("demo"), Some(&2));

        assert_eq!(counter.take(), OperationsDelta::default());
    }
}
