use sysinfo::System;

use crate::ports::{ProbeError, SystemProbe, SystemReading};

/// Host CPU / memory via `sysinfo`.
///
/// CPU usage is measured between two refreshes, so the first reading after
/// construction covers the time since `new()`.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn read(&mut self) -> Result<SystemReading, ProbeError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError("total memory reported as zero".to_string()));
        }
        let cpu_pct = f64::from(self.system.global_cpu_usage());
        if !cpu_pct.is_finite() {
            return Err(ProbeError(format!("cpu usage is not a number: {cpu_pct}")));
        }
        let mem_pct = self.system.used_memory() as f64 / total as f64 * 100.0;

        Ok(SystemReading {
            cpu_pct: cpu_pct.clamp(0.0, 100.0),
            mem_pct: mem_pct.clamp(0.0, 100.0),
        })
    }
}

/// Probe that replays scripted readings; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    readings: std::collections::VecDeque<Result<SystemReading, String>>,
    fallback: Option<SystemReading>,
}

impl ScriptedProbe {
    /// Always returns `reading` once the script is exhausted.
    pub fn steady(cpu_pct: f64, mem_pct: f64) -> Self {
        Self {
            readings: Default::default(),
            fallback: Some(SystemReading { cpu_pct, mem_pct }),
        }
    }

    pub fn push(&mut self, reading: SystemReading) {
        self.readings.push_back(Ok(reading));
    }

    pub fn push_failure(&mut self, message: impl Into<String>) {
        self.readings.push_back(Err(message.into()));
    }
}

impl SystemProbe for ScriptedProbe {
    fn read(&mut self) -> Result<SystemReading, ProbeError> {
        match self.readings.pop_front() {
            Some(Ok(reading)) => Ok(reading),
            Some(Err(message)) => Err(ProbeError(message)),
            None => self
                .fallback
                .ok_or_else(|| ProbeError("no scripted reading left".to_string())),
        }
    }
}
