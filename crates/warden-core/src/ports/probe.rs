//! SystemProbe port - ホストの CPU / メモリ使用率

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemReading {
    pub cpu_pct: f64,
    pub mem_pct: f64,
}

#[derive(Debug, thiserror::Error)]
#[error("system probe failed: {0}")]
pub struct ProbeError(pub String);

pub trait SystemProbe: Send + Sync {
    fn read(&mut self) -> Result<SystemReading, ProbeError>;
}
