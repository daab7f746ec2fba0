use std::{fmt, thread};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of device executing the numeric work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host CPU.
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Worker pool could not be started.
#[derive(Debug, Error)]
#[error("failed to start a {threads}-thread worker pool: {message}")]
pub struct ComputeError {
    /// Requested pool size.
    pub threads: usize,
    /// Pool builder message.
    pub message: String,
}

/// Device metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identifier (e.g., `cpu:0`).
    pub id: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Worker threads available on the device.
    pub threads: usize,
}

/// Explicit numeric context handed to model construction and inference.
///
/// Replaces any process-wide numeric state: parallel work runs on a pool
/// sized by this context, never on a global one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputeContext {
    device: DeviceInfo,
}

impl ComputeContext {
    /// Host CPU context with detected parallelism.
    #[must_use]
    pub fn detect() -> Self {
        let threads = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self::cpu(threads)
    }

    /// CPU context with a fixed thread budget.
    #[must_use]
    pub fn cpu(threads: usize) -> Self {
        Self {
            device: DeviceInfo {
                id: "cpu:0".to_string(),
                kind: DeviceKind::Cpu,
                threads: threads.max(1),
            },
        }
    }

    /// Device in use.
    #[must_use]
    pub const fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Thread budget.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.device.threads
    }

    /// Runs `op` on a worker pool of [`Self::threads`] threads.
    ///
    /// With a single thread `op` runs inline.
    pub fn install<OP, R>(&self, op: OP) -> Result<R, ComputeError>
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        if self.device.threads == 1 {
            return Ok(op());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.device.threads)
            .build()
            .map_err(|err| ComputeError {
                threads: self.device.threads,
                message: err.to_string(),
            })?;
        Ok(pool.install(op))
    }

    /// Summary for run logs.
    #[must_use]
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "device": self.device.id,
            "kind": self.device.kind.to_string(),
            "threads": self.device.threads,
        })
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_context_has_at_least_one_thread() {
        let ctx = ComputeContext::cpu(0);
        assert_eq!(ctx.device().threads, 1);
        assert_eq!(ctx.device().kind, DeviceKind::Cpu);
        assert_eq!(ctx.describe()["device"], "cpu:0");
    }

    #[test]
    fn detect_reports_host_cpu() {
        let ctx = ComputeContext::detect();
        assert!(ctx.threads() >= 1);
    }

    #[test]
    fn install_runs_on_a_pool_of_the_budgeted_size() {
        let ctx = ComputeContext::cpu(3);
        let seen = ctx.install(rayon::current_num_threads).unwrap();
        assert_eq!(seen, 3);
        let inline = ComputeContext::cpu(1).install(|| 7).unwrap();
        assert_eq!(inline, 7);
    }
}
