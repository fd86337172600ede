use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource ceilings attached to a session when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    /// Maximum wall-clock duration across all steps of a run
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum memory in bytes
    pub max_memory: u64,
    /// Maximum bytes of stdout + stderr relayed to subscribers
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_memory: 256 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Lower every field to at most the matching field of `ceiling`
    pub fn clamp_to(self, ceiling: &ResourceLimits) -> Self {
        Self {
            timeout: self.timeout.min(ceiling.timeout),
            max_memory: self.max_memory.min(ceiling.max_memory),
            max_output_bytes: self.max_output_bytes.min(ceiling.max_output_bytes),
        }
    }

    /// Memory ceiling in whole MiB, rounded up (for interpreter heap flags)
    pub fn max_memory_mib(&self) -> u64 {
        self.max_memory.div_ceil(1024 * 1024).max(1)
    }
}

/// Caller-supplied overrides; omitted fields fall back to configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverrides {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_memory: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

impl LimitOverrides {
    /// Resolve against `defaults`, then clamp to `ceiling`
    pub fn resolve(&self, defaults: &ResourceLimits, ceiling: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            timeout: self.timeout.unwrap_or(defaults.timeout),
            max_memory: self.max_memory.unwrap_or(defaults.max_memory),
            max_output_bytes: self.max_output_bytes.unwrap_or(defaults.max_output_bytes),
        }
        .clamp_to(ceiling)
    }
}
