use coderun_sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Admission and retention settings for the session registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Terminal sessions kept per workspace before the oldest are purged
    pub history_per_workspace: usize,
    /// Largest accepted source snapshot
    pub max_source_bytes: usize,
    /// Capacity of the registry-wide update broadcast
    pub update_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_per_workspace: 10,
            max_source_bytes: 256 * 1024,
            update_buffer: 256,
        }
    }
}

/// Default limits for requests that omit them, and the ceiling no request may exceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub defaults: ResourceLimits,
    pub ceiling: ResourceLimits,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            defaults: ResourceLimits::default(),
            ceiling: ResourceLimits {
                timeout: Duration::from_secs(60),
                max_memory: 1024 * 1024 * 1024,
                max_output_bytes: 8 * 1024 * 1024,
            },
        }
    }
}

impl LimitPolicy {
    /// Defaults clamped to the ceiling, so a misconfigured default never exceeds it
    pub fn effective_defaults(&self) -> ResourceLimits {
        self.defaults.clamp_to(&self.ceiling)
    }
}
