//! Configuration for the provisioning orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::step::StepKey;

fn default_step_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_compile_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_terminal_retention() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_tail_bytes() -> usize {
    16 * 1024
}

const fn default_broadcast_capacity() -> usize {
    256
}

/// Timeouts and limits for job execution.
///
/// Every step runs under a hard wall-clock timeout. Compile-class steps
/// (dependency installation, compilation) get the long timeout because
/// their external operations run unbounded; everything else gets the
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionConfig {
    /// Wall-clock limit for ordinary steps.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,

    /// Wall-clock limit for compile-class steps.
    #[serde(with = "humantime_serde")]
    pub compile_timeout: Duration,

    /// Per-step timeout overrides, taking precedence over the class
    /// defaults.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub step_overrides: HashMap<StepKey, Duration>,

    /// Grace window between graceful termination and force kill.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// How long a job may go without progress before its reservation is
    /// swept (cancelled) by the server-owned lease mechanism.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// How often the lease sweeper scans for expired jobs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How long a terminal job's snapshot stays queryable before the
    /// sweeper evicts it from the registry.
    #[serde(with = "humantime_serde")]
    pub terminal_retention: Duration,

    /// Maximum bytes of stdout/stderr tail captured for diagnostics.
    pub diagnostic_tail_bytes: usize,

    /// Per-job progress channel capacity.
    pub broadcast_capacity: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
            compile_timeout: default_compile_timeout(),
            step_overrides: HashMap::new(),
            kill_grace: default_kill_grace(),
            lease_ttl: default_lease_ttl(),
            sweep_interval: default_sweep_interval(),
            terminal_retention: default_terminal_retention(),
            diagnostic_tail_bytes: default_tail_bytes(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl ProvisionConfig {
    /// Returns the wall-clock limit for the given step.
    #[must_use]
    pub fn timeout_for(&self, step: StepKey) -> Duration {
        if let Some(limit) = self.step_overrides.get(&step) {
            return *limit;
        }
        if step.is_compile_class() {
            self.compile_timeout
        } else {
            self.step_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_class_steps_get_the_long_timeout() {
        let config = ProvisionConfig::default();
        assert_eq!(
            config.timeout_for(StepKey::CompileApplication),
            config.compile_timeout
        );
        assert_eq!(
            config.timeout_for(StepKey::CreateDatabase),
            config.step_timeout
        );
    }

    #[test]
    fn per_step_override_wins() {
        let mut config = ProvisionConfig::default();
        config
            .step_overrides
            .insert(StepKey::RunMigrations, Duration::from_secs(600));
        assert_eq!(
            config.timeout_for(StepKey::RunMigrations),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.timeout_for(StepKey::CreateDatabase),
            config.step_timeout
        );
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ProvisionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProvisionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.compile_timeout, config.compile_timeout);
        assert_eq!(parsed.lease_ttl, config.lease_ttl);
        assert_eq!(parsed.terminal_retention, config.terminal_retention);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let parsed: ProvisionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.step_timeout, Duration::from_secs(120));
        assert_eq!(parsed.diagnostic_tail_bytes, 16 * 1024);
    }
}
