// SPDX-License-Identifier: MIT

//! Engine tuning knobs.

use gantry_core::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of the step driver and failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry/attempt accounting knobs, passed to the pure automaton.
    #[serde(flatten)]
    pub policy: FailurePolicy,
    /// Upper bound on targets evaluated per driver batch.
    pub engine_step_batch_size: usize,
    /// Concurrent step workers inside a batch.
    pub concurrent_automaton_steps: usize,
    /// Timeout ceiling for every executor call, in seconds.
    pub host_timeout_upper_bound_s: u64,
    /// Minimum interval between orphan-killing sweeps, in seconds.
    pub orphan_killing_wait_s: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            engine_step_batch_size: 500,
            concurrent_automaton_steps: 4,
            host_timeout_upper_bound_s: 60,
            orphan_killing_wait_s: 60,
        }
    }
}

impl EngineConfig {
    pub fn host_timeout_upper_bound(&self) -> Duration {
        Duration::from_secs(self.host_timeout_upper_bound_s)
    }

    pub fn orphan_killing_wait(&self) -> Duration {
        Duration::from_secs(self.orphan_killing_wait_s)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
