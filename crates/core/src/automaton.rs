// SPDX-License-Identifier: MIT

//! The pure target automaton.
//!
//! [`step`] takes a snapshot of a target plus an observation bundle and
//! returns the history entries to append and the side effects to perform.
//! It never suspends and never touches the outside world, so every
//! transition rule is table-testable.

use crate::host::{Host, HostFailure, ProcessStatus, RunHandle};
use crate::state::{Cause, StateEntry, StateKind, TargetState};
use crate::target::{BuildProcess, Condition, Target, TargetId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Failure/recovery policy knobs for the automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Attempts at or above this count force death.
    pub maximum_successive_attempts: u32,
    /// When true, classified unix/ssh failures count as target failures;
    /// when false they return the node to its prior actionable state.
    pub turn_unix_ssh_failure_into_target_failure: bool,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            maximum_successive_attempts: 1,
            turn_unix_ssh_failure_into_target_failure: false,
        }
    }
}

/// Summary of a dependency's state, as observed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepState {
    Passive,
    InProgress,
    Successful,
    Dead,
}

/// Result of the single outstanding executor call for a target.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Condition(Result<bool, HostFailure>),
    Start(Result<RunHandle, HostFailure>),
    Probe(Result<ProcessStatus, HostFailure>),
    Kill(Result<(), HostFailure>),
}

/// Everything the automaton may look at for one step.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub now_ms: u64,
    /// State summaries for the target's dependencies.
    pub deps: HashMap<TargetId, DepState>,
    /// Pending activation request for a passive target.
    pub activate: Option<Cause>,
    /// A client asked for this target to be killed.
    pub kill_requested: bool,
    /// The kill comes from the orphan sweep rather than a client.
    pub orphan: bool,
    /// Result of the executor call issued for this target, if one is ready.
    pub outcome: Option<CallOutcome>,
}

/// Side effect the driver must perform on behalf of a stepped target.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CheckCondition { condition: Condition },
    StartProcess { host: Host, process: BuildProcess },
    ProbeProcess { handle: RunHandle },
    KillProcess { handle: RunHandle },
    /// Activate other targets (dependency cascade or failure fallback).
    Activate { ids: Vec<TargetId>, cause: Cause },
}

/// Outcome of one automaton step: entries to append, effects to dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    pub entries: Vec<StateEntry>,
    pub actions: Vec<Action>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.actions.is_empty()
    }
}

/// Advance a target as far as the observations allow.
///
/// Stops as soon as an executor call is issued or no further transition is
/// possible without new observations. Terminal targets never step.
pub fn step(target: &Target, obs: &Observations, policy: &FailurePolicy) -> Step {
    if target.is_terminal() {
        return Step::default();
    }
    let mut ctx = StepCtx {
        target,
        obs,
        policy,
        state: target.current().state.clone(),
        attempts: target.current().attempts,
        outcome: obs.outcome.clone(),
        out: Step::default(),
    };
    while ctx.advance() {}
    ctx.out
}

struct StepCtx<'a> {
    target: &'a Target,
    obs: &'a Observations,
    policy: &'a FailurePolicy,
    state: TargetState,
    attempts: u32,
    outcome: Option<CallOutcome>,
    out: Step,
}

impl StepCtx<'_> {
    fn push(&mut self, state: TargetState, cause: Cause) {
        let entry = StateEntry::new(state, self.obs.now_ms, cause).with_attempts(self.attempts);
        self.push_entry(entry);
    }

    fn push_entry(&mut self, entry: StateEntry) {
        self.state = entry.state.clone();
        self.out.entries.push(entry);
    }

    fn act(&mut self, action: Action) {
        self.out.actions.push(action);
    }

    /// Append the terminal `Dead` entry and schedule the fallback branches.
    /// Fallbacks fire exactly once because `Dead` is entered exactly once.
    fn die(&mut self, reason: impl Into<String>, cause: Cause) {
        self.push(
            TargetState::Dead {
                reason: reason.into(),
            },
            cause,
        );
        if !self.target.if_fails_activate.is_empty() {
            self.act(Action::Activate {
                ids: self.target.if_fails_activate.clone(),
                cause: Cause::FallbackOf(self.target.id.clone()),
            });
        }
    }

    fn kill_cause(&self) -> Cause {
        if self.obs.orphan {
            Cause::OrphanSweep
        } else {
            Cause::KillRequest
        }
    }

    fn kill_reason(&self) -> &'static str {
        if self.obs.orphan {
            "reclaimed as orphan"
        } else {
            "killed by user"
        }
    }

    /// Kill a node that has no live process: straight to `Killed` then `Dead`.
    fn kill_short_circuit(&mut self) {
        let cause = self.kill_cause();
        self.push(TargetState::Killed, cause.clone());
        self.die(self.kill_reason(), cause);
    }

    /// Begin the kill path for a node with a live process.
    fn kill_process(&mut self, handle: RunHandle) {
        let cause = self.kill_cause();
        self.push(
            TargetState::TriedToKill {
                handle: handle.clone(),
            },
            cause.clone(),
        );
        self.push(
            TargetState::Killing {
                handle: handle.clone(),
            },
            cause,
        );
        self.act(Action::KillProcess { handle });
    }

    /// A process-level failure: increments the attempts counter. The caller's
    /// entry is appended, then the retry-or-die decision happens on the next
    /// loop iteration.
    fn fail_attempt(&mut self, state: TargetState, reason: &str) {
        self.attempts += 1;
        let entry = StateEntry::new(state, self.obs.now_ms, Cause::EngineStep)
            .with_attempts(self.attempts)
            .with_error(reason);
        self.push_entry(entry);
    }

    /// A classified unix/ssh failure. Non-fatal by default: return to the
    /// prior actionable state without touching the counter.
    fn env_failure(&mut self, prior: TargetState, failure: &HostFailure) {
        if self.policy.turn_unix_ssh_failure_into_target_failure {
            self.attempts += 1;
            if self.attempts >= self.policy.maximum_successive_attempts {
                self.die(failure.to_string(), Cause::AttemptsExhausted);
                return;
            }
            let entry = StateEntry::new(prior, self.obs.now_ms, Cause::EngineStep)
                .with_attempts(self.attempts)
                .with_error(failure.to_string());
            self.push_entry(entry);
            return;
        }
        // Environmental hiccup: no counter, and no duplicate entry when the
        // prior actionable state is the one we are already in.
        if StateKind::from(&prior) != StateKind::from(&self.state) {
            let entry = StateEntry::new(prior, self.obs.now_ms, Cause::EngineStep)
                .with_attempts(self.attempts)
                .with_error(failure.to_string());
            self.push_entry(entry);
        }
    }

    /// One transition. Returns true when the loop should keep advancing.
    fn advance(&mut self) -> bool {
        match self.state.clone() {
            TargetState::Passive => {
                if self.obs.kill_requested {
                    self.kill_short_circuit();
                    return false;
                }
                if let Some(cause) = self.obs.activate.clone() {
                    self.push(TargetState::Activable, cause);
                    return true;
                }
                false
            }

            TargetState::Activable => {
                if self.obs.kill_requested {
                    self.kill_short_circuit();
                    return false;
                }
                let mut dead = Vec::new();
                let mut passive = Vec::new();
                let mut waiting = false;
                let mut seen = std::collections::HashSet::new();
                for dep in &self.target.dependencies {
                    if !seen.insert(dep.clone()) {
                        continue;
                    }
                    match self.obs.deps.get(dep).copied() {
                        Some(DepState::Successful) => {}
                        Some(DepState::Dead) | None => dead.push(dep.clone()),
                        Some(DepState::Passive) => {
                            passive.push(dep.clone());
                            waiting = true;
                        }
                        Some(DepState::InProgress) => waiting = true,
                    }
                }
                if !dead.is_empty() {
                    let first = dead[0].clone();
                    let reason = format!(
                        "dependencies died: {}",
                        dead.iter()
                            .map(|d| d.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    self.push(
                        TargetState::FailedFromDependencies { dead },
                        Cause::DependencyDeath(first.clone()),
                    );
                    self.die(reason, Cause::DependencyDeath(first));
                    return false;
                }
                if waiting {
                    if !passive.is_empty() {
                        self.act(Action::Activate {
                            ids: passive,
                            cause: Cause::DependencyOf(self.target.id.clone()),
                        });
                    }
                    return false;
                }
                self.push(TargetState::Active, Cause::EngineStep);
                true
            }

            TargetState::Active => {
                if self.obs.kill_requested {
                    self.kill_short_circuit();
                    return false;
                }
                match self.target.condition.clone() {
                    Some(condition) => {
                        self.push(TargetState::TriedToEvaluateCondition, Cause::EngineStep);
                        self.act(Action::CheckCondition { condition });
                        false
                    }
                    None => {
                        self.push(TargetState::Building, Cause::EngineStep);
                        true
                    }
                }
            }

            TargetState::TriedToEvaluateCondition => match self.outcome.take() {
                Some(CallOutcome::Condition(Ok(true))) => {
                    self.push(TargetState::AlreadyDone, Cause::EngineStep);
                    true
                }
                Some(CallOutcome::Condition(Ok(false))) => {
                    self.push(TargetState::Building, Cause::EngineStep);
                    true
                }
                Some(CallOutcome::Condition(Err(f))) => {
                    self.env_failure(TargetState::Active, &f);
                    false
                }
                _ => {
                    if self.obs.kill_requested {
                        // Probe in flight but no process: its result is discarded.
                        self.kill_short_circuit();
                    } else if let Some(condition) = self.target.condition.clone() {
                        // No probe actually in flight (engine restart): re-issue.
                        self.act(Action::CheckCondition { condition });
                    }
                    false
                }
            },

            TargetState::AlreadyDone => {
                self.push(TargetState::Successful, Cause::EngineStep);
                false
            }

            TargetState::Building => {
                if self.obs.kill_requested {
                    self.kill_short_circuit();
                    return false;
                }
                match &self.target.build_process {
                    BuildProcess::NoOperation => {
                        self.push(TargetState::RanSuccessfully, Cause::EngineStep);
                        true
                    }
                    process => {
                        let host = self.target.execution_host();
                        let process = process.clone();
                        self.push(TargetState::TriedToStart, Cause::EngineStep);
                        self.act(Action::StartProcess { host, process });
                        false
                    }
                }
            }

            TargetState::TriedToStart => match self.outcome.take() {
                Some(CallOutcome::Start(Ok(handle))) => {
                    if self.obs.kill_requested {
                        self.kill_process(handle);
                    } else {
                        self.push(TargetState::StartedRunning { handle }, Cause::EngineStep);
                    }
                    false
                }
                Some(CallOutcome::Start(Err(f))) => {
                    if self.obs.kill_requested {
                        self.kill_short_circuit();
                    } else {
                        self.env_failure(TargetState::Building, &f);
                    }
                    false
                }
                _ => {
                    if self.obs.kill_requested {
                        self.kill_short_circuit();
                    } else {
                        // Start call lost (engine restart): issue it again.
                        // Starting is at-least-once by contract.
                        self.act(Action::StartProcess {
                            host: self.target.execution_host(),
                            process: self.target.build_process.clone(),
                        });
                    }
                    false
                }
            },

            TargetState::StartedRunning { handle } => {
                if self.obs.kill_requested {
                    self.kill_process(handle);
                    return false;
                }
                self.push(
                    TargetState::TriedToCheckProcess {
                        handle: handle.clone(),
                    },
                    Cause::EngineStep,
                );
                self.act(Action::ProbeProcess { handle });
                false
            }

            TargetState::TriedToCheckProcess { handle } => match self.outcome.take() {
                Some(CallOutcome::Probe(Ok(ProcessStatus::StillRunning))) => {
                    if self.obs.kill_requested {
                        self.kill_process(handle);
                    } else {
                        self.push(TargetState::StartedRunning { handle }, Cause::EngineStep);
                    }
                    false
                }
                Some(CallOutcome::Probe(Ok(ProcessStatus::FinishedSuccessfully))) => {
                    self.push(TargetState::RanSuccessfully, Cause::EngineStep);
                    true
                }
                Some(CallOutcome::Probe(Ok(ProcessStatus::FinishedWithFailure(reason)))) => {
                    self.fail_attempt(
                        TargetState::FailedRunning {
                            reason: reason.clone(),
                        },
                        &reason,
                    );
                    true
                }
                Some(CallOutcome::Probe(Err(f))) => {
                    self.env_failure(TargetState::StartedRunning { handle }, &f);
                    false
                }
                _ => {
                    if self.obs.kill_requested {
                        // Kill without waiting for the probe; its result is
                        // discarded when it lands on a killing state.
                        self.kill_process(handle);
                    } else {
                        self.act(Action::ProbeProcess { handle });
                    }
                    false
                }
            },

            TargetState::RanSuccessfully => match self.target.condition.clone() {
                None => {
                    self.push(TargetState::VerifiedSuccess, Cause::EngineStep);
                    true
                }
                Some(condition) => match self.outcome.take() {
                    Some(CallOutcome::Condition(Ok(true))) => {
                        self.push(TargetState::VerifiedSuccess, Cause::EngineStep);
                        true
                    }
                    Some(CallOutcome::Condition(Ok(false))) => {
                        self.fail_attempt(
                            TargetState::FailedToVerifySuccess,
                            "process succeeded but condition does not hold",
                        );
                        true
                    }
                    Some(CallOutcome::Condition(Err(f))) => {
                        self.env_failure(TargetState::RanSuccessfully, &f);
                        false
                    }
                    _ => {
                        self.act(Action::CheckCondition { condition });
                        false
                    }
                },
            },

            TargetState::VerifiedSuccess => {
                self.push(TargetState::Successful, Cause::EngineStep);
                false
            }

            TargetState::FailedRunning { reason } => {
                if self.attempts >= self.policy.maximum_successive_attempts {
                    self.die(reason, Cause::AttemptsExhausted);
                } else {
                    self.push(TargetState::Active, Cause::EngineStep);
                }
                false
            }

            TargetState::FailedToVerifySuccess => {
                if self.attempts >= self.policy.maximum_successive_attempts {
                    self.die(
                        "process succeeded but condition does not hold",
                        Cause::AttemptsExhausted,
                    );
                } else {
                    self.push(TargetState::Active, Cause::EngineStep);
                }
                false
            }

            TargetState::FailedFromDependencies { dead } => {
                let first = dead
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.target.id.clone());
                let reason = format!(
                    "dependencies died: {}",
                    dead.iter()
                        .map(|d| d.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.die(reason, Cause::DependencyDeath(first));
                false
            }

            TargetState::TriedToKill { handle } => {
                let cause = self.kill_cause();
                self.push(
                    TargetState::Killing {
                        handle: handle.clone(),
                    },
                    cause,
                );
                self.act(Action::KillProcess { handle });
                false
            }

            TargetState::Killing { handle } => match self.outcome.take() {
                Some(CallOutcome::Kill(Ok(()))) => {
                    let cause = self.kill_cause();
                    self.push(TargetState::Killed, cause);
                    true
                }
                Some(CallOutcome::Kill(Err(f))) => {
                    self.env_failure(TargetState::TriedToKill { handle }, &f);
                    false
                }
                _ => {
                    self.act(Action::KillProcess { handle });
                    false
                }
            },

            TargetState::Killed => {
                let cause = self.kill_cause();
                self.die(self.kill_reason(), cause);
                false
            }

            TargetState::Successful | TargetState::Dead { .. } => false,
        }
    }
}

#[cfg(test)]
#[path = "automaton_tests.rs"]
mod tests;
