// SPDX-License-Identifier: MIT

//! Target lifecycle states and the append-only state history.

use crate::host::RunHandle;
use crate::target::TargetId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a target.
///
/// `Successful` and `Dead` are terminal; a target in a terminal state never
/// transitions again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Known but not activated.
    Passive,
    /// Activated; dependencies not yet resolved.
    Activable,
    /// Ready to evaluate the next step.
    Active,
    /// Pre-run condition probe in flight.
    TriedToEvaluateCondition,
    /// Condition satisfied before running anything.
    AlreadyDone,
    /// Dependencies ensured; about to start.
    Building,
    /// Start call in flight.
    TriedToStart,
    /// Process is running under the given handle.
    StartedRunning { handle: RunHandle },
    /// Process probe in flight.
    TriedToCheckProcess { handle: RunHandle },
    /// Process reported success; condition re-check pending.
    RanSuccessfully,
    /// Condition satisfied after the run.
    VerifiedSuccess,
    /// Final success.
    Successful,
    /// Process reported failure.
    FailedRunning { reason: String },
    /// Process succeeded but the condition still does not hold.
    FailedToVerifySuccess,
    /// One or more dependencies are dead.
    FailedFromDependencies { dead: Vec<TargetId> },
    /// Kill requested for a running process.
    TriedToKill { handle: RunHandle },
    /// Kill call in flight.
    Killing { handle: RunHandle },
    /// Termination carried out.
    Killed,
    /// Final failure or kill.
    Dead { reason: String },
}

/// Tag-only variant of [`TargetState`] for summaries, filters, and indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Passive,
    Activable,
    Active,
    TriedToEvaluateCondition,
    AlreadyDone,
    Building,
    TriedToStart,
    StartedRunning,
    TriedToCheckProcess,
    RanSuccessfully,
    VerifiedSuccess,
    Successful,
    FailedRunning,
    FailedToVerifySuccess,
    FailedFromDependencies,
    TriedToKill,
    Killing,
    Killed,
    Dead,
}

impl From<&TargetState> for StateKind {
    fn from(s: &TargetState) -> Self {
        match s {
            TargetState::Passive => StateKind::Passive,
            TargetState::Activable => StateKind::Activable,
            TargetState::Active => StateKind::Active,
            TargetState::TriedToEvaluateCondition => StateKind::TriedToEvaluateCondition,
            TargetState::AlreadyDone => StateKind::AlreadyDone,
            TargetState::Building => StateKind::Building,
            TargetState::TriedToStart => StateKind::TriedToStart,
            TargetState::StartedRunning { .. } => StateKind::StartedRunning,
            TargetState::TriedToCheckProcess { .. } => StateKind::TriedToCheckProcess,
            TargetState::RanSuccessfully => StateKind::RanSuccessfully,
            TargetState::VerifiedSuccess => StateKind::VerifiedSuccess,
            TargetState::Successful => StateKind::Successful,
            TargetState::FailedRunning { .. } => StateKind::FailedRunning,
            TargetState::FailedToVerifySuccess => StateKind::FailedToVerifySuccess,
            TargetState::FailedFromDependencies { .. } => StateKind::FailedFromDependencies,
            TargetState::TriedToKill { .. } => StateKind::TriedToKill,
            TargetState::Killing { .. } => StateKind::Killing,
            TargetState::Killed => StateKind::Killed,
            TargetState::Dead { .. } => StateKind::Dead,
        }
    }
}

impl StateKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, StateKind::Successful | StateKind::Dead)
    }

    /// A live process exists for this target right now.
    pub fn really_running(self) -> bool {
        matches!(
            self,
            StateKind::StartedRunning | StateKind::TriedToCheckProcess
        )
    }

    /// Coarse four-way status for summaries and simple filters.
    pub fn simple(self) -> SimpleStatus {
        match self {
            StateKind::Passive | StateKind::Activable => SimpleStatus::Activable,
            StateKind::Successful => SimpleStatus::Successful,
            StateKind::Dead => SimpleStatus::Failed,
            _ => SimpleStatus::InProgress,
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Passive => "passive",
            StateKind::Activable => "activable",
            StateKind::Active => "active",
            StateKind::TriedToEvaluateCondition => "tried_to_evaluate_condition",
            StateKind::AlreadyDone => "already_done",
            StateKind::Building => "building",
            StateKind::TriedToStart => "tried_to_start",
            StateKind::StartedRunning => "started_running",
            StateKind::TriedToCheckProcess => "tried_to_check_process",
            StateKind::RanSuccessfully => "ran_successfully",
            StateKind::VerifiedSuccess => "verified_success",
            StateKind::Successful => "successful",
            StateKind::FailedRunning => "failed_running",
            StateKind::FailedToVerifySuccess => "failed_to_verify_success",
            StateKind::FailedFromDependencies => "failed_from_dependencies",
            StateKind::TriedToKill => "tried_to_kill",
            StateKind::Killing => "killing",
            StateKind::Killed => "killed",
            StateKind::Dead => "dead",
        };
        write!(f, "{}", name)
    }
}

/// Coarse status used by summaries and the `Simple` filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleStatus {
    Activable,
    InProgress,
    Successful,
    Failed,
}

impl fmt::Display for SimpleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimpleStatus::Activable => write!(f, "activable"),
            SimpleStatus::InProgress => write!(f, "in_progress"),
            SimpleStatus::Successful => write!(f, "successful"),
            SimpleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    /// Initial `Passive` entry written at submission.
    Submission,
    /// Explicit activation by a client.
    ActivatedByUser,
    /// Activated because an active target depends on it.
    DependencyOf(TargetId),
    /// Activated as a failure fallback of a dying target.
    FallbackOf(TargetId),
    /// Ordinary automaton progress.
    EngineStep,
    /// A client asked for this target to be killed.
    KillRequest,
    /// A dependency reached `Dead`.
    DependencyDeath(TargetId),
    /// Successive failures reached the configured maximum.
    AttemptsExhausted,
    /// Reclaimed by the orphan sweep.
    OrphanSweep,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Submission => write!(f, "submission"),
            Cause::ActivatedByUser => write!(f, "activated by user"),
            Cause::DependencyOf(id) => write!(f, "dependency of {}", id),
            Cause::FallbackOf(id) => write!(f, "fallback of {}", id),
            Cause::EngineStep => write!(f, "engine step"),
            Cause::KillRequest => write!(f, "kill request"),
            Cause::DependencyDeath(id) => write!(f, "death of dependency {}", id),
            Cause::AttemptsExhausted => write!(f, "attempts exhausted"),
            Cause::OrphanSweep => write!(f, "orphan sweep"),
        }
    }
}

/// One entry of the append-only state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: TargetState,
    pub at_ms: u64,
    pub cause: Cause,
    /// Successive-failure attempt count at the time of this entry.
    #[serde(default)]
    pub attempts: u32,
    /// Last environmental or process error, when one triggered the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateEntry {
    pub fn new(state: TargetState, at_ms: u64, cause: Cause) -> Self {
        Self {
            state,
            at_ms,
            cause,
            attempts: 0,
            error: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn kind(&self) -> StateKind {
        StateKind::from(&self.state)
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
