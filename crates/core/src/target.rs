// SPDX-License-Identifier: MIT

//! Target model: the unit of work the engine drives.

use crate::host::Host;
use crate::state::{Cause, StateEntry, StateKind, TargetState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

crate::define_id! {
    /// Unique identifier for a target.
    ///
    /// Assigned at submission and never reused or changed. All graph edges
    /// (dependencies, fallbacks) are id references into the store.
    pub struct TargetId;
}

/// A program an executor can run on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    /// Run through the host's shell.
    Shell(String),
    /// Exec an argv directly.
    Exec(Vec<String>),
    /// Run in order, stopping at the first failure.
    Sequence(Vec<Program>),
}

impl Program {
    pub fn shell(cmd: impl Into<String>) -> Self {
        Program::Shell(cmd.into())
    }
}

/// The prescription for doing a target's work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildProcess {
    /// Nothing to run; the target exists for its condition or as a grouping node.
    NoOperation,
    /// Short command run to completion on a host.
    DirectCommand { host: Host, program: Program },
    /// Process managed by a named plugin (daemonized job, batch submission, ...).
    LongRunning {
        plugin: String,
        payload: serde_json::Value,
    },
}

impl BuildProcess {
    /// Name for log spans (e.g. "direct_command").
    pub fn name(&self) -> &'static str {
        match self {
            BuildProcess::NoOperation => "no_operation",
            BuildProcess::DirectCommand { .. } => "direct_command",
            BuildProcess::LongRunning { .. } => "long_running",
        }
    }

    /// Host the process would run on, when one is named.
    pub fn host(&self) -> Option<&Host> {
        match self {
            BuildProcess::DirectCommand { host, .. } => Some(host),
            _ => None,
        }
    }
}

/// A predicate term probed on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTerm {
    FileExists { path: PathBuf },
    FileSizeAtLeast { path: PathBuf, min_bytes: u64 },
    AllOf(Vec<ConditionTerm>),
}

/// Ready-when predicate: the target is already done when this holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    pub host: Host,
    pub term: ConditionTerm,
}

impl Condition {
    pub fn file_exists(host: Host, path: impl Into<PathBuf>) -> Self {
        Self {
            host,
            term: ConditionTerm::FileExists { path: path.into() },
        }
    }
}

/// Policy controlling deduplication against other targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Equivalence {
    /// Never equivalent to anything.
    None,
    /// Equivalent when build process and condition match structurally.
    #[default]
    SameMakeAndCondition,
}

/// Descriptor of the artifact a target produces, for downstream queries.
/// The automaton itself never relies on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub host: Host,
    pub path: PathBuf,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Opaque to the engine; round-tripped to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Targets that must be `Successful` before this one runs.
    #[serde(default)]
    pub dependencies: Vec<TargetId>,
    /// Fallback branches activated exactly once if this target dies.
    #[serde(default)]
    pub if_fails_activate: Vec<TargetId>,
    #[serde(default)]
    pub equivalence: Equivalence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub build_process: BuildProcess,
    /// Full lifecycle history, append-only and monotonically timestamped.
    pub history: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Artifact>,
}

impl Target {
    /// Current (latest) history entry.
    ///
    /// The history is never empty: targets are born with a `Passive` entry.
    /// A hand-built empty history reads as freshly submitted.
    pub fn current(&self) -> &StateEntry {
        static BIRTH: StateEntry = StateEntry {
            state: TargetState::Passive,
            at_ms: 0,
            cause: Cause::Submission,
            attempts: 0,
            error: None,
        };
        self.history.last().unwrap_or(&BIRTH)
    }

    pub fn state_kind(&self) -> StateKind {
        StateKind::from(&self.current().state)
    }

    pub fn is_terminal(&self) -> bool {
        self.state_kind().is_terminal()
    }

    /// Non-terminal: still of interest to the driver or to activation.
    pub fn is_alive(&self) -> bool {
        !self.is_terminal()
    }

    /// Alive and activated: the driver evaluates it.
    pub fn is_active(&self) -> bool {
        self.is_alive() && self.state_kind() != StateKind::Passive
    }

    /// Current successive-failure attempt count.
    pub fn attempts(&self) -> u32 {
        self.current().attempts
    }

    /// Append a history entry, clamping its timestamp to keep the history
    /// monotonic even if the wall clock steps backwards.
    pub fn push_entry(&mut self, mut entry: StateEntry) {
        if let Some(last) = self.history.last() {
            if entry.at_ms < last.at_ms {
                entry.at_ms = last.at_ms;
            }
        }
        self.history.push(entry);
    }

    /// Epoch ms of the first history entry.
    pub fn created_at_ms(&self) -> u64 {
        self.history.first().map(|e| e.at_ms).unwrap_or(0)
    }

    /// Epoch ms of the latest history entry.
    pub fn status_changed_at_ms(&self) -> u64 {
        self.current().at_ms
    }

    /// Epoch ms of the terminal entry, if the target has finished.
    pub fn finished_at_ms(&self) -> Option<u64> {
        self.is_terminal().then(|| self.current().at_ms)
    }

    /// True when some history entry was caused by an explicit user activation.
    pub fn activated_by_user(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e.cause, Cause::ActivatedByUser))
    }

    /// True when the target died because of dead dependencies.
    pub fn dead_because_of_dependencies(&self) -> bool {
        self.is_terminal()
            && self
                .history
                .iter()
                .any(|e| matches!(e.state, TargetState::FailedFromDependencies { .. }))
    }

    /// Terminating cause string of a dead target.
    pub fn death_reason(&self) -> Option<&str> {
        match &self.current().state {
            TargetState::Dead { reason } => Some(reason),
            _ => None,
        }
    }

    /// Host a condition probe for this target runs on.
    pub fn condition_host(&self) -> Host {
        self.condition
            .as_ref()
            .map(|c| c.host.clone())
            .unwrap_or_default()
    }

    /// Host the build process executes on.
    pub fn execution_host(&self) -> Host {
        self.build_process.host().cloned().unwrap_or_default()
    }

    /// The pair equivalence compares: structural identity of the work.
    pub fn make_and_condition(&self) -> (&BuildProcess, Option<&Condition>) {
        (&self.build_process, self.condition.as_ref())
    }

    /// Structural equivalence against another target.
    ///
    /// Only this (the candidate's) policy gates the comparison; the other
    /// target's own policy is irrelevant when it is the dedup match.
    pub fn equivalent_to(&self, other: &Target) -> bool {
        match self.equivalence {
            Equivalence::None => false,
            Equivalence::SameMakeAndCondition => {
                self.make_and_condition() == other.make_and_condition()
            }
        }
    }
}

/// A target as submitted by a client: the descriptor plus the activation flag.
///
/// The engine materializes it into a [`Target`] born `Passive`, then activates
/// it when `active` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSubmission {
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<TargetId>,
    #[serde(default)]
    pub if_fails_activate: Vec<TargetId>,
    #[serde(default)]
    pub equivalence: Equivalence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    pub build_process: BuildProcess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Artifact>,
    /// Enqueue for activation right after submission.
    #[serde(default)]
    pub active: bool,
}

impl TargetSubmission {
    /// Materialize into a stored target born `Passive` at `now_ms`.
    pub fn into_target(self, now_ms: u64) -> Target {
        Target {
            id: self.id,
            name: self.name,
            tags: self.tags,
            metadata: self.metadata,
            dependencies: self.dependencies,
            if_fails_activate: self.if_fails_activate,
            equivalence: self.equivalence,
            condition: self.condition,
            build_process: self.build_process,
            history: vec![StateEntry::new(
                TargetState::Passive,
                now_ms,
                Cause::Submission,
            )],
            product: self.product,
        }
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
