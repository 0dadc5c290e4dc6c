// SPDX-License-Identifier: MIT

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::host::Host;
use crate::state::{Cause, StateEntry, TargetState};
use crate::target::{BuildProcess, Condition, Equivalence, Program, Target, TargetId};

/// A minimal passive target with a shell build process.
pub fn shell_target(id: &str, cmd: &str) -> Target {
    Target {
        id: TargetId::new(id),
        name: id.to_string(),
        tags: Vec::new(),
        metadata: None,
        dependencies: Vec::new(),
        if_fails_activate: Vec::new(),
        equivalence: Equivalence::None,
        condition: None,
        build_process: BuildProcess::DirectCommand {
            host: Host::local(),
            program: Program::shell(cmd),
        },
        history: vec![StateEntry::new(
            TargetState::Passive,
            1_000_000,
            Cause::Submission,
        )],
        product: None,
    }
}

/// A no-operation target (grouping node / condition-only node).
pub fn noop_target(id: &str) -> Target {
    Target {
        build_process: BuildProcess::NoOperation,
        ..shell_target(id, "true")
    }
}

/// A file target: shell command plus a file-exists condition, deduplicated
/// by make-and-condition.
pub fn file_target(id: &str, cmd: &str, path: &str) -> Target {
    Target {
        condition: Some(Condition::file_exists(Host::local(), path)),
        equivalence: Equivalence::SameMakeAndCondition,
        ..shell_target(id, cmd)
    }
}

/// Add dependencies to a target.
pub fn with_deps(mut target: Target, deps: &[&str]) -> Target {
    target.dependencies = deps.iter().map(|d| TargetId::new(*d)).collect();
    target
}

/// Add fallback branches to a target.
pub fn with_fallbacks(mut target: Target, fallbacks: &[&str]) -> Target {
    target.if_fails_activate = fallbacks.iter().map(|d| TargetId::new(*d)).collect();
    target
}

/// Force a target into a given state (appends a history entry).
pub fn in_state(mut target: Target, state: TargetState) -> Target {
    let at_ms = target.current().at_ms + 1;
    target.push_entry(StateEntry::new(state, at_ms, Cause::EngineStep));
    target
}
