// SPDX-License-Identifier: MIT

use super::*;
use crate::host::RunHandle;
use crate::state::{SimpleStatus, StateKind};
use crate::test_support::{file_target, in_state, shell_target, with_deps};

#[test]
fn submission_materializes_passive() {
    let sub = TargetSubmission {
        id: TargetId::new("t1"),
        name: "build".to_string(),
        tags: vec!["nightly".to_string()],
        metadata: None,
        dependencies: vec![TargetId::new("dep")],
        if_fails_activate: vec![],
        equivalence: Equivalence::None,
        condition: None,
        build_process: BuildProcess::NoOperation,
        product: None,
        active: true,
    };
    let target = sub.into_target(1_234);
    assert_eq!(target.state_kind(), StateKind::Passive);
    assert_eq!(target.created_at_ms(), 1_234);
    assert_eq!(target.history.len(), 1);
    assert_eq!(target.history[0].cause, Cause::Submission);
}

#[test]
fn history_timestamps_are_clamped_monotonic() {
    let mut target = shell_target("a", "true");
    let born = target.created_at_ms();
    target.push_entry(StateEntry::new(
        TargetState::Activable,
        born.saturating_sub(500),
        Cause::ActivatedByUser,
    ));
    assert_eq!(target.status_changed_at_ms(), born);
    assert!(target
        .history
        .windows(2)
        .all(|w| w[0].at_ms <= w[1].at_ms));
}

#[test]
fn terminal_detection() {
    let alive = shell_target("a", "true");
    assert!(alive.is_alive());
    assert!(!alive.is_active());

    let active = in_state(shell_target("a", "true"), TargetState::Active);
    assert!(active.is_active());

    let done = in_state(shell_target("a", "true"), TargetState::Successful);
    assert!(done.is_terminal());
    assert!(!done.is_active());
    assert_eq!(done.finished_at_ms(), Some(done.status_changed_at_ms()));
}

#[test]
fn simple_status_mapping() {
    let passive = shell_target("a", "true");
    assert_eq!(passive.state_kind().simple(), SimpleStatus::Activable);

    let running = in_state(
        shell_target("a", "true"),
        TargetState::StartedRunning {
            handle: RunHandle {
                host: Host::local(),
                id: "r".to_string(),
                plugin: None,
            },
        },
    );
    assert_eq!(running.state_kind().simple(), SimpleStatus::InProgress);
    assert!(running.state_kind().really_running());

    let dead = in_state(
        shell_target("a", "true"),
        TargetState::Dead {
            reason: "boom".to_string(),
        },
    );
    assert_eq!(dead.state_kind().simple(), SimpleStatus::Failed);
    assert_eq!(dead.death_reason(), Some("boom"));
}

#[test]
fn equivalence_compares_make_and_condition() {
    let a = file_target("a", "make out", "/tmp/out");
    let b = file_target("b", "make out", "/tmp/out");
    assert!(a.equivalent_to(&b));
    assert!(b.equivalent_to(&a));

    let different_cmd = file_target("c", "make other", "/tmp/out");
    assert!(!a.equivalent_to(&different_cmd));

    let different_cond = file_target("d", "make out", "/tmp/elsewhere");
    assert!(!a.equivalent_to(&different_cond));
}

#[test]
fn equivalence_policy_is_the_candidates_alone() {
    let mut opted_out = file_target("a", "make out", "/tmp/out");
    opted_out.equivalence = Equivalence::None;
    let opted_in = file_target("b", "make out", "/tmp/out");

    // A candidate that opted out never matches anything.
    assert!(!opted_out.equivalent_to(&opted_in));
    // The other direction works: the stored target's own policy is
    // irrelevant when it is the match.
    assert!(opted_in.equivalent_to(&opted_out));
}

#[test]
fn execution_host_comes_from_the_build_process() {
    let mut target = shell_target("a", "true");
    assert!(target.execution_host().is_local());
    target.build_process = BuildProcess::DirectCommand {
        host: Host::new("worker3"),
        program: Program::shell("true"),
    };
    assert_eq!(target.execution_host(), Host::new("worker3"));
}

#[test]
fn target_serde_roundtrip() {
    let target = with_deps(file_target("f", "make f", "/tmp/f"), &["a", "b"]);
    let json = serde_json::to_string(&target).unwrap();
    let parsed: Target = serde_json::from_str(&json).unwrap();
    assert_eq!(target, parsed);
}

#[test]
fn program_serde_roundtrip() {
    let program = Program::Sequence(vec![
        Program::shell("mkdir -p /tmp/x"),
        Program::Exec(vec!["touch".to_string(), "/tmp/x/f".to_string()]),
    ]);
    let json = serde_json::to_string(&program).unwrap();
    let parsed: Program = serde_json::from_str(&json).unwrap();
    assert_eq!(program, parsed);
}
