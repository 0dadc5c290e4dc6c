// SPDX-License-Identifier: MIT

use super::*;
use crate::host::HostFailureKind;
use crate::test_support::{file_target, in_state, noop_target, shell_target, with_deps, with_fallbacks};

fn obs() -> Observations {
    Observations {
        now_ms: 2_000_000,
        ..Default::default()
    }
}

fn obs_with_deps(deps: &[(&str, DepState)]) -> Observations {
    Observations {
        deps: deps
            .iter()
            .map(|(id, s)| (TargetId::new(*id), *s))
            .collect(),
        ..obs()
    }
}

fn obs_with_outcome(outcome: CallOutcome) -> Observations {
    Observations {
        outcome: Some(outcome),
        ..obs()
    }
}

fn apply(target: &mut Target, step: &Step) {
    for entry in &step.entries {
        target.push_entry(entry.clone());
    }
}

fn kinds(step: &Step) -> Vec<StateKind> {
    step.entries.iter().map(|e| e.kind()).collect()
}

fn handle() -> RunHandle {
    RunHandle {
        host: Host::local(),
        id: "run-1".to_string(),
        plugin: None,
    }
}

fn probe_failure() -> HostFailure {
    HostFailure::new(HostFailureKind::Probe, "ssh: connection reset")
}

#[test]
fn passive_does_nothing_without_activation() {
    let target = shell_target("a", "true");
    let step = step(&target, &obs(), &FailurePolicy::default());
    assert!(step.is_empty());
}

#[test]
fn passive_activates_on_request() {
    let target = shell_target("a", "true");
    let o = Observations {
        activate: Some(Cause::ActivatedByUser),
        ..obs()
    };
    let s = step(&target, &o, &FailurePolicy::default());
    // No dependencies: activation resolves straight through to a start attempt.
    assert_eq!(
        kinds(&s),
        vec![
            StateKind::Activable,
            StateKind::Active,
            StateKind::Building,
            StateKind::TriedToStart,
        ]
    );
    assert!(matches!(s.actions[0], Action::StartProcess { .. }));
    assert_eq!(s.entries[0].cause, Cause::ActivatedByUser);
}

#[test]
fn activable_cascades_passive_dependencies() {
    let target = in_state(
        with_deps(shell_target("b", "true"), &["a"]),
        TargetState::Activable,
    );
    let o = obs_with_deps(&[("a", DepState::Passive)]);
    let s = step(&target, &o, &FailurePolicy::default());
    assert!(s.entries.is_empty());
    assert_eq!(
        s.actions,
        vec![Action::Activate {
            ids: vec![TargetId::new("a")],
            cause: Cause::DependencyOf(TargetId::new("b")),
        }]
    );
}

#[test]
fn activable_waits_on_in_progress_dependencies() {
    let target = in_state(
        with_deps(shell_target("b", "true"), &["a"]),
        TargetState::Activable,
    );
    let s = step(
        &target,
        &obs_with_deps(&[("a", DepState::InProgress)]),
        &FailurePolicy::default(),
    );
    assert!(s.is_empty());
}

#[test]
fn activable_advances_when_dependencies_successful() {
    let target = in_state(
        with_deps(shell_target("b", "true"), &["a"]),
        TargetState::Activable,
    );
    let s = step(
        &target,
        &obs_with_deps(&[("a", DepState::Successful)]),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s)[..2], [StateKind::Active, StateKind::Building]);
}

#[test]
fn duplicate_dependencies_behave_like_deduplicated_list() {
    let target = in_state(
        with_deps(shell_target("b", "true"), &["a", "a", "a"]),
        TargetState::Activable,
    );
    let s = step(
        &target,
        &obs_with_deps(&[("a", DepState::Successful)]),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s)[0], StateKind::Active);
}

#[test]
fn dependency_death_kills_target_and_activates_fallbacks() {
    let target = in_state(
        with_fallbacks(with_deps(shell_target("b", "true"), &["a"]), &["c"]),
        TargetState::Activable,
    );
    let s = step(
        &target,
        &obs_with_deps(&[("a", DepState::Dead)]),
        &FailurePolicy::default(),
    );
    assert_eq!(
        kinds(&s),
        vec![StateKind::FailedFromDependencies, StateKind::Dead]
    );
    assert_eq!(
        s.actions,
        vec![Action::Activate {
            ids: vec![TargetId::new("c")],
            cause: Cause::FallbackOf(TargetId::new("b")),
        }]
    );
    let dead = &s.entries[1];
    assert!(matches!(
        &dead.state,
        TargetState::Dead { reason } if reason.contains("a")
    ));
}

#[test]
fn condition_is_probed_before_running() {
    let target = in_state(file_target("f", "touch /tmp/f", "/tmp/f"), TargetState::Active);
    let s = step(&target, &obs(), &FailurePolicy::default());
    assert_eq!(kinds(&s), vec![StateKind::TriedToEvaluateCondition]);
    assert!(matches!(s.actions[0], Action::CheckCondition { .. }));
}

#[test]
fn satisfied_condition_short_circuits_to_success() {
    let target = in_state(
        file_target("f", "touch /tmp/f", "/tmp/f"),
        TargetState::TriedToEvaluateCondition,
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Condition(Ok(true))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::AlreadyDone, StateKind::Successful]);
    assert!(s.actions.is_empty());
}

#[test]
fn unsatisfied_condition_starts_the_build() {
    let target = in_state(
        file_target("f", "touch /tmp/f", "/tmp/f"),
        TargetState::TriedToEvaluateCondition,
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Condition(Ok(false))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::Building, StateKind::TriedToStart]);
    assert!(matches!(s.actions[0], Action::StartProcess { .. }));
}

#[test]
fn no_operation_without_condition_is_trivially_successful() {
    let target = in_state(noop_target("n"), TargetState::Active);
    let s = step(&target, &obs(), &FailurePolicy::default());
    assert_eq!(
        kinds(&s),
        vec![
            StateKind::Building,
            StateKind::RanSuccessfully,
            StateKind::VerifiedSuccess,
            StateKind::Successful,
        ]
    );
    assert!(s.actions.is_empty());
}

#[test]
fn successful_start_records_the_handle() {
    let target = in_state(shell_target("a", "true"), TargetState::TriedToStart);
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Start(Ok(handle()))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::StartedRunning]);
    assert!(matches!(
        &s.entries[0].state,
        TargetState::StartedRunning { handle } if handle.id == "run-1"
    ));
}

#[test]
fn running_target_is_probed() {
    let target = in_state(
        shell_target("a", "true"),
        TargetState::StartedRunning { handle: handle() },
    );
    let s = step(&target, &obs(), &FailurePolicy::default());
    assert_eq!(kinds(&s), vec![StateKind::TriedToCheckProcess]);
    assert_eq!(s.actions, vec![Action::ProbeProcess { handle: handle() }]);
}

#[test]
fn still_running_probe_cycles_back() {
    let target = in_state(
        shell_target("a", "true"),
        TargetState::TriedToCheckProcess { handle: handle() },
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Ok(ProcessStatus::StillRunning))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::StartedRunning]);
}

#[test]
fn finished_process_without_condition_succeeds() {
    let target = in_state(
        shell_target("a", "true"),
        TargetState::TriedToCheckProcess { handle: handle() },
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Ok(ProcessStatus::FinishedSuccessfully))),
        &FailurePolicy::default(),
    );
    assert_eq!(
        kinds(&s),
        vec![
            StateKind::RanSuccessfully,
            StateKind::VerifiedSuccess,
            StateKind::Successful,
        ]
    );
}

#[test]
fn process_failure_below_maximum_returns_to_active() {
    let policy = FailurePolicy {
        maximum_successive_attempts: 3,
        ..Default::default()
    };
    let target = in_state(
        shell_target("a", "false"),
        TargetState::TriedToCheckProcess { handle: handle() },
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Ok(ProcessStatus::FinishedWithFailure(
            "exit 1".to_string(),
        )))),
        &policy,
    );
    assert_eq!(kinds(&s), vec![StateKind::FailedRunning, StateKind::Active]);
    assert_eq!(s.entries[0].attempts, 1);
    assert_eq!(s.entries[0].error.as_deref(), Some("exit 1"));
}

#[test]
fn attempts_exhaustion_kills_the_target() {
    let policy = FailurePolicy {
        maximum_successive_attempts: 3,
        ..Default::default()
    };
    let mut target = shell_target("a", "false");
    target.push_entry(
        StateEntry::new(
            TargetState::TriedToCheckProcess { handle: handle() },
            1_500_000,
            Cause::EngineStep,
        )
        .with_attempts(2),
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Ok(ProcessStatus::FinishedWithFailure(
            "exit 1".to_string(),
        )))),
        &policy,
    );
    assert_eq!(kinds(&s), vec![StateKind::FailedRunning, StateKind::Dead]);
    assert_eq!(s.entries[0].attempts, 3);
    assert_eq!(s.entries[1].cause, Cause::AttemptsExhausted);
}

#[test]
fn environmental_failure_is_not_an_attempt_by_default() {
    let target = in_state(
        shell_target("a", "true"),
        TargetState::TriedToCheckProcess { handle: handle() },
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Err(probe_failure()))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::StartedRunning]);
    assert_eq!(s.entries[0].attempts, 0);
    assert!(s.entries[0].error.as_deref().unwrap().contains("probe_error"));
}

#[test]
fn environmental_failure_counts_when_policy_says_so() {
    let policy = FailurePolicy {
        maximum_successive_attempts: 1,
        turn_unix_ssh_failure_into_target_failure: true,
    };
    let target = in_state(
        shell_target("a", "true"),
        TargetState::TriedToCheckProcess { handle: handle() },
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Err(probe_failure()))),
        &policy,
    );
    assert_eq!(kinds(&s), vec![StateKind::Dead]);
    assert_eq!(s.entries[0].cause, Cause::AttemptsExhausted);
}

#[test]
fn kill_before_start_short_circuits_to_dead() {
    let target = in_state(
        with_fallbacks(shell_target("a", "true"), &["fb"]),
        TargetState::Active,
    );
    let o = Observations {
        kill_requested: true,
        ..obs()
    };
    let s = step(&target, &o, &FailurePolicy::default());
    assert_eq!(kinds(&s), vec![StateKind::Killed, StateKind::Dead]);
    assert_eq!(
        s.actions,
        vec![Action::Activate {
            ids: vec![TargetId::new("fb")],
            cause: Cause::FallbackOf(TargetId::new("a")),
        }]
    );
}

#[test]
fn kill_of_running_target_goes_through_the_kill_path() {
    let mut target = in_state(
        shell_target("a", "sleep 60"),
        TargetState::StartedRunning { handle: handle() },
    );
    let o = Observations {
        kill_requested: true,
        ..obs()
    };
    let s = step(&target, &o, &FailurePolicy::default());
    assert_eq!(kinds(&s), vec![StateKind::TriedToKill, StateKind::Killing]);
    assert_eq!(s.actions, vec![Action::KillProcess { handle: handle() }]);

    apply(&mut target, &s);
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Kill(Ok(()))),
        &FailurePolicy::default(),
    );
    assert_eq!(kinds(&s), vec![StateKind::Killed, StateKind::Dead]);
}

#[test]
fn orphan_kill_retry_keeps_the_orphan_cause() {
    // A transient kill failure returns the target to TriedToKill; the
    // retried Killing entry must still carry the sweep's cause.
    let target = in_state(
        shell_target("a", "sleep 60"),
        TargetState::TriedToKill { handle: handle() },
    );
    let o = Observations {
        kill_requested: true,
        orphan: true,
        ..obs()
    };
    let s = step(&target, &o, &FailurePolicy::default());
    assert_eq!(kinds(&s), vec![StateKind::Killing]);
    assert_eq!(s.entries[0].cause, Cause::OrphanSweep);
    assert_eq!(s.actions, vec![Action::KillProcess { handle: handle() }]);
}

#[test]
fn verification_failure_exhausts_attempts() {
    let target = in_state(
        file_target("f", "true", "/tmp/missing"),
        TargetState::RanSuccessfully,
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Condition(Ok(false))),
        &FailurePolicy::default(),
    );
    assert_eq!(
        kinds(&s),
        vec![StateKind::FailedToVerifySuccess, StateKind::Dead]
    );
}

#[test]
fn verification_success_finishes_the_target() {
    let target = in_state(
        file_target("f", "true", "/tmp/f"),
        TargetState::RanSuccessfully,
    );
    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Condition(Ok(true))),
        &FailurePolicy::default(),
    );
    assert_eq!(
        kinds(&s),
        vec![StateKind::VerifiedSuccess, StateKind::Successful]
    );
}

#[test]
fn terminal_targets_never_step() {
    for state in [
        TargetState::Successful,
        TargetState::Dead {
            reason: "done".to_string(),
        },
    ] {
        let target = in_state(shell_target("a", "true"), state);
        let o = Observations {
            kill_requested: true,
            activate: Some(Cause::ActivatedByUser),
            ..obs()
        };
        assert!(step(&target, &o, &FailurePolicy::default()).is_empty());
    }
}

#[test]
fn entries_are_timestamped_with_the_observation_clock() {
    let target = in_state(noop_target("n"), TargetState::Active);
    let s = step(&target, &obs(), &FailurePolicy::default());
    assert!(s.entries.iter().all(|e| e.at_ms == 2_000_000));
}

#[test]
fn full_linear_run_reaches_success() {
    // Drive a direct-command target from Passive to Successful by feeding
    // outcomes the way the driver would.
    let policy = FailurePolicy::default();
    let mut target = shell_target("a", "true");

    let o = Observations {
        activate: Some(Cause::ActivatedByUser),
        ..obs()
    };
    let s = step(&target, &o, &policy);
    apply(&mut target, &s);
    assert_eq!(target.state_kind(), StateKind::TriedToStart);

    let s = step(&target, &obs_with_outcome(CallOutcome::Start(Ok(handle()))), &policy);
    apply(&mut target, &s);
    assert_eq!(target.state_kind(), StateKind::StartedRunning);

    let s = step(&target, &obs(), &policy);
    apply(&mut target, &s);
    assert_eq!(target.state_kind(), StateKind::TriedToCheckProcess);

    let s = step(
        &target,
        &obs_with_outcome(CallOutcome::Probe(Ok(ProcessStatus::FinishedSuccessfully))),
        &policy,
    );
    apply(&mut target, &s);
    assert_eq!(target.state_kind(), StateKind::Successful);
    assert_eq!(target.attempts(), 0);
}
