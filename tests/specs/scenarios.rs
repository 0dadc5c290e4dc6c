//! The six literal end-to-end scenarios, driven through the protocol.

use crate::prelude::*;
use gantry_adapters::HostError;
use gantry_core::{Cause, ProcessStatus, StateKind, TargetId};
use gantry_daemon::protocol::{DownMessage, UpMessage};
use gantry_engine::EngineConfig;

#[tokio::test]
async fn linear_dag_finishes_in_order() {
    let h = harness();
    let reply = h
        .call(UpMessage::SubmitTargets {
            targets: vec![sh("a", "true", true), with_deps(sh("b", "true", true), &["a"])],
        })
        .await;
    assert!(matches!(reply, DownMessage::Submitted { .. }));

    h.drive().await;

    let a = h.target("a");
    let b = h.target("b");
    assert_eq!(a.state_kind(), StateKind::Successful);
    assert_eq!(b.state_kind(), StateKind::Successful);
    assert!(a.finished_at_ms().unwrap() < b.finished_at_ms().unwrap());
}

#[tokio::test]
async fn failure_cascade_runs_the_fallback_branch() {
    let h = harness();
    h.call(UpMessage::SubmitTargets {
        targets: vec![
            sh("a", "false", true),
            with_fallbacks(with_deps(sh("b", "true", true), &["a"]), &["c"]),
            sh("c", "true", false),
        ],
    })
    .await;

    h.drive().await;

    assert_eq!(h.target("a").state_kind(), StateKind::Dead);
    let b = h.target("b");
    assert_eq!(b.state_kind(), StateKind::Dead);
    assert!(b.dead_because_of_dependencies());
    assert_eq!(h.target("c").state_kind(), StateKind::Successful);
}

#[tokio::test]
async fn environmental_probe_errors_do_not_count_as_attempts() {
    let h = harness();
    let submission = sh("flaky", "do-work", true);
    h.host.script_probes(
        &submission.build_process,
        vec![
            Err(HostError::probe("connection reset")),
            Err(HostError::probe("connection reset")),
            Ok(ProcessStatus::FinishedSuccessfully),
        ],
    );
    h.call(UpMessage::SubmitTargets {
        targets: vec![submission],
    })
    .await;

    h.drive().await;

    let flaky = h.target("flaky");
    assert_eq!(flaky.state_kind(), StateKind::Successful);
    assert_eq!(flaky.current().attempts, 0);
}

#[tokio::test]
async fn attempts_are_exhausted_after_three_failures() {
    let h = harness_with(EngineConfig {
        policy: gantry_core::FailurePolicy {
            maximum_successive_attempts: 3,
            turn_unix_ssh_failure_into_target_failure: false,
        },
        ..Default::default()
    });
    let submission = long_running("stubborn", true);
    h.host.script_probes(
        &submission.build_process,
        vec![
            Ok(ProcessStatus::FinishedWithFailure("exited with code 1".into())),
            Ok(ProcessStatus::FinishedWithFailure("exited with code 1".into())),
            Ok(ProcessStatus::FinishedWithFailure("exited with code 1".into())),
        ],
    );
    h.call(UpMessage::SubmitTargets {
        targets: vec![submission],
    })
    .await;

    h.drive().await;

    let stubborn = h.target("stubborn");
    assert_eq!(stubborn.state_kind(), StateKind::Dead);
    assert_eq!(
        stubborn
            .history
            .iter()
            .filter(|e| e.kind() == StateKind::FailedRunning)
            .count(),
        3
    );
}

#[tokio::test]
async fn equivalent_file_targets_collapse_to_one() {
    let h = harness();
    let first = h
        .call(UpMessage::SubmitTargets {
            targets: vec![file_target("one", "make out", "/tmp/out", false)],
        })
        .await;
    let DownMessage::Submitted { mapping } = first else {
        panic!("expected Submitted, got {first:?}");
    };
    assert_eq!(mapping[0].stored, TargetId::new("one"));

    let second = h
        .call(UpMessage::SubmitTargets {
            targets: vec![file_target("two", "make out", "/tmp/out", false)],
        })
        .await;
    let DownMessage::Submitted { mapping } = second else {
        panic!("expected Submitted, got {second:?}");
    };
    // Both submissions resolve to the same canonical id.
    assert_eq!(mapping[0].stored, TargetId::new("one"));
    assert_eq!(h.engine.store().stats().total, 1);
}

#[tokio::test]
async fn kill_of_a_running_target_walks_the_kill_path() {
    let h = harness();
    h.call(UpMessage::SubmitTargets {
        targets: vec![
            with_fallbacks(long_running("runner", true), &["cleanup"]),
            sh("cleanup", "true", false),
        ],
    })
    .await;

    h.run_batches(6).await;
    assert!(h.target("runner").state_kind().really_running());

    let reply = h
        .call(UpMessage::KillTargets {
            ids: vec![TargetId::new("runner")],
        })
        .await;
    assert_eq!(reply, DownMessage::Ok);

    h.drive().await;

    let runner = h.target("runner");
    assert_eq!(runner.state_kind(), StateKind::Dead);
    let kinds: Vec<StateKind> = runner.history.iter().map(|e| e.kind()).collect();
    let kill_start = kinds
        .iter()
        .position(|k| *k == StateKind::TriedToKill)
        .expect("kill path started");
    assert_eq!(
        &kinds[kill_start..],
        &[
            StateKind::TriedToKill,
            StateKind::Killing,
            StateKind::Killed,
            StateKind::Dead,
        ]
    );

    // The fallback was activated exactly once.
    let cleanup = h.target("cleanup");
    assert_eq!(cleanup.state_kind(), StateKind::Successful);
    assert_eq!(
        cleanup
            .history
            .iter()
            .filter(|e| matches!(e.cause, Cause::FallbackOf(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn terminal_targets_never_transition_again() {
    let h = harness();
    h.call(UpMessage::SubmitTargets {
        targets: vec![sh("done", "true", true)],
    })
    .await;
    h.drive().await;
    let before = h.target("done");
    assert_eq!(before.state_kind(), StateKind::Successful);

    // Kill and restart requests leave the terminal history untouched.
    h.call(UpMessage::KillTargets {
        ids: vec![TargetId::new("done")],
    })
    .await;
    h.call(UpMessage::RestartTargets {
        ids: vec![TargetId::new("done")],
    })
    .await;
    h.drive().await;

    assert_eq!(h.target("done").history, before.history);
}

#[tokio::test]
async fn restart_of_a_dead_target_drives_a_fresh_copy() {
    let h = harness();
    h.call(UpMessage::SubmitTargets {
        targets: vec![sh("brittle", "false", true)],
    })
    .await;
    h.drive().await;
    assert_eq!(h.target("brittle").state_kind(), StateKind::Dead);

    let reply = h
        .call(UpMessage::RestartTargets {
            ids: vec![TargetId::new("brittle")],
        })
        .await;
    let DownMessage::Submitted { mapping } = reply else {
        panic!("expected Submitted, got {reply:?}");
    };
    let fresh = mapping[0].stored.clone();
    assert_ne!(fresh, TargetId::new("brittle"));

    // The copy fails the same way, but it ran: it has its own history.
    h.drive().await;
    let fresh = h.engine.store().get(&fresh).unwrap();
    assert_eq!(fresh.state_kind(), StateKind::Dead);
    assert!(fresh.activated_by_user());
}

#[tokio::test]
async fn histories_are_append_only_and_time_ordered() {
    let h = harness();
    h.call(UpMessage::SubmitTargets {
        targets: vec![
            sh("a", "true", true),
            with_deps(sh("b", "false", true), &["a"]),
        ],
    })
    .await;
    h.drive().await;

    for id in ["a", "b"] {
        let target = h.target(id);
        assert!(target
            .history
            .windows(2)
            .all(|w| w[0].at_ms <= w[1].at_ms));
        assert!(target.is_terminal());
    }
}
