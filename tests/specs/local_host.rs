//! One suite against real local processes instead of the scripted host.

use crate::prelude::{sh, with_deps};
use gantry_adapters::LocalHost;
use gantry_core::{Condition, Host, StateKind, SystemClock, TargetId, UuidIdGen};
use gantry_engine::{Engine, EngineConfig};
use gantry_storage::{DatabaseParameters, TargetStore};
use std::sync::Arc;
use std::time::Duration;

type RealEngine = Engine<LocalHost, SystemClock, UuidIdGen>;

fn real_engine(dir: &std::path::Path) -> Arc<RealEngine> {
    let params = DatabaseParameters::parse(dir.to_str().unwrap()).unwrap();
    let store = Arc::new(TargetStore::open(params).unwrap());
    Arc::new(Engine::new(
        store,
        LocalHost::new(),
        SystemClock,
        UuidIdGen,
        EngineConfig::default(),
    ))
}

async fn drive_until_terminal(engine: &Arc<RealEngine>, ids: &[&str]) {
    for _ in 0..500 {
        engine.run_step_batch().await.unwrap();
        let all_terminal = ids.iter().all(|id| {
            engine
                .store()
                .get(&TargetId::new(*id))
                .map(|t| t.is_terminal())
                .unwrap_or(false)
        });
        if all_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("targets did not finish in time");
}

#[tokio::test]
async fn real_processes_run_a_linear_dag() {
    let dir = tempfile::tempdir().unwrap();
    let engine = real_engine(dir.path());
    let marker = dir.path().join("a-ran");

    engine
        .submit_targets(vec![
            sh("a", &format!("touch {}", marker.display()), true),
            with_deps(sh("b", "true", true), &["a"]),
        ])
        .unwrap();

    drive_until_terminal(&engine, &["a", "b"]).await;

    assert!(marker.exists());
    for id in ["a", "b"] {
        assert_eq!(
            engine.store().get(&TargetId::new(id)).unwrap().state_kind(),
            StateKind::Successful
        );
    }
}

#[tokio::test]
async fn a_satisfied_condition_short_circuits_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = real_engine(dir.path());
    let artifact = dir.path().join("already-there");
    std::fs::write(&artifact, b"built earlier").unwrap();

    let mut submission = sh("cached", "exit 42", true);
    submission.condition = Some(Condition::file_exists(Host::local(), &artifact));
    engine.submit_targets(vec![submission]).unwrap();

    drive_until_terminal(&engine, &["cached"]).await;

    let cached = engine.store().get(&TargetId::new("cached")).unwrap();
    assert_eq!(cached.state_kind(), StateKind::Successful);
    // The command never ran: the pre-run probe already held.
    assert!(cached
        .history
        .iter()
        .any(|e| e.kind() == StateKind::AlreadyDone));
    assert!(!cached
        .history
        .iter()
        .any(|e| e.kind() == StateKind::StartedRunning));
}

#[tokio::test]
async fn a_failing_command_leaves_a_dead_target_with_the_reason() {
    let dir = tempfile::tempdir().unwrap();
    let engine = real_engine(dir.path());
    engine.submit_targets(vec![sh("broken", "exit 7", true)]).unwrap();

    drive_until_terminal(&engine, &["broken"]).await;

    let broken = engine.store().get(&TargetId::new("broken")).unwrap();
    assert_eq!(broken.state_kind(), StateKind::Dead);
    assert_eq!(broken.death_reason(), Some("exited with code 7"));
}
