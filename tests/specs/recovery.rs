//! Restart recovery: the store is the canonical graph; deferred query
//! tokens are not.

use crate::prelude::*;
use gantry_adapters::FakeHost;
use gantry_core::{FakeClock, SequentialIdGen, StateKind, TargetId};
use gantry_daemon::config::AuthToken;
use gantry_daemon::protocol::{DownMessage, UpEnvelope, UpMessage, UpRequest};
use gantry_daemon::server::{Server, ServerSettings};
use gantry_engine::{Engine, EngineConfig};
use gantry_storage::{DatabaseParameters, TargetStore};
use std::sync::Arc;

#[tokio::test]
async fn a_new_engine_picks_up_where_the_old_one_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let params = DatabaseParameters::parse(dir.path().to_str().unwrap()).unwrap();

    // First life: run one target to completion, leave another passive.
    {
        let store = Arc::new(TargetStore::open(params.clone()).unwrap());
        let engine = Arc::new(Engine::new(
            store,
            FakeHost::new(),
            FakeClock::new(),
            SequentialIdGen::new("restart"),
            EngineConfig::default(),
        ));
        engine
            .submit_targets(vec![sh("finished", "true", true), sh("waiting", "true", false)])
            .unwrap();
        let mut idle = 0;
        for _ in 0..64 {
            if engine.run_step_batch().await.unwrap() == 0 {
                idle += 1;
                if idle >= 3 {
                    break;
                }
            } else {
                idle = 0;
            }
        }
        engine.store().flush().unwrap();
    }

    // Second life: same store directory, fresh engine.
    let store = Arc::new(TargetStore::open(params).unwrap());
    let engine = Arc::new(Engine::new(
        store,
        FakeHost::new(),
        FakeClock::new(),
        SequentialIdGen::new("restart"),
        EngineConfig::default(),
    ));

    let finished = engine.store().get(&TargetId::new("finished")).unwrap();
    assert_eq!(finished.state_kind(), StateKind::Successful);
    let waiting = engine.store().get(&TargetId::new("waiting")).unwrap();
    assert_eq!(waiting.state_kind(), StateKind::Passive);

    // The recovered passive target can still be driven.
    engine.kill_targets(&[TargetId::new("waiting")]).unwrap();
    let mut idle = 0;
    for _ in 0..32 {
        if engine.run_step_batch().await.unwrap() == 0 {
            idle += 1;
            if idle >= 3 {
                break;
            }
        } else {
            idle = 0;
        }
    }
    assert_eq!(
        engine
            .store()
            .get(&TargetId::new("waiting"))
            .unwrap()
            .state_kind(),
        StateKind::Dead
    );
}

#[tokio::test]
async fn deferred_tokens_die_with_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let params = DatabaseParameters::parse(dir.path().to_str().unwrap()).unwrap();
    let store = Arc::new(TargetStore::open(params).unwrap());
    let engine = Arc::new(Engine::new(
        store,
        FakeHost::new(),
        FakeClock::new(),
        SequentialIdGen::new("restart"),
        EngineConfig::default(),
    ));
    let settings = ServerSettings {
        tokens: vec![AuthToken {
            name: "specs".to_string(),
            secret: TOKEN.to_string(),
        }],
        read_only: false,
        return_error_messages: true,
        max_blocking_time_s: 5,
        database: "file:///spec".to_string(),
    };

    // A "restarted" server is simply a new Server over the same engine.
    let replacement = Server::new(Arc::clone(&engine), settings);
    let reply = replacement
        .process(UpEnvelope::V0(UpRequest {
            token: TOKEN.to_string(),
            message: UpMessage::GetDeferred {
                id: "token-from-previous-life".to_string(),
                index: 0,
                length: 10,
            },
        }))
        .await
        .into_current();
    assert_eq!(reply, DownMessage::MissingDeferred);
}
