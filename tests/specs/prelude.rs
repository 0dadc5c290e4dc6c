//! Shared harness for the behavioral specs.

use gantry_adapters::FakeHost;
use gantry_core::{
    BuildProcess, Condition, Equivalence, FakeClock, Host, Program, SequentialIdGen, Target,
    TargetId, TargetSubmission,
};
use gantry_daemon::config::AuthToken;
use gantry_daemon::protocol::{DownMessage, UpEnvelope, UpMessage, UpRequest};
use gantry_daemon::server::{Server, ServerSettings};
use gantry_engine::{Engine, EngineConfig};
use gantry_storage::{DatabaseParameters, TargetStore};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN: &str = "spec-token";

pub type SpecEngine = Engine<FakeHost, FakeClock, SequentialIdGen>;
pub type SpecServer = Server<FakeHost, FakeClock, SequentialIdGen>;

pub struct Harness {
    pub engine: Arc<SpecEngine>,
    pub server: Arc<SpecServer>,
    pub host: FakeHost,
    pub clock: FakeClock,
    _dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let params = DatabaseParameters::parse(dir.path().to_str().unwrap()).unwrap();
    let store = Arc::new(TargetStore::open(params).unwrap());
    let host = FakeHost::new();
    let clock = FakeClock::new();
    let engine = Arc::new(Engine::new(
        store,
        host.clone(),
        clock.clone(),
        SequentialIdGen::new("restart"),
        config,
    ));
    let server = Server::new(
        Arc::clone(&engine),
        ServerSettings {
            tokens: vec![AuthToken {
                name: "specs".to_string(),
                secret: TOKEN.to_string(),
            }],
            read_only: false,
            return_error_messages: true,
            max_blocking_time_s: 5,
            database: "file:///spec".to_string(),
        },
    );
    Harness {
        engine,
        server,
        host,
        clock,
        _dir: dir,
    }
}

impl Harness {
    pub async fn call(&self, message: UpMessage) -> DownMessage {
        self.server
            .process(UpEnvelope::V0(UpRequest {
                token: TOKEN.to_string(),
                message,
            }))
            .await
            .into_current()
    }

    /// Run batches, advancing the fake clock one second between them,
    /// until the engine goes quiet.
    pub async fn drive(&self) {
        let mut idle = 0;
        for _ in 0..256 {
            let stepped = self.engine.run_step_batch().await.unwrap();
            self.clock.advance(Duration::from_secs(1));
            if stepped == 0 {
                idle += 1;
                if idle >= 3 {
                    return;
                }
            } else {
                idle = 0;
            }
        }
        panic!("engine did not settle within 256 batches");
    }

    /// Run a fixed number of batches (for scenarios that never settle).
    pub async fn run_batches(&self, n: usize) {
        for _ in 0..n {
            self.engine.run_step_batch().await.unwrap();
            self.clock.advance(Duration::from_secs(1));
        }
    }

    pub fn target(&self, id: &str) -> Target {
        self.engine.store().get(&TargetId::new(id)).unwrap()
    }
}

pub fn sh(id: &str, cmd: &str, active: bool) -> TargetSubmission {
    TargetSubmission {
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
        product: None,
        active,
    }
}

pub fn file_target(id: &str, cmd: &str, path: &str, active: bool) -> TargetSubmission {
    TargetSubmission {
        condition: Some(Condition::file_exists(Host::local(), path)),
        equivalence: Equivalence::SameMakeAndCondition,
        ..sh(id, cmd, active)
    }
}

pub fn long_running(id: &str, active: bool) -> TargetSubmission {
    TargetSubmission {
        build_process: BuildProcess::LongRunning {
            plugin: "daemonize".to_string(),
            payload: serde_json::json!({ "cmd": id }),
        },
        ..sh(id, "unused", active)
    }
}

pub fn with_deps(mut sub: TargetSubmission, deps: &[&str]) -> TargetSubmission {
    sub.dependencies = deps.iter().map(|d| TargetId::new(*d)).collect();
    sub
}

pub fn with_fallbacks(mut sub: TargetSubmission, fallbacks: &[&str]) -> TargetSubmission {
    sub.if_fails_activate = fallbacks.iter().map(|d| TargetId::new(*d)).collect();
    sub
}
