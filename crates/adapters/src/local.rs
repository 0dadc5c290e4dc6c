// SPDX-License-Identifier: MIT

//! Local-machine executor: direct commands via `tokio::process`.
//!
//! Only handles `localhost`; remote transports (ssh, batch clusters) live
//! behind the same [`HostExecutor`] interface as external collaborators.
//! Long-running plugin processes are likewise not this executor's business.

use crate::host::{HostError, HostExecutor};
use async_trait::async_trait;
use gantry_core::{
    BuildProcess, Condition, ConditionTerm, Host, HostFailureKind, ProcessStatus, Program,
    RunHandle,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tracing::debug;

/// Bytes of stdout/stderr retained per run for diagnostic queries.
const CAPTURE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Finished(ProcessStatus),
}

struct ManagedRun {
    state: RunState,
    kill_tx: Option<oneshot::Sender<()>>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

/// Executor for direct commands on the engine's own machine.
#[derive(Clone, Default)]
pub struct LocalHost {
    runs: Arc<Mutex<HashMap<String, ManagedRun>>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_local(host: &Host, kind: HostFailureKind) -> Result<(), HostError> {
        if host.is_local() {
            Ok(())
        } else {
            Err(HostError {
                kind,
                message: format!(
                    "host {:?} is not reachable from the local executor",
                    host.as_str()
                ),
            })
        }
    }
}

#[async_trait]
impl HostExecutor for LocalHost {
    async fn check_condition(
        &self,
        host: &Host,
        condition: &Condition,
    ) -> Result<bool, HostError> {
        Self::require_local(host, HostFailureKind::Unix)?;
        eval_term(&condition.term)
    }

    async fn start(&self, host: &Host, process: &BuildProcess) -> Result<RunHandle, HostError> {
        Self::require_local(host, HostFailureKind::Start)?;
        let program = match process {
            BuildProcess::DirectCommand { program, .. } => program,
            BuildProcess::NoOperation => {
                return Err(HostError::start("no process to start for a no-operation target"))
            }
            BuildProcess::LongRunning { plugin, .. } => {
                return Err(HostError::start(format!(
                    "plugin {:?} is not handled by the local executor",
                    plugin
                )))
            }
        };

        let script = render_program(program);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HostError::start(format!("spawn failed: {}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture(stdout, Arc::clone(&stdout_buf)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture(stderr, Arc::clone(&stderr_buf)));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        self.runs.lock().insert(
            id.clone(),
            ManagedRun {
                state: RunState::Running,
                kill_tx: Some(kill_tx),
                stdout: stdout_buf,
                stderr: stderr_buf,
            },
        );

        let runs = Arc::clone(&self.runs);
        let run_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(s) if s.success() => ProcessStatus::FinishedSuccessfully,
                Ok(s) => ProcessStatus::FinishedWithFailure(match s.code() {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                }),
                Err(e) => ProcessStatus::FinishedWithFailure(format!("wait failed: {}", e)),
            };
            debug!(run = %run_id, outcome = ?outcome, "local process finished");

            if let Some(run) = runs.lock().get_mut(&run_id) {
                run.state = RunState::Finished(outcome);
                run.kill_tx = None;
            }
        });

        Ok(RunHandle {
            host: Host::local(),
            id,
            plugin: None,
        })
    }

    async fn probe(&self, handle: &RunHandle) -> Result<ProcessStatus, HostError> {
        let runs = self.runs.lock();
        match runs.get(&handle.id) {
            Some(run) => Ok(match &run.state {
                RunState::Running => ProcessStatus::StillRunning,
                RunState::Finished(status) => status.clone(),
            }),
            None => Err(HostError::probe(format!("unknown run handle {}", handle))),
        }
    }

    async fn kill(&self, handle: &RunHandle) -> Result<(), HostError> {
        let kill_tx = {
            let mut runs = self.runs.lock();
            match runs.get_mut(&handle.id) {
                Some(run) => match run.state {
                    RunState::Finished(_) => return Ok(()),
                    RunState::Running => run.kill_tx.take(),
                },
                None => {
                    return Err(HostError::kill(format!("unknown run handle {}", handle)))
                }
            }
        };
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn available_queries(&self, handle: &RunHandle) -> Vec<String> {
        if self.runs.lock().contains_key(&handle.id) {
            vec![
                "stdout".to_string(),
                "stderr".to_string(),
                "status".to_string(),
            ]
        } else {
            Vec::new()
        }
    }

    async fn call_query(&self, handle: &RunHandle, query: &str) -> Result<String, HostError> {
        let runs = self.runs.lock();
        let run = runs
            .get(&handle.id)
            .ok_or_else(|| HostError::unix(format!("unknown run handle {}", handle)))?;
        match query {
            "stdout" => Ok(String::from_utf8_lossy(&run.stdout.lock()).into_owned()),
            "stderr" => Ok(String::from_utf8_lossy(&run.stderr.lock()).into_owned()),
            "status" => Ok(match &run.state {
                RunState::Running => "still_running".to_string(),
                RunState::Finished(s) => format!("{:?}", s),
            }),
            other => Err(HostError::unix(format!("unknown query {:?}", other))),
        }
    }
}

/// Drain a child stream into a bounded buffer, discarding overflow so a
/// chatty process cannot grow the engine's memory.
async fn capture(mut stream: impl tokio::io::AsyncRead + Unpin, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut b = buf.lock();
                let room = CAPTURE_LIMIT.saturating_sub(b.len());
                let take = room.min(n);
                b.extend_from_slice(&chunk[..take]);
            }
        }
    }
}

/// Evaluate a condition term against the local filesystem.
///
/// A missing file is an unsatisfied condition, not an error; anything else
/// that goes wrong is a classified unix failure.
fn eval_term(term: &ConditionTerm) -> Result<bool, HostError> {
    match term {
        ConditionTerm::FileExists { path } => match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::unix(format!("stat {}: {}", path.display(), e))),
        },
        ConditionTerm::FileSizeAtLeast { path, min_bytes } => match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len() >= *min_bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::unix(format!("stat {}: {}", path.display(), e))),
        },
        ConditionTerm::AllOf(terms) => {
            for t in terms {
                if !eval_term(t)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Render a program to a single `sh -c` script.
fn render_program(program: &Program) -> String {
    match program {
        Program::Shell(script) => script.clone(),
        Program::Exec(args) => args
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" "),
        Program::Sequence(programs) => programs
            .iter()
            .map(|p| format!("( {} )", render_program(p)))
            .collect::<Vec<_>>()
            .join(" && "),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
