// SPDX-License-Identifier: MIT

//! Scripted fake host executor for tests.

use crate::host::{HostError, HostExecutor};
use async_trait::async_trait;
use gantry_core::{BuildProcess, Condition, Host, ProcessStatus, Program, RunHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Recorded executor call.
#[derive(Debug, Clone)]
pub enum HostCall {
    CheckCondition { host: Host, condition: Condition },
    Start { host: Host, process: BuildProcess },
    Probe { handle: RunHandle },
    Kill { handle: RunHandle },
}

#[derive(Default)]
struct FakeHostState {
    calls: Vec<HostCall>,
    next_run: u64,
    /// handle id → script key of the process that produced it
    handles: HashMap<String, String>,
    condition_scripts: HashMap<String, VecDeque<Result<bool, HostError>>>,
    satisfied_conditions: HashMap<String, bool>,
    start_scripts: HashMap<String, VecDeque<Result<(), HostError>>>,
    probe_scripts: HashMap<String, VecDeque<Result<ProcessStatus, HostError>>>,
    kill_scripts: HashMap<String, VecDeque<Result<(), HostError>>>,
}

/// Fully scripted executor: per-process queues of condition answers, start
/// results, probe results, and kill results, with convention-based defaults
/// (`sh "true"` finishes successfully, `sh "false"` fails, long-running
/// processes stay running until scripted otherwise).
#[derive(Clone, Default)]
pub struct FakeHost {
    inner: Arc<Mutex<FakeHostState>>,
}

/// Script key of a build process: the rendered program for direct commands,
/// the plugin name for long-running processes.
pub fn process_key(process: &BuildProcess) -> String {
    match process {
        BuildProcess::NoOperation => "no_operation".to_string(),
        BuildProcess::DirectCommand { program, .. } => program_key(program),
        BuildProcess::LongRunning { plugin, .. } => format!("plugin:{}", plugin),
    }
}

fn program_key(program: &Program) -> String {
    match program {
        Program::Shell(script) => script.clone(),
        Program::Exec(args) => args.join(" "),
        Program::Sequence(programs) => programs
            .iter()
            .map(program_key)
            .collect::<Vec<_>>()
            .join(" && "),
    }
}

fn condition_key(condition: &Condition) -> String {
    serde_json::to_string(condition).unwrap_or_default()
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<HostCall> {
        self.inner.lock().calls.clone()
    }

    /// Number of start calls issued for a given process.
    pub fn starts_of(&self, process: &BuildProcess) -> usize {
        let key = process_key(process);
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, HostCall::Start { process, .. } if process_key(process) == key))
            .count()
    }

    /// Number of kill calls issued.
    pub fn kills(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, HostCall::Kill { .. }))
            .count()
    }

    /// Queue condition probe answers, consumed in order. When the queue is
    /// exhausted the condition falls back to [`FakeHost::satisfy_condition`]
    /// state (default: unsatisfied).
    pub fn script_condition(&self, condition: &Condition, results: Vec<Result<bool, HostError>>) {
        self.inner
            .lock()
            .condition_scripts
            .entry(condition_key(condition))
            .or_default()
            .extend(results);
    }

    /// Mark a condition as satisfied (or not) once scripted answers run out.
    pub fn satisfy_condition(&self, condition: &Condition, satisfied: bool) {
        self.inner
            .lock()
            .satisfied_conditions
            .insert(condition_key(condition), satisfied);
    }

    /// Queue start results for a process. `Ok(())` starts with a fresh handle.
    pub fn script_start(&self, process: &BuildProcess, results: Vec<Result<(), HostError>>) {
        self.inner
            .lock()
            .start_scripts
            .entry(process_key(process))
            .or_default()
            .extend(results);
    }

    /// Queue probe results for a process, consumed in order across its runs.
    pub fn script_probes(
        &self,
        process: &BuildProcess,
        results: Vec<Result<ProcessStatus, HostError>>,
    ) {
        self.inner
            .lock()
            .probe_scripts
            .entry(process_key(process))
            .or_default()
            .extend(results);
    }

    /// Queue kill results for a process.
    pub fn script_kills(&self, process: &BuildProcess, results: Vec<Result<(), HostError>>) {
        self.inner
            .lock()
            .kill_scripts
            .entry(process_key(process))
            .or_default()
            .extend(results);
    }

    fn default_probe(key: &str) -> ProcessStatus {
        if key.starts_with("plugin:") {
            ProcessStatus::StillRunning
        } else if key == "false" || key.ends_with("&& false") || key.starts_with("false") {
            ProcessStatus::FinishedWithFailure("exited with code 1".to_string())
        } else {
            ProcessStatus::FinishedSuccessfully
        }
    }
}

#[async_trait]
impl HostExecutor for FakeHost {
    async fn check_condition(
        &self,
        host: &Host,
        condition: &Condition,
    ) -> Result<bool, HostError> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::CheckCondition {
            host: host.clone(),
            condition: condition.clone(),
        });
        let key = condition_key(condition);
        if let Some(result) = inner
            .condition_scripts
            .get_mut(&key)
            .and_then(|q| q.pop_front())
        {
            return result;
        }
        Ok(inner.satisfied_conditions.get(&key).copied().unwrap_or(false))
    }

    async fn start(&self, host: &Host, process: &BuildProcess) -> Result<RunHandle, HostError> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::Start {
            host: host.clone(),
            process: process.clone(),
        });
        let key = process_key(process);
        if let Some(Err(e)) = inner.start_scripts.get_mut(&key).and_then(|q| q.pop_front()) {
            return Err(e);
        }
        inner.next_run += 1;
        let id = format!("fake-run-{}", inner.next_run);
        inner.handles.insert(id.clone(), key);
        Ok(RunHandle {
            host: host.clone(),
            id,
            plugin: match process {
                BuildProcess::LongRunning { plugin, .. } => Some(plugin.clone()),
                _ => None,
            },
        })
    }

    async fn probe(&self, handle: &RunHandle) -> Result<ProcessStatus, HostError> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::Probe {
            handle: handle.clone(),
        });
        let key = match inner.handles.get(&handle.id) {
            Some(key) => key.clone(),
            None => return Err(HostError::probe(format!("unknown run handle {}", handle))),
        };
        if let Some(result) = inner.probe_scripts.get_mut(&key).and_then(|q| q.pop_front()) {
            return result;
        }
        Ok(Self::default_probe(&key))
    }

    async fn kill(&self, handle: &RunHandle) -> Result<(), HostError> {
        let mut inner = self.inner.lock();
        inner.calls.push(HostCall::Kill {
            handle: handle.clone(),
        });
        let key = match inner.handles.get(&handle.id) {
            Some(key) => key.clone(),
            None => return Err(HostError::kill(format!("unknown run handle {}", handle))),
        };
        inner
            .kill_scripts
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(()))
    }

    async fn available_queries(&self, _handle: &RunHandle) -> Vec<String> {
        vec!["stdout".to_string()]
    }

    async fn call_query(&self, handle: &RunHandle, query: &str) -> Result<String, HostError> {
        match query {
            "stdout" => Ok(format!("fake output of {}", handle.id)),
            other => Err(HostError::unix(format!("unknown query {:?}", other))),
        }
    }
}
