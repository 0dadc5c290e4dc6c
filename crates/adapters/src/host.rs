// SPDX-License-Identifier: MIT

//! The host executor interface the automaton's side effects go through.

use async_trait::async_trait;
use gantry_core::{
    BuildProcess, Condition, Host, HostFailure, HostFailureKind, ProcessStatus, Program, RunHandle,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A classified failure from a host operation.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: HostFailureKind,
    pub message: String,
}

impl HostError {
    pub fn unix(message: impl Into<String>) -> Self {
        Self {
            kind: HostFailureKind::Unix,
            message: message.into(),
        }
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self {
            kind: HostFailureKind::Start,
            message: message.into(),
        }
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self {
            kind: HostFailureKind::Probe,
            message: message.into(),
        }
    }

    pub fn kill(message: impl Into<String>) -> Self {
        Self {
            kind: HostFailureKind::Kill,
            message: message.into(),
        }
    }

    /// The observation fed to the automaton.
    pub fn into_failure(self) -> HostFailure {
        HostFailure::new(self.kind, self.message)
    }
}

/// Capability set the automaton's side effects require.
///
/// Implementations cover one transport each: the in-tree [`LocalHost`]
/// spawns local processes; ssh and batch-system executors are external
/// collaborators behind the same interface.
///
/// [`LocalHost`]: crate::LocalHost
#[async_trait]
pub trait HostExecutor: Clone + Send + Sync + 'static {
    /// Probe a readiness condition on a host.
    async fn check_condition(&self, host: &Host, condition: &Condition)
        -> Result<bool, HostError>;

    /// Start a build process on a host.
    async fn start(&self, host: &Host, process: &BuildProcess) -> Result<RunHandle, HostError>;

    /// Probe a previously started process.
    async fn probe(&self, handle: &RunHandle) -> Result<ProcessStatus, HostError>;

    /// Kill a previously started process.
    async fn kill(&self, handle: &RunHandle) -> Result<(), HostError>;

    /// Names of the diagnostic queries available for a run.
    async fn available_queries(&self, handle: &RunHandle) -> Vec<String>;

    /// Run a diagnostic query against a run (e.g. `"stdout"`).
    async fn call_query(&self, handle: &RunHandle, query: &str) -> Result<String, HostError>;
}

/// Plan a file transfer: returns the host to run on and the program to run.
///
/// Same host degrades to `cp`; cross-host transfers are an `scp` executed on
/// the destination side. The caller wraps the program in a target.
pub fn plan_copy_files(
    src_host: &Host,
    files: &[PathBuf],
    dst_host: &Host,
    dest_dir: &Path,
) -> (Host, Program) {
    let dest = dest_dir.display().to_string();
    if src_host == dst_host {
        let mut args = vec!["cp".to_string(), "-R".to_string()];
        args.extend(files.iter().map(|f| f.display().to_string()));
        args.push(dest);
        (dst_host.clone(), Program::Exec(args))
    } else {
        let mut args = vec!["scp".to_string(), "-r".to_string()];
        args.extend(
            files
                .iter()
                .map(|f| format!("{}:{}", src_host.as_str(), f.display())),
        );
        args.push(dest);
        (dst_host.clone(), Program::Exec(args))
    }
}

/// Wrap an executor call with a timeout, classifying expiry as a failure of
/// the given kind. Timeouts never exceed the engine's configured upper bound.
pub async fn call_with_timeout<T>(
    kind: HostFailureKind,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, HostError>> + Send,
) -> Result<T, HostError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(HostError {
            kind,
            message: format!("timed out after {}s", timeout.as_secs()),
        }),
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
