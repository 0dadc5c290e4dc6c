// SPDX-License-Identifier: MIT

//! Host addressing and the observable outcomes of host-side operations.
//!
//! The executor interface itself lives in `gantry-adapters`; these are the
//! wire- and store-serializable value types it exchanges with the automaton.

use serde::{Deserialize, Serialize};
use std::fmt;

crate::define_id! {
    /// Name of a host an operation runs on.
    ///
    /// `"localhost"` is the engine's own machine; anything else is resolved
    /// by the configured executor (ssh alias, batch cluster head node, ...).
    pub struct Host;
}

impl Host {
    /// The engine's own machine.
    pub fn local() -> Self {
        Self::new("localhost")
    }

    pub fn is_local(&self) -> bool {
        self.0 == "localhost" || self.0.is_empty()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::local()
    }
}

/// Handle to a process previously started through an executor.
///
/// Serializable so it survives in the target history across engine restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    pub host: Host,
    pub id: String,
    /// Plugin that owns the process for long-running build processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

impl fmt::Display for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin {
            Some(p) => write!(f, "{}:{}@{}", p, self.id, self.host),
            None => write!(f, "{}@{}", self.id, self.host),
        }
    }
}

/// What a process probe reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    StillRunning,
    FinishedSuccessfully,
    FinishedWithFailure(String),
}

/// Classification of an environmental (unix/ssh) failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFailureKind {
    Unix,
    Start,
    Probe,
    Kill,
}

impl fmt::Display for HostFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostFailureKind::Unix => write!(f, "unix_error"),
            HostFailureKind::Start => write!(f, "start_error"),
            HostFailureKind::Probe => write!(f, "probe_error"),
            HostFailureKind::Kill => write!(f, "kill_error"),
        }
    }
}

/// A classified environmental failure, fed to the automaton as an observation.
///
/// Whether it is a non-fatal retry or node-fatal is decided by the failure
/// policy, not by the failure itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailure {
    pub kind: HostFailureKind,
    pub message: String,
}

impl HostFailure {
    pub fn new(kind: HostFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for HostFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
