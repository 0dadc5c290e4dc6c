// SPDX-License-Identifier: MIT

//! Client wire protocol for the daemon.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. Every
//! payload is wrapped in a versioned envelope `{"V0": ...}`; readers accept
//! any known version, writers emit the current one.

use gantry_core::{
    SimpleStatus, StateKind, Target, TargetId, TargetQuery, TargetSubmission,
};
use gantry_engine::IdMapping;
use serde::{Deserialize, Serialize};

#[path = "protocol_status.rs"]
mod status;
pub use status::{ServerStatus, TlsStatus};

/// Versioned request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UpEnvelope {
    V0(UpRequest),
}

impl UpEnvelope {
    /// Unwrap whatever known version arrived.
    pub fn into_current(self) -> UpRequest {
        match self {
            UpEnvelope::V0(request) => request,
        }
    }
}

/// A request: authentication token plus the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpRequest {
    pub token: String,
    pub message: UpMessage,
}

/// Time scope of a flat-state query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlatStateScope {
    #[default]
    All,
    /// Entries at or after this epoch-millisecond stamp.
    Since(u64),
}

/// Options applying to list queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct QueryOptions {
    /// Wait up to this many seconds for a non-empty result before
    /// returning the empty one. Bounded by the server's
    /// `max_blocking_time_s`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_if_empty_at_most: Option<u64>,
}

/// Diagnostic process subprotocol (peripheral to the engine core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessUp {
    /// List run handles of targets with a live process.
    ListRunning,
}

/// Replies of the process subprotocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessDown {
    RunningHandles(Vec<gantry_core::RunHandle>),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpMessage {
    /// Fetch full targets; an empty id list means all.
    GetTargets {
        #[serde(default)]
        ids: Vec<TargetId>,
    },

    /// Fetch summaries; an empty id list means all.
    GetTargetSummaries {
        #[serde(default)]
        ids: Vec<TargetId>,
    },

    /// Fetch state histories, optionally restricted in time.
    GetTargetFlatStates {
        #[serde(default)]
        scope: FlatStateScope,
        #[serde(default)]
        ids: Vec<TargetId>,
        #[serde(default)]
        options: QueryOptions,
    },

    /// List the diagnostic queries available for a target.
    GetAvailableQueries { id: TargetId },

    /// Run a diagnostic query against a target.
    CallQuery { id: TargetId, query: String },

    /// Submit a batch of targets.
    SubmitTargets { targets: Vec<TargetSubmission> },

    /// Request kills; acknowledged immediately.
    KillTargets { ids: Vec<TargetId> },

    /// Restart terminal targets as fresh copies.
    RestartTargets { ids: Vec<TargetId> },

    /// Query target ids by time constraint and filter.
    GetTargetIds {
        query: TargetQuery,
        #[serde(default)]
        options: QueryOptions,
    },

    GetServerStatus,

    /// Page through a previously deferred id list.
    GetDeferred {
        id: String,
        index: usize,
        length: usize,
    },

    Process { request: ProcessUp },
}

/// Summary view of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub id: TargetId,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub state: StateKind,
    pub simple: SimpleStatus,
    #[serde(default)]
    pub dependencies: Vec<TargetId>,
    pub created_at_ms: u64,
    pub status_changed_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TargetSummary {
    pub fn of(target: &Target) -> Self {
        Self {
            id: target.id.clone(),
            name: target.name.clone(),
            tags: target.tags.clone(),
            state: target.state_kind(),
            simple: target.state_kind().simple(),
            dependencies: target.dependencies.clone(),
            created_at_ms: target.created_at_ms(),
            status_changed_at_ms: target.status_changed_at_ms(),
            error: target
                .current()
                .error
                .clone()
                .or_else(|| target.death_reason().map(|r| r.to_string())),
        }
    }
}

/// One history entry, flattened for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatStateEntry {
    pub at_ms: u64,
    pub state: StateKind,
    pub cause: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A target's (possibly time-filtered) state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFlatState {
    pub id: TargetId,
    pub entries: Vec<FlatStateEntry>,
}

impl TargetFlatState {
    pub fn of(target: &Target, scope: FlatStateScope) -> Self {
        let cutoff = match scope {
            FlatStateScope::All => 0,
            FlatStateScope::Since(t) => t,
        };
        Self {
            id: target.id.clone(),
            entries: target
                .history
                .iter()
                .filter(|e| e.at_ms >= cutoff)
                .map(|e| FlatStateEntry {
                    at_ms: e.at_ms,
                    state: e.kind(),
                    cause: e.cause.to_string(),
                    attempts: e.attempts,
                    error: e.error.clone(),
                })
                .collect(),
        }
    }
}

/// Response messages, mirroring the requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownMessage {
    ListOfTargets { targets: Vec<Target> },
    ListOfTargetSummaries { summaries: Vec<TargetSummary> },
    ListOfTargetFlatStates { flat_states: Vec<TargetFlatState> },
    ListOfTargetIds { ids: Vec<TargetId> },
    /// The result was large; page through it with `GetDeferred`.
    DeferredListOfTargetIds { id: String, total: usize },
    /// Id mapping of a submission or restart.
    Submitted { mapping: Vec<IdMapping> },
    QueryResult { result: String },
    QueryError { error: String },
    ServerStatus { status: ServerStatus },
    Ok,
    /// The deferred token expired (the server restarted); re-issue the query.
    MissingDeferred,
    Error { message: String },
    Process { response: ProcessDown },
}

/// Versioned response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DownEnvelope {
    V0(DownMessage),
}

impl DownEnvelope {
    pub fn into_current(self) -> DownMessage {
        match self {
            DownEnvelope::V0(message) => message,
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
