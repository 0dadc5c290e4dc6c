// SPDX-License-Identifier: MIT

//! Server status payload.

use gantry_engine::{EngineConfig, EngineCounters};
use gantry_storage::StoreStats;
use serde::{Deserialize, Serialize};

/// Which TLS flavor terminates client connections.
///
/// This daemon always listens plain (`None`); termination is an external
/// collaborator's job even when certificates appear in the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsStatus {
    OpenSsl,
    Native,
    None,
}

/// Reply to `GetServerStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// RFC 3339 server time.
    pub time: String,
    pub version: String,
    pub read_only: bool,
    pub tls: TlsStatus,
    pub uptime_s: u64,
    /// The configured database parameters.
    pub database: String,
    pub store: StoreStats,
    pub engine: EngineCounters,
    pub engine_config: EngineConfig,
    /// Deferred id lists currently held for pagination.
    pub deferred_queries: usize,
}
