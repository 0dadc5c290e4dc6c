// SPDX-License-Identifier: MIT

//! TCP listener and request dispatch.
//!
//! The listener accepts connections and handles one request per
//! connection without blocking the step driver. Dispatch translates
//! Up-messages into store queries and engine commands.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_adapters::HostExecutor;
use gantry_core::{Clock, IdGen, Target, TargetId, TargetState};
use gantry_engine::{Engine, EngineError};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{AuthToken, Profile};
use crate::protocol::{
    DownEnvelope, DownMessage, ProcessDown, ProcessUp, QueryOptions, ServerStatus,
    TargetFlatState, TargetSummary, TlsStatus, UpEnvelope, UpMessage,
};
use crate::protocol_wire::{self as wire, ProtocolError, DEFAULT_TIMEOUT, PROTOCOL_VERSION};

/// Result sets larger than this are deferred and paginated.
const DEFERRED_THRESHOLD: usize = 1000;

/// Deferred lists kept before the oldest is dropped.
const DEFERRED_CAPACITY: usize = 64;

/// Server-side behavior knobs, taken from the profile.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub tokens: Vec<AuthToken>,
    pub read_only: bool,
    pub return_error_messages: bool,
    pub max_blocking_time_s: u64,
    pub database: String,
}

impl ServerSettings {
    pub fn from_profile(profile: &Profile) -> Self {
        Self {
            tokens: profile.tokens.clone(),
            read_only: profile.read_only,
            return_error_messages: profile.return_error_messages,
            max_blocking_time_s: profile.max_blocking_time_s,
            database: profile.database.clone(),
        }
    }
}

/// Deferred id lists, bounded, dying with the process.
#[derive(Default)]
struct DeferredRegistry {
    order: VecDeque<String>,
    lists: HashMap<String, Vec<TargetId>>,
}

impl DeferredRegistry {
    fn insert(&mut self, ids: Vec<TargetId>) -> String {
        if self.order.len() >= DEFERRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.lists.remove(&oldest);
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        self.order.push_back(token.clone());
        self.lists.insert(token.clone(), ids);
        token
    }

    fn page(&self, id: &str, index: usize, length: usize) -> Option<Vec<TargetId>> {
        let list = self.lists.get(id)?;
        let start = index.min(list.len());
        let end = start.saturating_add(length).min(list.len());
        Some(list[start..end].to_vec())
    }

    fn len(&self) -> usize {
        self.lists.len()
    }
}

/// The protocol server.
pub struct Server<H: HostExecutor, C: Clock, G: IdGen> {
    engine: Arc<Engine<H, C, G>>,
    settings: ServerSettings,
    deferred: Mutex<DeferredRegistry>,
    start_time: Instant,
}

impl<H, C, G> Server<H, C, G>
where
    H: HostExecutor,
    C: Clock,
    G: IdGen,
{
    pub fn new(engine: Arc<Engine<H, C, G>>, settings: ServerSettings) -> Arc<Self> {
        Arc::new(Self {
            engine,
            settings,
            deferred: Mutex::new(DeferredRegistry::default()),
            start_time: Instant::now(),
        })
    }

    /// Accept loop; one spawned task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "client connected");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            match e {
                                ProtocolError::ConnectionClosed => debug!("client disconnected"),
                                ProtocolError::Timeout => warn!("connection timeout"),
                                _ => error!("connection error: {}", e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ProtocolError> {
        let (mut reader, mut writer) = stream.into_split();
        let envelope = wire::read_request(&mut reader, DEFAULT_TIMEOUT).await?;
        let response = self.process(envelope).await;
        wire::write_response(&mut writer, &response, DEFAULT_TIMEOUT).await
    }

    /// Authenticate and dispatch a request envelope.
    pub async fn process(&self, envelope: UpEnvelope) -> DownEnvelope {
        let request = envelope.into_current();
        if !self.authorized(&request.token) {
            warn!("request with invalid token rejected");
            return DownEnvelope::V0(DownMessage::Error {
                message: "invalid or missing token".to_string(),
            });
        }

        if matches!(request.message, UpMessage::GetTargetIds { .. }) {
            debug!(message = ?request.message, "dispatching query");
        } else {
            info!(message = ?request.message, "dispatching request");
        }
        DownEnvelope::V0(self.dispatch(request.message).await)
    }

    fn authorized(&self, token: &str) -> bool {
        // An empty token set means an open (unauthenticated) instance.
        self.settings.tokens.is_empty()
            || self.settings.tokens.iter().any(|t| t.secret == token)
    }

    fn error(&self, detail: impl std::fmt::Display) -> DownMessage {
        DownMessage::Error {
            message: if self.settings.return_error_messages {
                detail.to_string()
            } else {
                "request failed".to_string()
            },
        }
    }

    fn reject_in_read_only(&self) -> Option<DownMessage> {
        self.settings.read_only.then(|| DownMessage::Error {
            message: "server is in read-only mode".to_string(),
        })
    }

    async fn dispatch(&self, message: UpMessage) -> DownMessage {
        match message {
            UpMessage::GetTargets { ids } => match self.collect_targets(&ids) {
                Ok(targets) => DownMessage::ListOfTargets { targets },
                Err(e) => self.error(e),
            },

            UpMessage::GetTargetSummaries { ids } => match self.collect_targets(&ids) {
                Ok(targets) => DownMessage::ListOfTargetSummaries {
                    summaries: targets.iter().map(TargetSummary::of).collect(),
                },
                Err(e) => self.error(e),
            },

            UpMessage::GetTargetFlatStates { scope, ids, options } => {
                let result = self
                    .block_if_empty(options, || {
                        let targets = self.collect_targets(&ids)?;
                        let flat: Vec<TargetFlatState> = targets
                            .iter()
                            .map(|t| TargetFlatState::of(t, scope))
                            .filter(|f| !f.entries.is_empty())
                            .collect();
                        Ok(flat)
                    })
                    .await;
                match result {
                    Ok(flat) => DownMessage::ListOfTargetFlatStates { flat_states: flat },
                    Err(e) => self.error(e),
                }
            }

            UpMessage::GetAvailableQueries { id } => {
                match self.engine.available_queries(&id).await {
                    Ok(queries) => DownMessage::QueryResult { result: queries.join("\n") },
                    Err(e) => DownMessage::QueryError { error: e.to_string() },
                }
            }

            UpMessage::CallQuery { id, query } => {
                if let Some(reply) = self.reject_in_read_only() {
                    return reply;
                }
                match self.engine.call_query(&id, &query).await {
                    Ok(result) => DownMessage::QueryResult { result },
                    Err(e) => DownMessage::QueryError { error: e.to_string() },
                }
            }

            UpMessage::SubmitTargets { targets } => {
                if let Some(reply) = self.reject_in_read_only() {
                    return reply;
                }
                match self.engine.submit_targets(targets) {
                    Ok(mapping) => DownMessage::Submitted { mapping },
                    Err(e) => self.error(e),
                }
            }

            UpMessage::KillTargets { ids } => {
                if let Some(reply) = self.reject_in_read_only() {
                    return reply;
                }
                match self.engine.kill_targets(&ids) {
                    Ok(()) => DownMessage::Ok,
                    Err(e) => self.error(e),
                }
            }

            UpMessage::RestartTargets { ids } => {
                if let Some(reply) = self.reject_in_read_only() {
                    return reply;
                }
                match self.engine.restart_targets(&ids) {
                    Ok(mapping) => DownMessage::Submitted { mapping },
                    Err(e) => self.error(e),
                }
            }

            UpMessage::GetTargetIds { query, options } => {
                if let Err(e) = query.filter.validate() {
                    return self.error(format!("protocol error: {}", e));
                }
                let result = self
                    .block_if_empty(options, || {
                        let mut ids: Vec<TargetId> = self
                            .engine
                            .store()
                            .iter_all()
                            .iter()
                            .filter(|t| query.matches(t))
                            .map(|t| t.id.clone())
                            .collect();
                        ids.sort();
                        Ok(ids)
                    })
                    .await;
                match result {
                    Ok(ids) if ids.len() > DEFERRED_THRESHOLD => {
                        let total = ids.len();
                        let token = self.deferred.lock().insert(ids);
                        DownMessage::DeferredListOfTargetIds { id: token, total }
                    }
                    Ok(ids) => DownMessage::ListOfTargetIds { ids },
                    Err(e) => self.error(e),
                }
            }

            UpMessage::GetServerStatus => DownMessage::ServerStatus { status: self.status() },

            UpMessage::GetDeferred { id, index, length } => {
                match self.deferred.lock().page(&id, index, length) {
                    Some(ids) => DownMessage::ListOfTargetIds { ids },
                    None => DownMessage::MissingDeferred,
                }
            }

            UpMessage::Process { request: ProcessUp::ListRunning } => {
                let handles = self
                    .engine
                    .store()
                    .iter_active()
                    .iter()
                    .filter(|t| t.state_kind().really_running())
                    .filter_map(|t| match &t.current().state {
                        TargetState::StartedRunning { handle }
                        | TargetState::TriedToCheckProcess { handle } => Some(handle.clone()),
                        _ => None,
                    })
                    .collect();
                DownMessage::Process { response: ProcessDown::RunningHandles(handles) }
            }
        }
    }

    /// Fetch by ids; an empty list means every stored target.
    fn collect_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>, EngineError> {
        if ids.is_empty() {
            let mut all = self.engine.store().iter_all();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            return Ok(all);
        }
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            targets.push(self.engine.store().get(id)?);
        }
        Ok(targets)
    }

    /// Re-evaluate `produce` until it yields a non-empty result or the
    /// blocking window (bounded by `max_blocking_time_s`) closes. Wakes on
    /// engine progress; a match arriving early returns immediately.
    async fn block_if_empty<T>(
        &self,
        options: QueryOptions,
        produce: impl Fn() -> Result<Vec<T>, EngineError>,
    ) -> Result<Vec<T>, EngineError> {
        let first = produce()?;
        let wait_s = match options.block_if_empty_at_most {
            Some(s) if first.is_empty() => s.min(self.settings.max_blocking_time_s),
            _ => return Ok(first),
        };

        let deadline = Instant::now() + Duration::from_secs(wait_s);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let progress = self.engine.progress();
            tokio::select! {
                _ = progress.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
            let result = produce()?;
            if !result.is_empty() {
                return Ok(result);
            }
        }
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            time: chrono::Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_string(),
            read_only: self.settings.read_only,
            tls: TlsStatus::None,
            uptime_s: self.start_time.elapsed().as_secs(),
            database: self.settings.database.clone(),
            store: self.engine.store().stats(),
            engine: self.engine.counters(),
            engine_config: self.engine.config().clone(),
            deferred_queries: self.deferred.lock().len(),
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
