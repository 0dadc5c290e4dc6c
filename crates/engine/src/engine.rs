// SPDX-License-Identifier: MIT

//! The engine: owns the store, executor, and driver bookkeeping.
//!
//! Submission (with equivalence dedup and cycle rejection), kill and
//! restart requests live here; the batched step loop is in `driver.rs`.

use crate::{EngineConfig, EngineError};
use gantry_adapters::HostExecutor;
use gantry_core::{Cause, Clock, IdGen, Target, TargetId, TargetSubmission};
use gantry_storage::{StoreError, TargetStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{info, warn};

/// One submitted-id → canonical-id association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub submitted: TargetId,
    pub stored: TargetId,
}

/// Driver counters reported in server status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub batches: u64,
    pub steps: u64,
    pub orphan_sweeps: u64,
}

/// The workflow engine. Single writer to its store.
pub struct Engine<H: HostExecutor, C: Clock, G: IdGen> {
    pub(crate) store: Arc<TargetStore>,
    pub(crate) executor: H,
    pub(crate) clock: C,
    pub(crate) idgen: G,
    pub(crate) config: EngineConfig,
    /// Ids with a pending kill request, observed at their next step.
    pub(crate) kills: Mutex<HashSet<TargetId>>,
    /// Ids condemned by the orphan sweep.
    pub(crate) orphans: Mutex<HashSet<TargetId>>,
    /// Passive ids waiting for activation, with the activation cause.
    pub(crate) pending_activations: Mutex<HashMap<TargetId, Cause>>,
    /// Per-id dispatch guard: at most one step in flight per target.
    pub(crate) in_flight: Mutex<HashSet<TargetId>>,
    /// Notified after every committed transition; wakes blocking queries
    /// and the idle driver.
    pub(crate) progress: Arc<Notify>,
    pub(crate) counters: Mutex<EngineCounters>,
    pub(crate) last_orphan_sweep: Mutex<Option<Instant>>,
}

impl<H, C, G> Engine<H, C, G>
where
    H: HostExecutor,
    C: Clock,
    G: IdGen,
{
    pub fn new(
        store: Arc<TargetStore>,
        executor: H,
        clock: C,
        idgen: G,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            idgen,
            config,
            kills: Mutex::new(HashSet::new()),
            orphans: Mutex::new(HashSet::new()),
            pending_activations: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            progress: Arc::new(Notify::new()),
            counters: Mutex::new(EngineCounters::default()),
            last_orphan_sweep: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> EngineCounters {
        *self.counters.lock()
    }

    /// Handle to the progress notifier (blocking queries wait on it).
    pub fn progress(&self) -> Arc<Notify> {
        Arc::clone(&self.progress)
    }

    /// Submit a batch of targets.
    ///
    /// In submission order, each target is deduplicated against the alive
    /// set (and against earlier targets of the same batch); dependency and
    /// fallback references to collapsed ids are rewritten. Cycles are
    /// rejected before anything is committed. Returns the id mapping.
    pub fn submit_targets(
        &self,
        submissions: Vec<TargetSubmission>,
    ) -> Result<Vec<IdMapping>, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut mapping: HashMap<TargetId, TargetId> = HashMap::new();
        let mut order: Vec<IdMapping> = Vec::new();
        // (materialized target, wants activation)
        let mut accepted: Vec<(Target, bool)> = Vec::new();

        for mut sub in submissions {
            sub.dependencies = sub
                .dependencies
                .iter()
                .map(|d| mapping.get(d).unwrap_or(d).clone())
                .collect();
            sub.if_fails_activate = sub
                .if_fails_activate
                .iter()
                .map(|d| mapping.get(d).unwrap_or(d).clone())
                .collect();

            let submitted_id = sub.id.clone();
            let active = sub.active;
            let candidate = sub.into_target(now_ms);

            // Dedup against the stored alive set, then within this batch.
            let existing = self.store.find_equivalent(&candidate).or_else(|| {
                accepted
                    .iter()
                    .find(|(t, _)| candidate.equivalent_to(t))
                    .map(|(t, _)| t.id.clone())
            });
            if let Some(canonical) = existing {
                info!(submitted = %submitted_id, canonical = %canonical, "submission collapsed onto equivalent target");
                mapping.insert(submitted_id.clone(), canonical.clone());
                order.push(IdMapping {
                    submitted: submitted_id,
                    stored: canonical.clone(),
                });
                if active {
                    self.request_activation(canonical, Cause::ActivatedByUser);
                }
                continue;
            }

            // Re-submission of a known id: idempotent when the descriptor
            // matches, a conflict otherwise.
            if let Ok(stored) = self.store.get(&candidate.id) {
                if !same_descriptor(&stored, &candidate) {
                    return Err(EngineError::Store(StoreError::Conflict(candidate.id)));
                }
                mapping.insert(submitted_id.clone(), submitted_id.clone());
                order.push(IdMapping {
                    submitted: submitted_id.clone(),
                    stored: submitted_id,
                });
                if active {
                    self.request_activation(candidate.id, Cause::ActivatedByUser);
                }
                continue;
            }

            mapping.insert(submitted_id.clone(), submitted_id.clone());
            order.push(IdMapping {
                submitted: submitted_id.clone(),
                stored: submitted_id,
            });
            accepted.push((candidate, active));
        }

        self.reject_cycles(&accepted)?;

        for (target, active) in accepted {
            let id = target.id.clone();
            self.store.put(target)?;
            if active {
                self.request_activation(id, Cause::ActivatedByUser);
            }
        }
        self.progress.notify_waiters();
        Ok(order)
    }

    /// Request a kill for each id; acknowledged immediately, the state
    /// transition happens within one batch. Unknown ids are an error.
    pub fn kill_targets(&self, ids: &[TargetId]) -> Result<(), EngineError> {
        for id in ids {
            if !self.store.contains(id) {
                return Err(EngineError::Store(StoreError::NotFound(id.clone())));
            }
        }
        let mut kills = self.kills.lock();
        for id in ids {
            kills.insert(id.clone());
        }
        drop(kills);
        self.progress.notify_waiters();
        Ok(())
    }

    /// Restart targets: a terminal target is reborn as a fresh copy (new
    /// id, same descriptor) which is then activated; a target still being
    /// driven maps to itself. Returns old-id → driven-id pairs.
    pub fn restart_targets(&self, ids: &[TargetId]) -> Result<Vec<IdMapping>, EngineError> {
        let now_ms = self.clock.epoch_ms();
        let mut mapping = Vec::new();
        for id in ids {
            let old = self.store.get(id)?;
            if old.is_alive() {
                warn!(target = %id, "restart of a non-terminal target is a no-op");
                mapping.push(IdMapping {
                    submitted: id.clone(),
                    stored: id.clone(),
                });
                continue;
            }

            let mut metadata = old.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
            if let Some(map) = metadata.as_object_mut() {
                map.insert(
                    "restart_of".to_string(),
                    serde_json::Value::String(id.to_string()),
                );
            }
            let fresh = TargetSubmission {
                id: TargetId::new(self.idgen.next()),
                name: old.name.clone(),
                tags: old.tags.clone(),
                metadata: Some(metadata),
                dependencies: old.dependencies.clone(),
                if_fails_activate: old.if_fails_activate.clone(),
                equivalence: old.equivalence,
                condition: old.condition.clone(),
                build_process: old.build_process.clone(),
                product: old.product.clone(),
                active: true,
            };
            let fresh_id = fresh.id.clone();
            info!(old = %id, fresh = %fresh_id, "restarting terminal target as a fresh copy");
            self.store.put(fresh.into_target(now_ms))?;
            self.request_activation(fresh_id.clone(), Cause::ActivatedByUser);
            mapping.push(IdMapping {
                submitted: id.clone(),
                stored: fresh_id,
            });
        }
        self.progress.notify_waiters();
        Ok(mapping)
    }

    /// Names of the diagnostic queries available for a target's run, if it
    /// has one.
    pub async fn available_queries(&self, id: &TargetId) -> Result<Vec<String>, EngineError> {
        let target = self.store.get(id)?;
        match last_run_handle(&target) {
            Some(handle) => Ok(self.executor.available_queries(&handle).await),
            None => Ok(Vec::new()),
        }
    }

    /// Run a diagnostic query against a target's most recent run.
    pub async fn call_query(&self, id: &TargetId, query: &str) -> Result<String, EngineError> {
        let target = self.store.get(id)?;
        let handle = last_run_handle(&target)
            .ok_or_else(|| EngineError::QueryFailed(format!("{} never started a process", id)))?;
        self.executor
            .call_query(&handle, query)
            .await
            .map_err(|e| EngineError::QueryFailed(e.to_string()))
    }

    /// Queue an activation; applied by the driver through the automaton.
    /// Only a currently-passive target will actually transition, which is
    /// what makes fallback activation exactly-once.
    pub(crate) fn request_activation(&self, id: TargetId, cause: Cause) {
        self.pending_activations.lock().entry(id).or_insert(cause);
        self.progress.notify_waiters();
    }

    /// Reject the batch when the submitted targets plus the stored alive
    /// graph contain a dependency cycle.
    fn reject_cycles(&self, accepted: &[(Target, bool)]) -> Result<(), EngineError> {
        let mut edges: HashMap<TargetId, Vec<TargetId>> = HashMap::new();
        for (target, _) in accepted {
            edges.insert(target.id.clone(), target.dependencies.clone());
        }
        for target in self.store.iter_alive() {
            edges
                .entry(target.id.clone())
                .or_insert_with(|| target.dependencies.clone());
        }

        // Iterative three-color DFS.
        let mut state: HashMap<&TargetId, u8> = HashMap::new();
        for start in edges.keys() {
            if state.get(start).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack = vec![(start, false)];
            while let Some((node, children_done)) = stack.pop() {
                if children_done {
                    state.insert(node, 2);
                    continue;
                }
                // Re-reaching an open or finished node through another
                // parent is not a cycle; back edges are caught below.
                if state.get(node).copied().unwrap_or(0) != 0 {
                    continue;
                }
                state.insert(node, 1);
                stack.push((node, true));
                if let Some(deps) = edges.get(node) {
                    for dep in deps {
                        match state.get(dep).copied().unwrap_or(0) {
                            1 => {
                                return Err(EngineError::DependencyCycle(dep.to_string()));
                            }
                            2 => {}
                            _ => {
                                if edges.contains_key(dep) {
                                    stack.push((dep, false));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Most recent run handle recorded anywhere in the history.
fn last_run_handle(target: &Target) -> Option<gantry_core::RunHandle> {
    target.history.iter().rev().find_map(|e| match &e.state {
        gantry_core::TargetState::StartedRunning { handle }
        | gantry_core::TargetState::TriedToCheckProcess { handle }
        | gantry_core::TargetState::TriedToKill { handle }
        | gantry_core::TargetState::Killing { handle } => Some(handle.clone()),
        _ => None,
    })
}

/// Structural equality of everything but the state history.
fn same_descriptor(a: &Target, b: &Target) -> bool {
    a.id == b.id
        && a.name == b.name
        && a.tags == b.tags
        && a.metadata == b.metadata
        && a.dependencies == b.dependencies
        && a.if_fails_activate == b.if_fails_activate
        && a.equivalence == b.equivalence
        && a.condition == b.condition
        && a.build_process == b.build_process
        && a.product == b.product
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
