// SPDX-License-Identifier: MIT

//! The batched concurrent step driver.
//!
//! One batch: select up to `engine_step_batch_size` candidates (those whose
//! next transition needs no external call first), run them through up to
//! `concurrent_automaton_steps` workers, commit each transition, and queue
//! the activations the automaton requested. Orphan sweeps run between
//! batches at a bounded minimum interval.

use crate::{Engine, EngineError};
use gantry_adapters::{call_with_timeout, HostError, HostExecutor};
use gantry_core::{
    automaton, Action, CallOutcome, Cause, Clock, DepState, HostFailureKind, IdGen, Observations,
    StateKind, Target, TargetId,
};
use gantry_storage::StoreError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long the idle driver sleeps before re-polling running targets.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(250);

/// The one outstanding executor operation a step may request.
enum ExecutorCall {
    CheckCondition(gantry_core::Condition),
    Start(gantry_core::Host, gantry_core::BuildProcess),
    Probe(gantry_core::RunHandle),
    Kill(gantry_core::RunHandle),
}

impl<H, C, G> Engine<H, C, G>
where
    H: HostExecutor,
    C: Clock,
    G: IdGen,
{
    /// Drive batches until `shutdown` flips to true. Only a `Fatal` error
    /// stops the loop by itself.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.engine_step_batch_size,
            workers = self.config.concurrent_automaton_steps,
            "step driver running"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_step_batch().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal engine error, stopping driver");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "recoverable engine error");
                }
            }
            self.sweep_orphans_if_due();

            // Pace the loop so probe cycles poll rather than spin. New
            // submissions and kill requests wake the driver early.
            let progress = self.progress();
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = progress.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
        info!("step driver stopped");
    }

    /// Run one batch. Returns the number of targets that made progress.
    pub async fn run_step_batch(self: &Arc<Self>) -> Result<usize, EngineError> {
        let batch = self.select_batch();
        if batch.is_empty() {
            return Ok(0);
        }

        {
            let mut in_flight = self.in_flight.lock();
            for id in &batch {
                in_flight.insert(id.clone());
            }
        }

        let queue = Arc::new(Mutex::new(batch.iter().cloned().collect::<VecDeque<_>>()));
        let progressed = Arc::new(Mutex::new(0usize));
        let fatal: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        let workers = self.config.concurrent_automaton_steps.clamp(1, batch.len());
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let engine = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let progressed = Arc::clone(&progressed);
            let fatal = Arc::clone(&fatal);
            join_set.spawn(async move {
                loop {
                    let id = match queue.lock().pop_front() {
                        Some(id) => id,
                        None => break,
                    };
                    match engine.step_one(&id).await {
                        Ok(true) => *progressed.lock() += 1,
                        Ok(false) => {}
                        Err(e) if e.is_fatal() => {
                            fatal.lock().get_or_insert(e);
                            break;
                        }
                        Err(e) => {
                            warn!(target = %id, error = %e, "step failed");
                        }
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}

        {
            let mut in_flight = self.in_flight.lock();
            for id in &batch {
                in_flight.remove(id);
            }
        }

        if let Some(e) = fatal.lock().take() {
            return Err(e);
        }

        let stepped = *progressed.lock();
        {
            let mut counters = self.counters.lock();
            counters.batches += 1;
            counters.steps += stepped as u64;
        }
        if stepped > 0 {
            self.progress.notify_waiters();
        }
        Ok(stepped)
    }

    /// Pick the work set: active targets plus passive targets with a
    /// pending activation, non-blocking transitions first, capped at the
    /// batch size. Ids already in flight are skipped.
    fn select_batch(&self) -> Vec<TargetId> {
        let in_flight = self.in_flight.lock().clone();
        let mut candidates: Vec<Target> = self.store.iter_active();

        {
            let pending = self.pending_activations.lock();
            for id in pending.keys() {
                if candidates.iter().any(|t| t.id == *id) {
                    continue;
                }
                if let Ok(target) = self.store.get(id) {
                    if target.state_kind() == StateKind::Passive {
                        candidates.push(target);
                    }
                }
            }
        }
        // Kill requests make otherwise-idle targets actionable too.
        {
            let kills = self.kills.lock();
            for id in kills.iter() {
                if candidates.iter().any(|t| t.id == *id) {
                    continue;
                }
                if let Ok(target) = self.store.get(id) {
                    if target.is_alive() {
                        candidates.push(target);
                    }
                }
            }
        }

        candidates.retain(|t| !in_flight.contains(&t.id));
        candidates.sort_by_key(|t| (next_step_blocks(t), t.id.clone()));
        candidates.truncate(self.config.engine_step_batch_size);
        candidates.into_iter().map(|t| t.id).collect()
    }

    /// Step a single target: one pure step, at most one executor call, one
    /// follow-up step consuming the call's outcome, then a single commit.
    pub(crate) async fn step_one(&self, id: &TargetId) -> Result<bool, EngineError> {
        let target = match self.store.get(id) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if target.is_terminal() {
            self.clear_flags(id);
            return Ok(false);
        }

        let mut working = target;
        let mut new_entries = Vec::new();
        let mut activations: Vec<(Vec<TargetId>, Cause)> = Vec::new();

        let first = automaton::step(&working, &self.observe(&working, None), &self.config.policy);
        let mut call = self.absorb(&mut working, &mut new_entries, &mut activations, first);

        if let Some(action) = call.take() {
            let outcome = self.execute(action).await;
            let follow = automaton::step(
                &working,
                &self.observe(&working, Some(outcome)),
                &self.config.policy,
            );
            // A further executor call is re-issued from the committed state
            // on the next batch; one outstanding operation per target.
            let _ = self.absorb(&mut working, &mut new_entries, &mut activations, follow);
        }

        if new_entries.is_empty() && activations.is_empty() {
            return Ok(false);
        }

        if !new_entries.is_empty() {
            self.commit(id, &new_entries)?;
            debug!(
                target = %id,
                state = %StateKind::from(&new_entries[new_entries.len() - 1].state),
                entries = new_entries.len(),
                "committed transition"
            );
        }

        for (ids, cause) in activations {
            for activate_id in ids {
                self.request_activation(activate_id, cause.clone());
            }
        }

        if working.is_terminal() {
            self.clear_flags(id);
        }
        if working.state_kind() != StateKind::Passive {
            self.pending_activations.lock().remove(id);
        }
        Ok(true)
    }

    /// Apply a step's entries to the working copy; split its actions into
    /// activations and the (at most one) executor call.
    fn absorb(
        &self,
        working: &mut Target,
        new_entries: &mut Vec<gantry_core::StateEntry>,
        activations: &mut Vec<(Vec<TargetId>, Cause)>,
        step: gantry_core::Step,
    ) -> Option<ExecutorCall> {
        for entry in step.entries {
            working.push_entry(entry.clone());
            new_entries.push(entry);
        }
        let mut call = None;
        for action in step.actions {
            match action {
                Action::Activate { ids, cause } => activations.push((ids, cause)),
                Action::CheckCondition { condition } => {
                    call = Some(ExecutorCall::CheckCondition(condition))
                }
                Action::StartProcess { host, process } => {
                    call = Some(ExecutorCall::Start(host, process))
                }
                Action::ProbeProcess { handle } => call = Some(ExecutorCall::Probe(handle)),
                Action::KillProcess { handle } => call = Some(ExecutorCall::Kill(handle)),
            }
        }
        call
    }

    /// Build the observation bundle for a target.
    fn observe(&self, target: &Target, outcome: Option<CallOutcome>) -> Observations {
        let mut deps = HashMap::new();
        for dep in &target.dependencies {
            let state = match self.store.get(dep) {
                Ok(t) => {
                    let kind = t.state_kind();
                    if kind == StateKind::Passive {
                        DepState::Passive
                    } else if kind == StateKind::Successful {
                        DepState::Successful
                    } else if kind == StateKind::Dead {
                        DepState::Dead
                    } else {
                        DepState::InProgress
                    }
                }
                // A reference to an id that was never stored cannot succeed.
                Err(_) => DepState::Dead,
            };
            deps.insert(dep.clone(), state);
        }

        let orphan = self.orphans.lock().contains(&target.id);
        let kill_requested = orphan || self.kills.lock().contains(&target.id);
        let activate = if target.state_kind() == StateKind::Passive {
            self.pending_activations.lock().get(&target.id).cloned()
        } else {
            None
        };

        Observations {
            now_ms: self.clock.epoch_ms(),
            deps,
            activate,
            kill_requested,
            orphan,
            outcome,
        }
    }

    /// Dispatch one executor call with the configured timeout ceiling,
    /// classifying the result for the automaton.
    async fn execute(&self, call: ExecutorCall) -> CallOutcome {
        let timeout = self.config.host_timeout_upper_bound();
        match call {
            ExecutorCall::CheckCondition(condition) => {
                let result = call_with_timeout(HostFailureKind::Unix, timeout, async {
                    self.executor
                        .check_condition(&condition.host, &condition)
                        .await
                })
                .await;
                CallOutcome::Condition(result.map_err(HostError::into_failure))
            }
            ExecutorCall::Start(host, process) => {
                let result = call_with_timeout(HostFailureKind::Start, timeout, async {
                    self.executor.start(&host, &process).await
                })
                .await;
                CallOutcome::Start(result.map_err(HostError::into_failure))
            }
            ExecutorCall::Probe(handle) => {
                let result = call_with_timeout(HostFailureKind::Probe, timeout, async {
                    self.executor.probe(&handle).await
                })
                .await;
                CallOutcome::Probe(result.map_err(HostError::into_failure))
            }
            ExecutorCall::Kill(handle) => {
                let result = call_with_timeout(HostFailureKind::Kill, timeout, async {
                    self.executor.kill(&handle).await
                })
                .await;
                CallOutcome::Kill(result.map_err(HostError::into_failure))
            }
        }
    }

    /// Commit appended entries; a store conflict is retried once, a second
    /// conflict is a fatal single-writer violation.
    fn commit(&self, id: &TargetId, entries: &[gantry_core::StateEntry]) -> Result<(), EngineError> {
        let apply = |t: &mut Target| {
            for entry in entries {
                t.push_entry(entry.clone());
            }
        };
        match self.store.update(id, apply) {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(_)) => {
                warn!(target = %id, "store conflict, retrying once");
                match self.store.update(id, apply) {
                    Ok(_) => Ok(()),
                    Err(StoreError::Conflict(_)) => Err(EngineError::Fatal(format!(
                        "repeated store conflict for {}: another writer?",
                        id
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn clear_flags(&self, id: &TargetId) {
        self.kills.lock().remove(id);
        self.orphans.lock().remove(id);
        self.pending_activations.lock().remove(id);
    }

    /// Condemn alive dependency-activated targets that are no longer
    /// reachable from any alive user- or fallback-activated root. Runs at
    /// most once per `orphan_killing_wait`.
    pub fn sweep_orphans_if_due(&self) {
        {
            let mut last = self.last_orphan_sweep.lock();
            let due = last
                .map(|t| t.elapsed() >= self.config.orphan_killing_wait())
                .unwrap_or(true);
            if !due {
                return;
            }
            *last = Some(Instant::now());
        }
        self.sweep_orphans();
    }

    /// The sweep itself, interval-free (tests call this directly).
    pub fn sweep_orphans(&self) {
        let alive = self.store.iter_alive();
        let by_id: HashMap<&TargetId, &Target> = alive.iter().map(|t| (&t.id, t)).collect();

        let mut reachable: HashSet<&TargetId> = HashSet::new();
        let mut stack: Vec<&TargetId> = alive
            .iter()
            .filter(|t| is_activation_root(t))
            .map(|t| &t.id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(target) = by_id.get(id) {
                for dep in &target.dependencies {
                    if by_id.contains_key(dep) && !reachable.contains(dep) {
                        stack.push(dep);
                    }
                }
            }
        }

        let mut condemned = 0usize;
        let mut orphans = self.orphans.lock();
        for target in &alive {
            if target.is_active() && !is_activation_root(target) && !reachable.contains(&target.id)
            {
                if orphans.insert(target.id.clone()) {
                    info!(target = %target.id, "condemning orphan");
                    condemned += 1;
                }
            }
        }
        drop(orphans);

        if condemned > 0 {
            self.counters.lock().orphan_sweeps += 1;
            self.progress.notify_waiters();
        }
    }
}

/// Activation roots for the orphan sweep: targets a user or a failure
/// fallback explicitly asked for.
fn is_activation_root(target: &Target) -> bool {
    target.history.iter().any(|e| {
        matches!(
            e.cause,
            Cause::ActivatedByUser | Cause::FallbackOf(_)
        )
    })
}

/// True when the target's next transition must go through the executor.
fn next_step_blocks(target: &Target) -> bool {
    match target.state_kind() {
        StateKind::Passive
        | StateKind::Activable
        | StateKind::AlreadyDone
        | StateKind::VerifiedSuccess
        | StateKind::FailedRunning
        | StateKind::FailedToVerifySuccess
        | StateKind::FailedFromDependencies
        | StateKind::Killed => false,
        StateKind::RanSuccessfully => target.condition.is_some(),
        StateKind::Active
        | StateKind::Building
        | StateKind::TriedToEvaluateCondition
        | StateKind::TriedToStart
        | StateKind::StartedRunning
        | StateKind::TriedToCheckProcess
        | StateKind::TriedToKill
        | StateKind::Killing => true,
        StateKind::Successful | StateKind::Dead => false,
    }
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
