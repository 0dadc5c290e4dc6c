// SPDX-License-Identifier: MIT

//! Persistent target store: materialized map + journal + snapshot.
//!
//! The store is the only shared mutable state in the engine. All access
//! goes through its lock; `update` gives read-modify-write atomicity per
//! id. History is append-only: a write whose history does not extend the
//! stored one is a divergent writer and is rejected with `Conflict`.

use crate::journal::{Journal, JournalError};
use crate::snapshot::{Snapshot, SnapshotError};
use gantry_core::{StateKind, Target, TargetId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Location of the persistent store, parsed from the configured
/// `database` string: a directory path, optionally as a `file://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseParameters {
    pub root: PathBuf,
}

impl DatabaseParameters {
    pub fn parse(params: &str) -> Result<Self, StoreError> {
        let raw = params.strip_prefix("file://").unwrap_or(params);
        if raw.is_empty() {
            return Err(StoreError::InvalidParameters(params.to_string()));
        }
        Ok(Self {
            root: PathBuf::from(raw),
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join("targets.journal")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("targets.snapshot.zst")
    }
}

impl fmt::Display for DatabaseParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file://{}", self.root.display())
    }
}

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target not found: {0}")]
    NotFound(TargetId),
    #[error("conflicting write for target {0}: stored history is not a prefix")]
    Conflict(TargetId),
    #[error("invalid database parameters: {0}")]
    InvalidParameters(String),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Counters reported in server status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub alive: usize,
    pub active: usize,
}

/// Result of a checkpoint: sequence covered and snapshot size on disk.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointResult {
    pub seq: u64,
    pub size_bytes: u64,
}

struct StoreInner {
    targets: HashMap<TargetId, Target>,
    alive: HashSet<TargetId>,
    active: HashSet<TargetId>,
    /// Equivalence bucket: make-and-condition digest → ids, insertion order.
    equivalence: HashMap<String, Vec<TargetId>>,
    journal: Journal,
}

/// The persistent target store.
pub struct TargetStore {
    params: DatabaseParameters,
    inner: Mutex<StoreInner>,
}

impl TargetStore {
    /// Open the store: load the snapshot (if any) and replay the journal.
    pub fn open(params: DatabaseParameters) -> Result<Self, StoreError> {
        let snapshot = Snapshot::load(&params.snapshot_path())?;
        let (mut targets, snapshot_seq) = match snapshot {
            Some(s) => {
                info!(seq = s.seq, targets = s.targets.len(), "loaded snapshot");
                (s.targets, s.seq)
            }
            None => (HashMap::new(), 0),
        };

        let mut journal = Journal::open(&params.journal_path())?;
        let replayed = journal.entries_after(snapshot_seq)?;
        let replay_count = replayed.len();
        for entry in replayed {
            targets.insert(entry.target.id.clone(), entry.target);
        }
        if replay_count > 0 {
            info!(
                entries = replay_count,
                after_seq = snapshot_seq,
                "replayed journal entries"
            );
        }

        let mut inner = StoreInner {
            targets: HashMap::new(),
            alive: HashSet::new(),
            active: HashSet::new(),
            equivalence: HashMap::new(),
            journal,
        };
        for (_, target) in targets {
            inner.index(&target);
            inner.targets.insert(target.id.clone(), target);
        }

        Ok(Self {
            params,
            inner: Mutex::new(inner),
        })
    }

    pub fn params(&self) -> &DatabaseParameters {
        &self.params
    }

    /// Fetch a target by id.
    pub fn get(&self, id: &TargetId) -> Result<Target, StoreError> {
        self.inner
            .lock()
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.inner.lock().targets.contains_key(id)
    }

    /// Idempotent upsert.
    ///
    /// Re-writing identical content is a no-op. A write whose history does
    /// not extend the stored history is a divergent writer: `Conflict`.
    pub fn put(&self, target: Target) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.targets.get(&target.id) {
            if *existing == target {
                return Ok(());
            }
            if !history_extends(&target, existing) {
                return Err(StoreError::Conflict(target.id.clone()));
            }
        }
        inner.commit(target)?;
        Ok(())
    }

    /// Read-modify-write under the store lock, atomic per id.
    ///
    /// `f` must only append to the history; a mutation that rewrites it is
    /// rejected as `Conflict` and nothing is committed. Returns the
    /// committed target.
    pub fn update(
        &self,
        id: &TargetId,
        f: impl FnOnce(&mut Target),
    ) -> Result<Target, StoreError> {
        let mut inner = self.inner.lock();
        let current = inner
            .targets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut updated = current.clone();
        f(&mut updated);

        if updated == current {
            return Ok(current);
        }
        if updated.id != *id || !history_extends(&updated, &current) {
            return Err(StoreError::Conflict(id.clone()));
        }

        inner.commit(updated.clone())?;
        Ok(updated)
    }

    /// Targets in non-terminal states.
    pub fn iter_alive(&self) -> Vec<Target> {
        let inner = self.inner.lock();
        inner
            .alive
            .iter()
            .filter_map(|id| inner.targets.get(id))
            .cloned()
            .collect()
    }

    /// Alive targets that have been activated (everything but `Passive`).
    pub fn iter_active(&self) -> Vec<Target> {
        let inner = self.inner.lock();
        inner
            .active
            .iter()
            .filter_map(|id| inner.targets.get(id))
            .cloned()
            .collect()
    }

    /// Every stored target. Queries filter on top of this.
    pub fn iter_all(&self) -> Vec<Target> {
        self.inner.lock().targets.values().cloned().collect()
    }

    pub fn alive_ids(&self) -> Vec<TargetId> {
        self.inner.lock().alive.iter().cloned().collect()
    }

    pub fn active_ids(&self) -> Vec<TargetId> {
        self.inner.lock().active.iter().cloned().collect()
    }

    /// Find an alive target the candidate would deduplicate against.
    ///
    /// Only the candidate's equivalence policy gates the lookup; every
    /// alive target is a potential match regardless of its own policy.
    /// O(1) expected: targets are bucketed by a digest of
    /// (build process, condition).
    pub fn find_equivalent(&self, candidate: &Target) -> Option<TargetId> {
        if candidate.equivalence == gantry_core::Equivalence::None {
            return None;
        }
        let key = equivalence_key(candidate);
        let inner = self.inner.lock();
        let bucket = inner.equivalence.get(&key)?;
        bucket
            .iter()
            .filter(|id| inner.alive.contains(*id))
            .find_map(|id| {
                let stored = inner.targets.get(id)?;
                candidate.equivalent_to(stored).then(|| id.clone())
            })
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            total: inner.targets.len(),
            alive: inner.alive.len(),
            active: inner.active.len(),
        }
    }

    /// Flush buffered journal writes (the group-commit durability point).
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.lock().journal.flush()?;
        Ok(())
    }

    pub fn needs_flush(&self) -> bool {
        self.inner.lock().journal.needs_flush()
    }

    /// Write a durable snapshot, then truncate the journal through it.
    pub fn checkpoint(&self) -> Result<CheckpointResult, StoreError> {
        let (snapshot, seq) = {
            let mut inner = self.inner.lock();
            inner.journal.flush()?;
            let seq = inner.journal.write_seq();
            (Snapshot::new(seq, inner.targets.clone()), seq)
        };

        // Serialization and I/O happen outside the lock.
        let size_bytes = snapshot.save(&self.params.snapshot_path())?;

        let mut inner = self.inner.lock();
        inner.journal.truncate_through(seq)?;
        debug!(seq, size_bytes, "checkpoint complete");
        Ok(CheckpointResult { seq, size_bytes })
    }

    /// Serialize every target as a JSON array (periodic state dumps).
    pub fn dump_json(&self) -> Result<serde_json::Value, StoreError> {
        let inner = self.inner.lock();
        let mut targets: Vec<&Target> = inner.targets.values().collect();
        targets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(serde_json::to_value(targets).map_err(JournalError::from)?)
    }
}

impl StoreInner {
    /// Journal the write and refresh all indexes.
    fn commit(&mut self, target: Target) -> Result<(), JournalError> {
        self.journal.append(&target)?;
        self.index(&target);
        self.targets.insert(target.id.clone(), target);
        Ok(())
    }

    fn index(&mut self, target: &Target) {
        let id = target.id.clone();
        let key = equivalence_key(target);
        if target.is_alive() {
            self.alive.insert(id.clone());
            if target.state_kind() != StateKind::Passive {
                self.active.insert(id.clone());
            }
            let bucket = self.equivalence.entry(key).or_default();
            if !bucket.contains(&id) {
                bucket.push(id);
            }
        } else {
            self.alive.remove(&id);
            self.active.remove(&id);
            if let Some(bucket) = self.equivalence.get_mut(&key) {
                bucket.retain(|b| *b != id);
            }
        }
    }
}

/// True when `new` only appends history entries on top of `old`.
fn history_extends(new: &Target, old: &Target) -> bool {
    new.history.len() >= old.history.len() && new.history[..old.history.len()] == old.history[..]
}

/// Digest of (build process, condition) for equivalence bucketing.
///
/// Every target is bucketed, whatever its own policy: a later candidate
/// that opts into deduplication must be able to find it.
fn equivalence_key(target: &Target) -> String {
    let canonical =
        serde_json::to_string(&(&target.build_process, &target.condition)).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
