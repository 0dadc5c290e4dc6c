// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gantry-storage: persistent target store (journal + snapshot)

pub mod journal;
pub mod snapshot;
pub mod store;

pub use journal::{Journal, JournalEntry, JournalError};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::{
    CheckpointResult, DatabaseParameters, StoreError, StoreStats, TargetStore,
};
