// SPDX-License-Identifier: MIT

//! Error types for the engine

use gantry_storage::StoreError;
use thiserror::Error;

/// Errors that can surface from engine operations.
///
/// Classified host failures never appear here: they are observations fed
/// back into the automaton. Only `Fatal` stops the driver loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dependency cycle rejected at submission: {0}")]
    DependencyCycle(String),
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("fatal engine invariant violation: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}
