// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gantry-core: target model and pure automaton for the Gantry workflow engine

pub mod automaton;
pub mod clock;
pub mod filter;
pub mod host;
pub mod id;
pub mod state;
pub mod target;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use automaton::{
    step, Action, CallOutcome, DepState, FailurePolicy, Observations, Step,
};
pub use clock::{Clock, FakeClock, SystemClock};
pub use filter::{FilterError, MatchPattern, StatusPredicate, TargetFilter, TargetQuery, TimeConstraint};
pub use host::{Host, HostFailure, HostFailureKind, ProcessStatus, RunHandle};
pub use id::{IdGen, SequentialIdGen, ShortId, UuidIdGen};
pub use state::{Cause, SimpleStatus, StateEntry, StateKind, TargetState};
pub use target::{
    Artifact, BuildProcess, Condition, ConditionTerm, Equivalence, Program, Target, TargetId,
    TargetSubmission,
};
