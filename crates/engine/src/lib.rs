// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gantry-engine: submission, equivalence, and the batched step driver

mod config;
mod driver;
mod engine;
mod error;

pub use config::EngineConfig;
pub use engine::{Engine, EngineCounters, IdMapping};
pub use error::EngineError;
