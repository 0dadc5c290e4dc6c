// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! gantry-adapters: host executor interface and in-tree implementations

pub mod host;
mod local;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{process_key, FakeHost, HostCall};

pub use host::{call_with_timeout, plan_copy_files, HostError, HostExecutor};
pub use local::LocalHost;
