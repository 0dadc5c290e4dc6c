// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! gantry-daemon: configuration, wire protocol, and the protocol server

pub mod command_pipe;
pub mod config;
pub mod protocol;
pub mod protocol_wire;
pub mod server;

pub use config::{ConfigError, Profile};
pub use protocol::{DownEnvelope, DownMessage, UpEnvelope, UpMessage, UpRequest};
pub use protocol_wire::{ProtocolError, PROTOCOL_VERSION};
pub use server::{Server, ServerSettings};
