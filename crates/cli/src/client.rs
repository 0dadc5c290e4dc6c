// SPDX-License-Identifier: MIT

//! Client side of the daemon protocol.

use anyhow::{anyhow, Context, Result};
use gantry_daemon::config;
use gantry_daemon::protocol::{DownMessage, UpEnvelope, UpMessage, UpRequest};
use gantry_daemon::protocol_wire as wire;
use std::path::Path;
use tokio::net::TcpStream;

/// Where and how to reach the daemon.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    pub addr: String,
    pub token: String,
}

impl DaemonClient {
    /// Build a client from the same config file the daemon reads: the
    /// profile's listen port and its first token.
    pub fn from_config(
        path: &Path,
        profile_name: Option<&str>,
        token_override: Option<String>,
    ) -> Result<Self> {
        let profile = config::load_profile(path, profile_name)
            .with_context(|| format!("loading config {}", path.display()))?;
        let token = token_override
            .or_else(|| profile.tokens.first().map(|t| t.secret.clone()))
            .unwrap_or_default();
        Ok(Self {
            addr: format!("127.0.0.1:{}", profile.listen.port),
            token,
        })
    }

    /// One request/response exchange.
    pub async fn call(&self, message: UpMessage) -> Result<DownMessage> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to gantryd at {}", self.addr))?;
        let (mut reader, mut writer) = stream.into_split();

        let envelope = UpEnvelope::V0(UpRequest {
            token: self.token.clone(),
            message,
        });
        let data = wire::encode(&envelope)?;
        wire::write_message(&mut writer, &data).await?;

        let reply = wire::read_message(&mut reader).await?;
        let envelope: gantry_daemon::protocol::DownEnvelope = wire::decode(&reply)?;
        match envelope.into_current() {
            DownMessage::Error { message } => Err(anyhow!("daemon error: {message}")),
            reply => Ok(reply),
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
