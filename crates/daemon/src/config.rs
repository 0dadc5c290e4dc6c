// SPDX-License-Identifier: MIT

//! Configuration profiles.
//!
//! The config file is JSON holding a list of named profiles; one is
//! selected by name, by `GANTRY_PROFILE`, or — when there is exactly one —
//! by default.

use gantry_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the profile to load.
pub const PROFILE_ENV: &str = "GANTRY_PROFILE";

/// Allowed alphabet for token secrets.
const TOKEN_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_=-";

/// Errors from the config loader.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no profile named {0:?}")]
    NoSuchProfile(String),
    #[error("cannot pick a default profile out of {0}; name one")]
    AmbiguousProfile(usize),
    #[error("token {name:?} has an invalid secret (allowed: A-Z a-z 0-9 _ = -)")]
    BadToken { name: String },
}

/// An authorized client token: a name plus an opaque secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub name: String,
    pub secret: String,
}

impl AuthToken {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty()
            || !self.secret.chars().all(|c| TOKEN_ALPHABET.contains(c))
        {
            return Err(ConfigError::BadToken {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// TLS certificate/key pair. Accepted in config; termination itself is an
/// external collaborator, so the daemon logs a warning and listens plain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Listen socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Engine knobs as they appear in a profile: everything optional, falling
/// back to [`EngineConfig::default`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_successive_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_unix_ssh_failure_into_target_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_step_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_automaton_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_timeout_upper_bound_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_killing_wait_s: Option<u64>,
}

impl EngineSettings {
    pub fn into_config(self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(v) = self.maximum_successive_attempts {
            config.policy.maximum_successive_attempts = v;
        }
        if let Some(v) = self.turn_unix_ssh_failure_into_target_failure {
            config.policy.turn_unix_ssh_failure_into_target_failure = v;
        }
        if let Some(v) = self.engine_step_batch_size {
            config.engine_step_batch_size = v;
        }
        if let Some(v) = self.concurrent_automaton_steps {
            config.concurrent_automaton_steps = v;
        }
        if let Some(v) = self.host_timeout_upper_bound_s {
            config.host_timeout_upper_bound_s = v;
        }
        if let Some(v) = self.orphan_killing_wait_s {
            config.orphan_killing_wait_s = v;
        }
        config
    }
}

fn default_max_blocking_time_s() -> u64 {
    300
}

fn default_return_error_messages() -> bool {
    true
}

/// One named profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Store location: a directory path or `file://` URI.
    pub database: String,
    #[serde(default)]
    pub engine: EngineSettings,
    pub listen: ListenConfig,
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_pipe: Option<PathBuf>,
    /// Receives the debug log and periodic JSON state dumps.
    /// Defaults to the database directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_max_blocking_time_s")]
    pub max_blocking_time_s: u64,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_return_error_messages")]
    pub return_error_messages: bool,
}

impl Profile {
    pub fn engine_config(&self) -> EngineConfig {
        self.engine.clone().into_config()
    }
}

/// The whole config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub profiles: Vec<Profile>,
}

/// Load a profile from the config file.
///
/// Selection order: the explicit `name`, then `$GANTRY_PROFILE`, then the
/// only profile present (more than one without a name is an error).
pub fn load_profile(path: &Path, name: Option<&str>) -> Result<Profile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    let file: ConfigFile = serde_json::from_str(&raw)?;

    let wanted = name
        .map(|n| n.to_string())
        .or_else(|| std::env::var(PROFILE_ENV).ok());

    let profile = match wanted {
        Some(wanted) => file
            .profiles
            .into_iter()
            .find(|p| p.name == wanted)
            .ok_or(ConfigError::NoSuchProfile(wanted))?,
        None => {
            if file.profiles.len() != 1 {
                return Err(ConfigError::AmbiguousProfile(file.profiles.len()));
            }
            file.profiles.into_iter().next().ok_or_else(|| {
                ConfigError::AmbiguousProfile(0)
            })?
        }
    };

    for token in &profile.tokens {
        token.validate()?;
    }
    Ok(profile)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
