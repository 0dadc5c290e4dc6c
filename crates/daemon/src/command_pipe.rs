// SPDX-License-Identifier: MIT

//! Administrative command pipe.
//!
//! When a profile names a `command_pipe`, the daemon creates the FIFO and
//! reads newline-separated commands from it. This is an operator-only
//! side door; clients use the TCP protocol.

use gantry_storage::TargetStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{info, warn};

/// A line command read from the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeCommand {
    /// Shut the daemon down gracefully.
    Quit,
    /// Flush buffered journal writes now.
    Flush,
    /// Snapshot and truncate the journal now.
    Checkpoint,
    /// Write a JSON dump of every target to the log directory.
    DumpState,
}

impl PipeCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "quit" => Some(PipeCommand::Quit),
            "flush" => Some(PipeCommand::Flush),
            "checkpoint" => Some(PipeCommand::Checkpoint),
            "dump-state" => Some(PipeCommand::DumpState),
            _ => None,
        }
    }
}

/// Write the state dump atomically into the log directory.
pub fn write_state_dump(store: &TargetStore, log_dir: &Path) -> std::io::Result<PathBuf> {
    let dump = store
        .dump_json()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let path = log_dir.join("state-dump.json");
    let tmp = path.with_extension("tmp");
    std::fs::create_dir_all(log_dir)?;
    std::fs::write(&tmp, serde_json::to_vec_pretty(&dump)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Create the FIFO (if needed) and spawn the reader task.
pub fn spawn(
    path: PathBuf,
    store: Arc<TargetStore>,
    log_dir: PathBuf,
    shutdown: watch::Sender<bool>,
) {
    if let Err(e) = ensure_fifo(&path) {
        warn!(path = %path.display(), error = %e, "cannot create command pipe, disabling it");
        return;
    }
    info!(path = %path.display(), "command pipe ready");

    tokio::spawn(async move {
        let mut pending = String::new();
        loop {
            let mut receiver =
                match tokio::net::unix::pipe::OpenOptions::new().open_receiver(&path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot open command pipe, disabling it");
                        return;
                    }
                };

            let mut buf = [0u8; 1024];
            loop {
                match receiver.read(&mut buf).await {
                    // All writers closed; reopen and wait for the next one.
                    Ok(0) => break,
                    Ok(n) => {
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(newline) = pending.find('\n') {
                            let line = pending[..newline].to_string();
                            pending.drain(..=newline);
                            handle_line(&line, &store, &log_dir, &shutdown);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "command pipe read failed");
                        break;
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    });
}

fn handle_line(
    line: &str,
    store: &Arc<TargetStore>,
    log_dir: &Path,
    shutdown: &watch::Sender<bool>,
) {
    let Some(command) = PipeCommand::parse(line) else {
        if !line.trim().is_empty() {
            warn!(line, "unknown pipe command");
        }
        return;
    };
    info!(?command, "pipe command");
    match command {
        PipeCommand::Quit => {
            let _ = shutdown.send(true);
        }
        PipeCommand::Flush => {
            if let Err(e) = store.flush() {
                warn!(error = %e, "pipe flush failed");
            }
        }
        PipeCommand::Checkpoint => {
            if let Err(e) = store.checkpoint() {
                warn!(error = %e, "pipe checkpoint failed");
            }
        }
        PipeCommand::DumpState => match write_state_dump(store, log_dir) {
            Ok(path) => info!(path = %path.display(), "state dump written"),
            Err(e) => warn!(error = %e, "state dump failed"),
        },
    }
}

fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

#[cfg(test)]
#[path = "command_pipe_tests.rs"]
mod tests;
