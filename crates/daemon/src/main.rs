// SPDX-License-Identifier: MIT

//! Gantry Daemon (gantryd)
//!
//! Long-running service that owns the target store and the step driver,
//! and serves the client protocol over TCP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use gantry_adapters::LocalHost;
use gantry_core::{SystemClock, UuidIdGen};
use gantry_engine::Engine;
use gantry_storage::{DatabaseParameters, TargetStore};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use gantry_daemon::command_pipe;
use gantry_daemon::config;
use gantry_daemon::server::{Server, ServerSettings};

/// Flush interval for group commit (~10ms durability window)
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Checkpoint interval (60 seconds)
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between JSON state dumps into the log directory.
const DUMP_INTERVAL: Duration = Duration::from_secs(300);

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (gantryd.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

struct Args {
    config: PathBuf,
    profile: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut config = std::env::var("GANTRY_CONFIG").ok().map(PathBuf::from);
    let mut profile = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("gantryd {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                println!("gantryd {}", env!("CARGO_PKG_VERSION"));
                println!("Gantry workflow engine daemon");
                println!();
                println!("USAGE:");
                println!("    gantryd --config <file.json> [--profile <name>]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <PATH>    Config file (or $GANTRY_CONFIG)");
                println!("    -p, --profile <NAME>   Profile name (or $GANTRY_PROFILE)");
                println!("    -h, --help             Print help information");
                println!("    -V, --version          Print version information");
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config = Some(PathBuf::from(
                    args.next().ok_or("--config needs a value")?,
                ));
            }
            "--profile" | "-p" => {
                profile = Some(args.next().ok_or("--profile needs a value")?);
            }
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }

    Ok(Args {
        config: config.ok_or("no config file: pass --config or set $GANTRY_CONFIG")?,
        profile,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Usage: gantryd --config <file.json> [--profile <name>]");
            std::process::exit(1);
        }
    };

    let profile = config::load_profile(&args.config, args.profile.as_deref())?;
    let params = DatabaseParameters::parse(&profile.database)?;
    std::fs::create_dir_all(&params.root)?;
    let log_dir = profile
        .log_dir
        .clone()
        .unwrap_or_else(|| params.root.clone());

    let log_path = log_dir.join("gantryd.log");
    rotate_log_if_needed(&log_path);
    let _log_guard = setup_logging(&log_path)?;

    info!(profile = %profile.name, database = %params, "starting gantryd");

    // Single writer: hold an exclusive lock for the life of the process.
    let lock_path = params.root.join("gantryd.pid");
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        let pid = std::fs::read_to_string(&lock_path).unwrap_or_default();
        eprintln!("gantryd is already running on this store (pid: {})", pid.trim());
        std::process::exit(1);
    }
    {
        use std::io::Write;
        let mut lock_file = &lock_file;
        lock_file.set_len(0)?;
        writeln!(lock_file, "{}", std::process::id())?;
    }

    if profile.listen.tls.is_some() {
        warn!("tls cert/key configured but termination is external; listening plain");
    }

    let store = Arc::new(TargetStore::open(params)?);
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        LocalHost::new(),
        SystemClock,
        UuidIdGen,
        profile.engine_config(),
    ));

    let listener = TcpListener::bind(("127.0.0.1", profile.listen.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Server::new(Arc::clone(&engine), ServerSettings::from_profile(&profile));
    tokio::spawn(server.run(listener));
    tokio::spawn(Arc::clone(&engine).run(shutdown_rx));
    spawn_flush_task(Arc::clone(&store));
    spawn_checkpoint_task(Arc::clone(&store));
    spawn_dump_task(Arc::clone(&store), log_dir.clone());
    if let Some(pipe_path) = profile.command_pipe.clone() {
        command_pipe::spawn(
            pipe_path,
            Arc::clone(&store),
            log_dir.clone(),
            shutdown_tx.clone(),
        );
    }

    // Signal ready for whoever supervises us.
    println!("READY");

    wait_for_shutdown(&shutdown_tx).await;

    // Graceful teardown: stop the driver, flush, snapshot.
    let _ = shutdown_tx.send(true);
    if let Err(e) = store.flush() {
        warn!(error = %e, "final flush failed");
    }
    match store.checkpoint() {
        Ok(result) => info!(seq = result.seq, "final shutdown checkpoint saved"),
        Err(e) => warn!(error = %e, "final checkpoint failed"),
    }
    if let Err(e) = std::fs::remove_file(&lock_path) {
        warn!(error = %e, "could not remove pid file");
    }
    info!("gantryd stopped");
    Ok(())
}

/// Block until SIGTERM, SIGINT, or a `quit` pipe command.
async fn wait_for_shutdown(shutdown_tx: &watch::Sender<bool>) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = shutdown_rx.changed() => info!("shutdown requested via command pipe"),
    }
}

/// Spawn a task that periodically flushes the journal (group commit).
fn spawn_flush_task(store: Arc<TargetStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            interval.tick().await;
            if store.needs_flush() {
                if let Err(e) = store.flush() {
                    error!(error = %e, "journal flush failed");
                }
            }
        }
    });
}

/// Spawn a task that periodically snapshots the store and truncates the
/// journal. Serialization and compression run on a blocking thread.
fn spawn_checkpoint_task(store: Arc<TargetStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
        loop {
            interval.tick().await;
            let store = Arc::clone(&store);
            let result = tokio::task::spawn_blocking(move || store.checkpoint()).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "checkpoint failed, journal not truncated"),
                Err(e) => warn!(error = %e, "checkpoint task panicked"),
            }
        }
    });
}

/// Spawn a task that periodically writes a JSON dump of every target into
/// the log directory.
fn spawn_dump_task(store: Arc<TargetStore>, log_dir: PathBuf) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DUMP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = command_pipe::write_state_dump(&store, &log_dir) {
                warn!(error = %e, "periodic state dump failed");
            }
        }
    });
}

/// Rotate the daemon log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `gantryd.log` → `gantryd.log.1` → `.2` → `.3`, deleting the
/// oldest. Best-effort: rotation failures must not stop the daemon.
fn rotate_log_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }

    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    log_path: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let dir = log_path.parent().ok_or("log path has no parent")?;
    std::fs::create_dir_all(dir)?;
    let file_name = log_path.file_name().ok_or("log path has no file name")?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
