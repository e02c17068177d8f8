// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! relayd — background process hosting the Process Supervisor, Stream
//! Pipeline, Session Pool, and Error Recovery subsystems.
//!
//! Startup/logging/signal-handling shape grounded directly on
//! `crates/daemon/src/main.rs` (`setup_logging` via `tracing-appender` +
//! `tracing-subscriber`, `tokio::signal::unix` handlers, `tokio::select!`
//! main loop, `println!("READY")` startup marker), with the WAL-backed
//! event loop replaced by the Unix socket `Listener` since this daemon has
//! no durable job log to drain.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use relay_daemon::config::DaemonPaths;
use relay_daemon::{listener::Listener, AppState};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Debug, Error)]
enum StartupError {
    #[error("another relayd is already running (lock held at {0})")]
    AlreadyRunning(std::path::PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] relay_core::config::ConfigError),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("relayd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("relayd {}", env!("CARGO_PKG_VERSION"));
                println!("Background daemon hosting the Process Supervisor, Stream Pipeline,");
                println!("Session Pool, and Error Recovery subsystems for the `relay` CLI.");
                return Ok(());
            }
            other => {
                eprintln!("error: unexpected argument '{other}'");
                std::process::exit(1);
            }
        }
    }

    let paths = DaemonPaths::load();
    let _lock = match acquire_lock(&paths) {
        Ok(lock) => lock,
        Err(StartupError::AlreadyRunning(path)) => {
            eprintln!("relayd is already running (lock at {})", path.display());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("failed to start relayd: {e}");
            return Err(e.into());
        }
    };

    let log_guard = setup_logging(&paths)?;
    info!("starting relayd");

    let config = relay_core::Config::load()?;
    let command = std::env::var("RELAY_CLAUDE_BIN").unwrap_or_else(|_| "claude".to_string());
    let state = Arc::new(AppState::new(&config, command));

    std::fs::create_dir_all(&paths.state_dir)?;
    let _ = std::fs::remove_file(&paths.socket_path);
    let unix_listener = UnixListener::bind(&paths.socket_path)?;
    let listener = Listener::new(unix_listener, state.clone(), Instant::now());
    tokio::spawn(listener.run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(socket = %paths.socket_path.display(), "relayd ready");
    println!("READY");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    let _ = std::fs::remove_file(&paths.socket_path);
    drop(log_guard);
    Ok(())
}

struct DaemonLock {
    file: File,
    path: std::path::PathBuf,
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn acquire_lock(paths: &DaemonPaths) -> Result<DaemonLock, StartupError> {
    std::fs::create_dir_all(&paths.state_dir)?;
    let file = std::fs::OpenOptions::new().create(true).write(true).open(&paths.lock_path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(StartupError::AlreadyRunning(paths.lock_path.clone()));
    }
    let mut f = &file;
    f.set_len(0)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(DaemonLock { file, path: paths.lock_path.clone() })
}

fn setup_logging(paths: &DaemonPaths) -> Result<tracing_appender::non_blocking::WorkerGuard, StartupError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(&paths.state_dir)?;
    let file_appender = tracing_appender::rolling::never(&paths.state_dir, paths.log_path.file_name().unwrap_or_default());
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}
