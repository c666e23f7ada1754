//! Tracing configuration and log routing.
//!
//! Stage processes log to stdout with a compact formatter and to a per-process file. Several
//! stages usually share a host (or a volume), so the default file is named after the process:
//! `logs/dms-<process>.log`. `DMS_LOG_FILE` overrides the path, `DMS_LOG_DIR` only the directory.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where the file layer writes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogFile {
    /// Append to an explicit path.
    Explicit(PathBuf),
    /// Create `<dir>/dms-<process>.log`.
    Named { dir: PathBuf, file_name: String },
}

impl LogFile {
    fn resolve(process: &str) -> Self {
        if let Ok(path) = std::env::var("DMS_LOG_FILE")
            && !path.trim().is_empty()
        {
            return Self::Explicit(PathBuf::from(path));
        }
        let dir = std::env::var("DMS_LOG_DIR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "logs".to_string());
        Self::Named {
            dir: PathBuf::from(dir),
            file_name: format!("dms-{}.log", sanitize_process_name(process)),
        }
    }
}

/// Configure tracing subscribers for stdout and file logging.
///
/// - Respects `RUST_LOG` for filtering (defaults to `info`).
/// - Installs a compact stdout layer and, when the file can be opened, a file layer.
/// - Keeps the non‑blocking writer guard alive for the process lifetime.
pub fn init_tracing(process: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    if let Some(writer) = configure_file_writer(LogFile::resolve(process)) {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact();

        registry.with(file_layer).init();
    } else {
        registry.init();
    }
}

fn configure_file_writer(target: LogFile) -> Option<NonBlocking> {
    match target {
        LogFile::Explicit(path) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => Some(install_writer(file)),
            Err(err) => {
                eprintln!("Failed to open log file {}: {err}", path.display());
                None
            }
        },
        LogFile::Named { dir, file_name } => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                eprintln!("Failed to create logs directory {}: {err}", dir.display());
                return None;
            }
            Some(install_writer(tracing_appender::rolling::never(dir, file_name)))
        }
    }
}

fn install_writer<W>(writer: W) -> NonBlocking
where
    W: std::io::Write + Send + 'static,
{
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    let _ = LOG_GUARD.set(guard);
    non_blocking
}

fn sanitize_process_name(process: &str) -> String {
    let cleaned: String = process
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "pipeline".to_string()
    } else {
        cleaned
    }
}
