// System
use std::path::Path;

// Third Party
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "controller";

/// Daily-rotated `controller.<date>.log` files in `dir`, written off the calling thread.
pub fn log_file_writer(
    dir: &Path,
) -> std::io::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over `level`. With a
/// `log_dir`, events are also written to files there; keep the returned guard alive until exit
/// so buffered lines are flushed.
pub fn init_tracing(
    level: &str,
    json: bool,
    log_dir: Option<&Path>,
) -> std::io::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = log_file_writer(dir)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
    Ok(guard)
}

/// Cancel `token` on the first SIGINT or SIGTERM.
pub fn setup_exit_hooks(token: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal");
            token.cancel();
        }
        // Second signal: exit without waiting for tasks.
        if signals.forever().next().is_some() {
            warn!("Received second shutdown signal, exiting immediately");
            std::process::exit(130);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_writer_creates_directory() {
        let dir = std::env::temp_dir().join(format!("kube-mirror-logs-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let (_writer, guard) = log_file_writer(&dir).unwrap();
        assert!(dir.is_dir());
        drop(guard);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
