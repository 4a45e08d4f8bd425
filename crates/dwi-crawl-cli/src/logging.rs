use std::env;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "./logs/dwi-crawl.log";

/// Console output on stderr plus a plain-text log file.
///
/// `TRACING_LEVEL` sets the filter (default `info`), `LOG_FILE_PATH` the
/// file, and `LOG_ROTATION=daily` switches to one file per day. The
/// returned guard flushes the file on drop.
pub fn init_logger() -> WorkerGuard {
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_file = PathBuf::from(
        env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string()),
    );
    let daily = env::var("LOG_ROTATION").is_ok_and(|value| value.eq_ignore_ascii_case("daily"));

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(&log_file, daily));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_thread_names(true)
                .with_ansi(false),
        )
        .with(EnvFilter::new(filter))
        .init();

    info!(
        "Logging to {}{}",
        log_file.display(),
        if daily { " (rotated daily)" } else { "" }
    );

    guard
}

fn file_appender(log_file: &Path, daily: bool) -> RollingFileAppender {
    let dir = log_file
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = log_file
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "dwi-crawl.log".into());

    if daily {
        rolling::daily(dir, name)
    } else {
        rolling::never(dir, name)
    }
}
