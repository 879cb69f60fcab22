use std::io;
use std::path::Path;

use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Keeps the non-blocking log writers alive; dropping it flushes them.
pub struct LoggerGuard {
    _file_guard: Option<WorkerGuard>,
    _stdio_guard: WorkerGuard,
}

/// Installs the global tracing subscriber: non-blocking stdout, plus a log
/// file when one is configured.
pub fn init(log_file: Option<&Path>, directive: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let folder = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let file_name = path
                .file_name()
                .context("invalid log path (file_name)")?;
            let appender = tracing_appender::rolling::never(folder, file_name);
            let (non_blocking_file, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(non_blocking_file).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let env_filter =
        EnvFilter::try_new(directive.unwrap_or("info")).context("invalid log filtering directive")?;

    tracing_subscriber::registry()
        .with(stdio_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
