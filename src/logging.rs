//! Tracing setup for the `foreman` binary.
//!
//! - stderr layer, compact text or JSON (`--log-json`)
//! - daily rolling file under `.foreman/logs/foreman.log`
//!
//! Filtering comes from `FOREMAN_LOG`, then `RUST_LOG`, defaulting to `info`
//! (`debug` with `--verbose`).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Options for [`init`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub verbose: bool,
    pub json: bool,
}

fn build_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    std::env::var("FOREMAN_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

/// Install the global subscriber. The returned guard flushes the file writer
/// on drop and must be held for the life of the process.
///
/// When `log_dir` is `None` only the stderr layer is installed.
pub fn init(log_dir: Option<&Path>, opts: LogOptions) -> Option<WorkerGuard> {
    let filter = build_filter(opts.verbose);

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "foreman.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let result = if opts.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("[foreman] tracing already initialized: {}", e);
    }

    guard
}
