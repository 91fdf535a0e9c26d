//! `tracing` subscriber setup driven by the `logging` config section.
//!
//! `RUST_LOG`, when set, wins over the configured level. Installing is
//! best-effort: a host that already owns the global subscriber keeps it.

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Mutex;

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogLevel, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter directive for the configured level. `fatal` has no `tracing`
/// counterpart and maps to `error`.
pub fn level_directive(config: &LoggingConfig) -> &'static str {
    if config.enable_debug {
        return "debug";
    }
    match config.level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Fatal => "error",
    }
}

fn open_log_file(config: &LoggingConfig) -> Option<File> {
    let path = config.file.as_ref()?;
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("cannot open log file {}: {}, logging to stderr", path.display(), err);
            None
        }
    }
}

fn fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer().with_target(true).with_thread_names(true);
    match (open_log_file(config), config.timestamps) {
        (Some(file), true) => layer.with_ansi(false).with_writer(Mutex::new(file)).boxed(),
        (Some(file), false) => layer
            .with_ansi(false)
            .without_time()
            .with_writer(Mutex::new(file))
            .boxed(),
        (None, true) => layer.with_ansi(config.colors).with_writer(io::stderr).boxed(),
        (None, false) => layer
            .with_ansi(config.colors)
            .without_time()
            .with_writer(io::stderr)
            .boxed(),
    }
}

/// Installs the global subscriber. Returns false when one was already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(config)));

    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(filter)
        .try_init()
        .is_ok()
}
