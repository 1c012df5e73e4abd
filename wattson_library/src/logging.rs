//! Process-wide tracing setup: JSON lines to a file, compact lines to stdout, or both.

use crate::clock::{get_global_clock, ClockWrapper};
use crate::transaction::TransactionId;
use crate::utils::file_utils::ensure_dir;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;

#[derive(Debug, serde::Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `wattson_library=debug,info`.
    pub level: String,
    /// Directory for the JSON log file. Empty disables file logging.
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub stdout: Option<bool>,
    /// The log file is `<basename>.log`.
    pub basename: String,
}

/// Resolve the log file and clear the previous run's log. `None` when file logging is off.
fn fresh_log_file(config: &LoggingConfig) -> Result<Option<(PathBuf, String)>> {
    if config.directory.is_empty() {
        return Ok(None);
    }
    ensure_dir(Path::new(&config.directory))?;
    let dir = match std::fs::canonicalize(&config.directory) {
        Ok(d) => d,
        Err(e) => anyhow::bail!("Log directory '{}' is unusable: {}", config.directory, e),
    };
    let fname = format!("{}.log", config.basename);
    let old = dir.join(&fname);
    if old.exists() {
        if let Err(e) = std::fs::remove_file(&old) {
            anyhow::bail!("Failed to remove old log file '{}': {}", old.display(), e);
        }
    }
    Ok(Some((dir, fname)))
}

/// Install the global subscriber.
/// The returned value owns the background writers and must be kept alive for as long as logging is wanted.
pub fn start_tracing(config: &LoggingConfig, tid: &TransactionId) -> Result<impl Drop> {
    #[allow(dyn_drop)]
    let mut drops: Vec<Box<dyn Drop>> = vec![];

    let file_layer = match fresh_log_file(config)? {
        None => None,
        Some((dir, fname)) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, fname));
            drops.push(Box::new(guard));
            Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_timer(ClockWrapper(get_global_clock(tid)?))
                    .with_writer(writer)
                    .json(),
            )
        },
    };

    let stdout_layer = match config.stdout.unwrap_or(false) {
        true => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            drops.push(Box::new(guard));
            Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_timer(ClockWrapper(get_global_clock(tid)?))
                    .with_writer(writer)
                    .compact(),
            )
        },
        false => None,
    };

    let subscriber = Registry::default()
        .with(EnvFilter::builder().parse(&config.level)?)
        .with(file_layer)
        .with(stdout_layer);
    match tracing::subscriber::set_global_default(subscriber) {
        Ok(_) => {
            info!(tid=%tid, "Logger initialized");
            Ok(drops)
        },
        Err(e) => {
            warn!(tid=%tid, error=%e, "Global tracing subscriber was already set");
            Ok(vec![])
        },
    }
}
