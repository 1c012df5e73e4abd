pub mod file_utils;
pub use file_utils as file;

use crate::bail_error;
use crate::transaction::TransactionId;
use anyhow::Result;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};

/// Name of the local host, used to group ranks into NODE entries.
pub fn hostname(tid: &TransactionId) -> String {
    match nix::unistd::gethostname() {
        Ok(h) => h.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(tid=tid, error=%e, "Unable to read hostname");
            "localhost".to_string()
        },
    }
}

/// First environment variable of `keys` that is set and non-empty.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
}

/// Make `id` unique among `existing` by appending `_N`.
pub fn increase_id_counter<'a, I>(existing: I, id: &str) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let existing = existing.into_iter().collect::<Vec<&String>>();
    if !existing.iter().any(|e| e.as_str() == id) {
        return id.to_string();
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{}_{}", id, counter);
        if !existing.iter().any(|e| **e == candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Matches `text` against a shell-style glob `pattern`.
/// An invalid pattern is treated as a literal.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(text),
        Err(_) => pattern == text,
    }
}

/// Waits for an expected exit signal from the OS
/// Any of these: sigint, sig_term, sig_quit
/// Returns the raw value of the signal that arrived.
pub async fn wait_for_exit_signal(tid: &TransactionId) -> Result<i32> {
    let mut sig_int = try_create_signal(tid, SignalKind::interrupt())?;
    let mut sig_term = try_create_signal(tid, SignalKind::terminate())?;
    let mut sig_quit = try_create_signal(tid, SignalKind::quit())?;

    info!(tid = tid, "Waiting on exit signal");
    let (res, kind) = tokio::select! {
      res = sig_int.recv() => (res, SignalKind::interrupt()),
      res = sig_term.recv() => (res, SignalKind::terminate()),
      res = sig_quit.recv() => (res, SignalKind::quit()),
    };
    if res.is_none() {
        error!(
            tid = tid,
            "Unknown failure waiting on exit signal. Stream broken. Exiting."
        );
    }
    Ok(kind.as_raw_value())
}
fn try_create_signal(tid: &TransactionId, kind: SignalKind) -> Result<Signal> {
    match signal(kind) {
        Ok(s) => Ok(s),
        Err(e) => {
            bail_error!(error=%e, tid=tid, kind=kind.as_raw_value(), "Failed to create signal")
        },
    }
}
