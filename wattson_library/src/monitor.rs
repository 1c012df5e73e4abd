//! Drives repeated measurements of a target and appends them to the application history.

use crate::bail_error;
use crate::comm::Comm;
use crate::continuation::install_interrupt_handler;
use crate::data::DataNode;
use crate::monitor_config::WattsonConfig;
use crate::session::{app_name, HostContext, Session};
use crate::storage::{persist_runs, recover_partials, HistoryPaths, IoFormat};
use crate::transaction::{TransactionId, COORDINATOR_TID};
use crate::utils::wait_for_exit_signal;
use anyhow::Result;
use std::os::unix::process::ExitStatusExt;
use std::panic::AssertUnwindSafe;
use std::process::ExitStatus;
use tracing::{debug, error, info, warn};

type HostSource = Box<dyn FnMut(&WattsonConfig, &TransactionId) -> HostContext + Send>;

pub struct Monitor {
    config: WattsonConfig,
    app: String,
    comm: Option<Comm>,
    discover: HostSource,
    history: Option<DataNode>,
    /// MULTI_RUN appended by the last invocation
    latest: Option<String>,
    tid: TransactionId,
}

/// Shell-style exit code: the process's own code, or 128 + the signal that killed it.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(c) => c,
        None => 128 + status.signal().unwrap_or(0),
    }
}

impl Monitor {
    /// Attach to the configured world. `app` defaults to the configured or executable name.
    pub fn new(config: &WattsonConfig, app: Option<&str>) -> Result<Self> {
        let comm = Comm::from_config(&config.coordination, config.barrier_timeout(), &COORDINATOR_TID)?;
        Ok(Self::with_comm(config, app, comm))
    }

    pub fn with_comm(config: &WattsonConfig, app: Option<&str>, comm: Comm) -> Self {
        Monitor {
            config: config.clone(),
            app: app.map(str::to_string).unwrap_or_else(|| app_name(config)),
            comm: Some(comm),
            discover: Box::new(HostContext::discover),
            history: None,
            latest: None,
            tid: COORDINATOR_TID.clone(),
        }
    }

    /// Replace how each round inspects the host, e.g. to supply prepared backends.
    pub fn with_host_source(mut self, source: HostSource) -> Self {
        self.discover = source;
        self
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// The APP tree after the last persisted measurement. Only the collector has one.
    pub fn history(&self) -> Option<&DataNode> {
        self.history.as_ref()
    }

    /// The MULTI_RUN holding the rounds of the last invocation.
    pub fn latest(&self) -> Option<&DataNode> {
        self.history.as_ref()?.child(self.latest.as_deref()?)
    }

    fn begin(&mut self) -> Option<Session> {
        let comm = self.comm.take()?;
        let host = (self.discover)(&self.config, &self.tid);
        match Session::begin_with(&self.config, &self.app, comm, host) {
            Ok(s) => Some(s),
            Err(e) => {
                error!(tid=self.tid, error=%e, "Measurement could not start, running the target unmeasured");
                None
            },
        }
    }

    fn end(&mut self, session: Session, runs: &mut Vec<DataNode>) {
        match session.end() {
            Ok(m) => {
                runs.extend(m.run);
                self.comm = Some(m.comm);
            },
            Err(e) => error!(tid=self.tid, error=%e, "Measurement failed to finish, later rounds run unmeasured"),
        }
    }

    fn persist(&mut self, runs: Vec<DataNode>) -> Result<()> {
        if runs.is_empty() {
            return Ok(());
        }
        let formats = self
            .config
            .output
            .formats
            .iter()
            .map(|f| IoFormat::from_name(f))
            .collect::<Result<Vec<_>>>()?;
        let paths = HistoryPaths::new(&self.config.output.data_out, &self.app);
        let post = &self.config.post_processing;
        if let Err(e) = recover_partials(&paths, post, self.config.monitor.sampling_period, &formats, &self.tid) {
            warn!(tid=self.tid, error=%e, "Could not recover samples of an interrupted run");
        }
        let (app, multi_run) = persist_runs(&paths, runs, &formats, &self.tid)?;
        self.history = Some(app);
        self.latest = Some(multi_run);
        Ok(())
    }

    /// Run `f` for the warmup rounds unmeasured, then measure it for every round.
    /// Returns the last round's result. If `f` panics, what was measured so far is persisted
    /// before the panic continues.
    pub fn monitor_fn<F, R>(&mut self, mut f: F) -> Result<R>
    where
        F: FnMut() -> R,
    {
        install_interrupt_handler(&self.tid);
        for round in 0..self.config.benchmarking.warmup_rounds {
            debug!(tid=self.tid, round=round, "Warmup round");
            f();
        }
        let mut runs = vec![];
        let mut last = None;
        for round in 0..self.config.benchmarking.rounds {
            debug!(tid=self.tid, round=round, "Measured round");
            let session = self.begin();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(&mut f));
            if let Some(s) = session {
                self.end(s, &mut runs);
            }
            match outcome {
                Ok(r) => last = Some(r),
                Err(panic) => {
                    warn!(tid=self.tid, round=round, "Target panicked, persisting partial results");
                    if let Err(e) = self.persist(runs) {
                        error!(tid=self.tid, error=%e, "Failed to persist partial results");
                    }
                    std::panic::resume_unwind(panic);
                },
            }
        }
        self.persist(runs)?;
        match last {
            Some(r) => Ok(r),
            None => bail_error!(tid=self.tid, "No measured rounds were run"),
        }
    }

    /// Spawn `argv` once per round under measurement and return the last exit status unchanged.
    /// SIGINT, SIGTERM and SIGQUIT received meanwhile are forwarded to the target, and the measurement
    /// finishes normally once it exits.
    /// The two synchronization points block the calling worker thread.
    pub async fn monitor_command(&mut self, argv: &[String]) -> Result<ExitStatus> {
        let (exe, args) = match argv.split_first() {
            Some(split) => split,
            None => bail_error!(tid=self.tid, "No command to monitor"),
        };
        for round in 0..self.config.benchmarking.warmup_rounds {
            debug!(tid=self.tid, round=round, "Warmup round");
            run_child(exe, args, &self.tid).await?;
        }
        let mut runs = vec![];
        let mut last = None;
        for round in 0..self.config.benchmarking.rounds {
            let session = self.begin();
            let outcome = run_child(exe, args, &self.tid).await;
            if let Some(s) = session {
                self.end(s, &mut runs);
            }
            match outcome {
                Ok(status) => {
                    if !status.success() {
                        warn!(tid=self.tid, round=round, code=exit_code(&status), "Target exited unsuccessfully");
                    }
                    last = Some(status);
                },
                Err(e) => {
                    if let Err(pe) = self.persist(runs) {
                        error!(tid=self.tid, error=%pe, "Failed to persist partial results");
                    }
                    return Err(e);
                },
            }
        }
        self.persist(runs)?;
        match last {
            Some(s) => {
                info!(tid=self.tid, code=exit_code(&s), "Target finished");
                Ok(s)
            },
            None => bail_error!(tid=self.tid, "No measured rounds were run"),
        }
    }
}

async fn run_child(exe: &str, args: &[String], tid: &TransactionId) -> Result<ExitStatus> {
    let mut child = match tokio::process::Command::new(exe).args(args).spawn() {
        Ok(c) => c,
        Err(e) => bail_error!(tid=tid, command=%exe, error=%e, "Spawning target failed"),
    };
    debug!(tid=tid, command=%exe, pid=?child.id(), "Target started");
    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),
            sig = wait_for_exit_signal(tid) => {
                let sig = nix::sys::signal::Signal::try_from(sig?)?;
                match child.id() {
                    Some(pid) => {
                        info!(tid=tid, signal=%sig, pid=pid, "Forwarding signal to target");
                        if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig) {
                            warn!(tid=tid, error=%e, "Failed to forward signal");
                        }
                    },
                    None => debug!(tid=tid, "Target already exited, signal not forwarded"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendSet;
    use crate::monitor_config::MonitorConfig;
    use crate::transaction::TEST_TID;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config(dir: &std::path::Path, rounds: u32, warmup: u32) -> WattsonConfig {
        MonitorConfig::boxed(
            None,
            Some(vec![
                ("monitor.sampling_period".to_string(), "0.01".to_string()),
                ("benchmarking.rounds".to_string(), rounds.to_string()),
                ("benchmarking.warmup_rounds".to_string(), warmup.to_string()),
                ("output.data_out".to_string(), dir.to_string_lossy().to_string()),
            ]),
        )
        .unwrap()
    }

    fn bare_host(_: &WattsonConfig, _: &TransactionId) -> HostContext {
        HostContext {
            hostname: "bare".to_string(),
            backends: BackendSet {
                active: vec![],
                excluded: BTreeMap::new(),
            },
        }
    }

    fn monitor(cfg: &WattsonConfig, app: &str) -> Monitor {
        Monitor::with_comm(cfg, Some(app), Comm::local(&TEST_TID)).with_host_source(Box::new(bare_host))
    }

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(&ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn rounds_and_warmup_counted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 3, 2);
        let mut m = monitor(&cfg, "fn_app");
        let mut calls = 0;
        let out = m
            .monitor_fn(|| {
                calls += 1;
                calls * 10
            })
            .unwrap();
        assert_eq!(out, 50);
        assert_eq!(calls, 5);
        let app = m.history().unwrap();
        assert_eq!(app.children.len(), 1);
        let mr = m.latest().unwrap();
        assert_eq!(mr.children.len(), 3);
        assert!(dir.path().join("fn_app.json").exists());
    }

    #[test]
    fn panicking_target_still_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 2, 0);
        let mut m = monitor(&cfg, "crashy");
        let res = std::panic::catch_unwind(AssertUnwindSafe(|| {
            m.monitor_fn(|| -> u32 { panic!("target blew up") })
        }));
        assert!(res.is_err());
        assert!(dir.path().join("crashy.json").exists());
        assert!(!dir.path().join("crashy.lock").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_exit_status_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Arc<MonitorConfig> = config(dir.path(), 1, 0);
        let mut m = monitor(&cfg, "cmd");
        let status = m
            .monitor_command(&["sh".to_string(), "-c".to_string(), "exit 7".to_string()])
            .await
            .unwrap();
        assert_eq!(exit_code(&status), 7);
        assert!(m.history().is_some());
        assert!(m.monitor_command(&[]).await.is_err());
    }
}
