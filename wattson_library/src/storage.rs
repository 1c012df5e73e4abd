//! Persisted application history.
//!
//! The full tree lives in `<data_out>/<app>.json` and is rewritten atomically after every run.
//! `<app>.csv` holds one row per raw reading for tools that want flat data.
//! Only one process may write a given history; `<app>.lock` enforces that.

use crate::bail_error;
use crate::data::{DataNode, NodeType, Reading};
use crate::monitor_config::PostProcessingConfig;
use crate::processing::{append_runs, build_run, new_app, resolve_run_id, RankPayload, RunContext};
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use crate::utils::file::{atomic_write, ensure_dir, try_remove_pth};
use crate::utils::hostname;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoFormat {
    /// hierarchical, the full tree
    Json,
    /// flat, raw readings only
    Csv,
}

impl IoFormat {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(IoFormat::Json),
            "csv" => Ok(IoFormat::Csv),
            other => anyhow::bail!("Unknown output format '{}', expected one of json, csv", other),
        }
    }
    pub fn suffix(&self) -> &'static str {
        match self {
            IoFormat::Json => "json",
            IoFormat::Csv => "csv",
        }
    }
}

/// Where one application's history lives.
#[derive(Debug, Clone)]
pub struct HistoryPaths {
    pub dir: PathBuf,
    pub app: String,
}

impl HistoryPaths {
    pub fn new(dir: impl Into<PathBuf>, app: &str) -> Self {
        HistoryPaths { dir: dir.into(), app: app.to_string() }
    }
    pub fn file(&self, format: IoFormat) -> PathBuf {
        self.dir.join(format!("{}.{}", self.app, format.suffix()))
    }
    pub fn lock(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.app))
    }
    /// Where a rank's samples go when the process is interrupted.
    pub fn partial(&self, rank: usize) -> PathBuf {
        self.dir.join(format!("{}.{}.partial.json", self.app, rank))
    }
}

/// Exclusive right to rewrite one history. Released on drop.
#[derive(Debug)]
pub struct HistoryLock {
    path: PathBuf,
    tid: TransactionId,
}

fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false,
        // exists, but belongs to someone else
        Err(_) => true,
    }
}

impl HistoryLock {
    pub fn acquire(path: &Path, tid: &TransactionId) -> Result<Self> {
        if let Some(dir) = path.parent() {
            ensure_dir(dir)?;
        }
        let me = hostname(tid);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    writeln!(f, "{}\n{}", me, std::process::id())?;
                    debug!(tid=tid, path=%path.display(), "History lock acquired");
                    return Ok(HistoryLock {
                        path: path.to_path_buf(),
                        tid: tid.clone(),
                    });
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let contents = std::fs::read_to_string(path).unwrap_or_default();
                    let mut lines = contents.lines();
                    let host = lines.next().unwrap_or_default().to_string();
                    let pid = lines.next().and_then(|p| p.trim().parse::<i32>().ok());
                    match pid {
                        Some(pid) if host == me && !pid_alive(pid) => {
                            warn!(tid=tid, path=%path.display(), pid=pid, "Reclaiming stale history lock");
                            std::fs::remove_file(path)?;
                        },
                        _ => bail_error!(
                            tid=tid,
                            path=%path.display(),
                            owner_host=%host,
                            owner_pid=?pid,
                            "History is locked by another writer; concurrent writers to one application are not supported"
                        ),
                    }
                },
                Err(e) => bail_error!(tid=tid, path=%path.display(), error=%e, "Unable to create history lock"),
            }
        }
        bail_error!(tid=tid, path=%path.display(), "Lost the race for the history lock")
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        try_remove_pth(&self.path, &self.tid);
    }
}

/// Load the APP tree, if a history exists.
pub fn load_app(path: &Path, tid: &TransactionId) -> Result<Option<DataNode>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(path)?;
    let app: DataNode = match serde_json::from_reader(std::io::BufReader::new(file)) {
        Ok(a) => a,
        Err(e) => bail_error!(tid=tid, path=%path.display(), error=%e, "Corrupt application history"),
    };
    if app.node_type != NodeType::App {
        bail_error!(tid=tid, path=%path.display(), node_type=?app.node_type, "History root is not an APP node");
    }
    Ok(Some(app))
}

pub fn save_app(path: &Path, app: &DataNode, tid: &TransactionId) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(app)?;
    atomic_write(path, &bytes, tid)
}

/// One raw reading in the flat export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    pub run_id: String,
    pub hostname: String,
    pub device_group: String,
    pub sensor: String,
    pub unit: String,
    pub magnitude: String,
    pub timestep: u64,
    pub value: String,
}

impl CsvRow {
    pub fn reading(&self) -> Result<Reading> {
        let unit = match Unit::from_symbol(&self.unit) {
            Some(u) => u,
            None => anyhow::bail!("Unknown unit '{}' for sensor '{}'", self.unit, self.sensor),
        };
        let magnitude = match Magnitude::from_prefix(&self.magnitude) {
            Some(m) => m,
            None => anyhow::bail!("Unknown magnitude '{}' for sensor '{}'", self.magnitude, self.sensor),
        };
        Ok(Reading {
            timestamp_ns: self.timestep,
            value: Number::parse(&self.value)?,
            unit,
            magnitude,
        })
    }
}

/// Every raw reading under `node`, tagged with the run, host and device it came from.
pub fn csv_rows(node: &DataNode) -> Vec<CsvRow> {
    let mut rows = vec![];
    collect_rows(node, "", "", "", &mut rows);
    rows
}

fn collect_rows(node: &DataNode, run: &str, host: &str, device: &str, rows: &mut Vec<CsvRow>) {
    let (run, host, device) = match node.node_type {
        NodeType::Run => (node.id.as_str(), host, device),
        NodeType::Node => (run, node.id.as_str(), device),
        NodeType::Device => (run, host, node.id.as_str()),
        _ => (run, host, device),
    };
    if let Some(raw) = &node.raw {
        for r in raw.readings() {
            rows.push(CsvRow {
                run_id: run.to_string(),
                hostname: host.to_string(),
                device_group: device.to_string(),
                sensor: raw.descriptor.id.clone(),
                unit: r.unit.symbol().to_string(),
                magnitude: r.magnitude.prefix().to_string(),
                timestep: r.timestamp_ns,
                value: r.value.to_string(),
            });
        }
    }
    for c in node.children.values() {
        collect_rows(c, run, host, device, rows);
    }
}

pub fn write_csv(path: &Path, node: &DataNode, tid: &TransactionId) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for row in csv_rows(node) {
        wtr.serialize(row)?;
    }
    let bytes = match wtr.into_inner() {
        Ok(b) => b,
        Err(e) => bail_error!(tid=tid, error=%e, "Failed to finish CSV export"),
    };
    atomic_write(path, &bytes, tid)
}

pub fn read_csv(path: &Path) -> Result<Vec<CsvRow>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut rows = vec![];
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Load-modify-save of the history under its lock: append `runs` as one MULTI_RUN and rewrite
/// every requested format. The JSON history is always written since it is the persisted state.
/// Returns the updated APP and the id of the new MULTI_RUN.
pub fn persist_runs(
    paths: &HistoryPaths,
    runs: Vec<DataNode>,
    formats: &[IoFormat],
    tid: &TransactionId,
) -> Result<(DataNode, String)> {
    let _lock = HistoryLock::acquire(&paths.lock(), tid)?;
    let json = paths.file(IoFormat::Json);
    let mut app = match load_app(&json, tid)? {
        Some(a) => a,
        None => new_app(&paths.app),
    };
    let multi_run = append_runs(&mut app, runs, tid)?;
    save_app(&json, &app, tid)?;
    if formats.contains(&IoFormat::Csv) {
        write_csv(&paths.file(IoFormat::Csv), &app, tid)?;
    }
    info!(tid=tid, path=%json.display(), multi_run=%multi_run, "Application history saved");
    Ok((app, multi_run))
}

/// Dump an interrupted rank's samples so they can be aggregated later.
pub fn write_partial(paths: &HistoryPaths, payload: &RankPayload, tid: &TransactionId) -> Result<PathBuf> {
    let path = paths.partial(payload.rank);
    atomic_write(&path, &serde_json::to_vec(payload)?, tid)?;
    warn!(tid=tid, path=%path.display(), "Partial samples flushed");
    Ok(path)
}

pub fn read_partial(path: &Path) -> Result<RankPayload> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Partial files left in the history directory by interrupted measurements of this application.
pub fn leftover_partials(paths: &HistoryPaths) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}.*.partial.json",
        glob::Pattern::escape(&paths.dir.to_string_lossy()),
        glob::Pattern::escape(&paths.app)
    );
    let prefix = format!("{}.", paths.app);
    let mut found = vec![];
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        // `<app>.<rank>.partial.json` only, not another application sharing the prefix
        let is_rank = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|n| n.strip_suffix(".partial.json"))
            .map(|r| r.parse::<usize>().is_ok())
            .unwrap_or(false);
        if is_rank {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Turn partial files into one RUN marked `interrupted`, append it to the history as its own
/// MULTI_RUN and remove the files. Returns that MULTI_RUN's id, `None` if nothing was left over.
/// Unreadable files are left in place.
pub fn recover_partials(
    paths: &HistoryPaths,
    post: &PostProcessingConfig,
    sampling_period: f64,
    formats: &[IoFormat],
    tid: &TransactionId,
) -> Result<Option<String>> {
    let mut used = vec![];
    let mut payloads = vec![];
    for path in leftover_partials(paths)? {
        match read_partial(&path) {
            Ok(p) => {
                payloads.push(p);
                used.push(path);
            },
            Err(e) => warn!(tid=tid, path=%path.display(), error=%e, "Skipping unreadable partial samples"),
        }
    }
    let size = match payloads.iter().map(|p| p.rank + 1).max() {
        Some(s) => s,
        None => return Ok(None),
    };
    let started_ns = payloads
        .iter()
        .map(|p| p.buffer.started_ns)
        .filter(|s| *s > 0)
        .min()
        .unwrap_or_default();
    let mut slots: Vec<Option<RankPayload>> = (0..size).map(|_| None).collect();
    for p in payloads {
        let rank = p.rank;
        slots[rank] = Some(p);
    }
    let ctx = RunContext {
        run_id: resolve_run_id(None, started_ns, tid)?,
        post,
        sampling_period,
        started_ns,
    };
    let mut run = build_run(&ctx, slots, tid)?;
    run.metadata.insert("interrupted".to_string(), "true".to_string());
    let (_, multi_run) = persist_runs(paths, vec![run], formats, tid)?;
    for path in &used {
        try_remove_pth(path, tid);
    }
    info!(tid=tid, files=used.len(), multi_run=%multi_run, "Recovered samples of an interrupted run");
    Ok(Some(multi_run))
}
