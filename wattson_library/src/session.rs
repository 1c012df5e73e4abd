//! One measurement: the two synchronization points around an opaque target, plus region records.
//!
//! `begin` discovers backends, agrees with the other ranks on who samples which device, waits on a
//! start barrier and starts the sampler. `end` stops the sampler, waits on a stop barrier and
//! gathers every rank's samples to the collector, which builds the RUN.

use crate::assignment::{assign_devices, devices_from_sensors, visibility_hint, RankInventory};
use crate::backends::{discover_backends, BackendSet, SensorFilter};
use crate::bail_error;
use crate::clock::unix_nanos;
use crate::comm::Comm;
use crate::continuation::{install_interrupt_handler, FlushGuard, GLOB_CONT_CHECK};
use crate::data::{DataNode, RegionRecord};
use crate::monitor_config::WattsonConfig;
use crate::processing::{build_run, resolve_run_id, RankPayload, RunContext};
use crate::sampler::{SampleBuffer, Sampler, SamplerState};
use crate::storage::{write_partial, HistoryPaths};
use crate::transaction::{TransactionId, COORDINATOR_TID};
use crate::utils::hostname;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What this rank brings to a measurement.
pub struct HostContext {
    pub hostname: String,
    pub backends: BackendSet,
}

impl HostContext {
    /// Discover the local host with the configured filters.
    pub fn discover(config: &WattsonConfig, tid: &TransactionId) -> Self {
        let filter = SensorFilter::new(&config.monitor);
        HostContext {
            hostname: hostname(tid),
            backends: discover_backends(&config.paths, &filter, tid),
        }
    }
}

/// The collector's RUN, if this rank is the collector, and the communicator for reuse.
pub struct Measured {
    pub run: Option<DataNode>,
    pub comm: Comm,
}

type PartialFlush = Arc<dyn Fn(&TransactionId) + Send + Sync>;

pub struct Session {
    /// declared before `sampler` so the hook's clone is gone before the sampler drops
    flush: Option<FlushGuard<'static>>,
    flush_partial: PartialFlush,
    sampler: Sampler,
    /// taken by [Session::end]
    comm: Option<Comm>,
    rank: usize,
    config: WattsonConfig,
    hostname: String,
    regions: Arc<Mutex<Vec<RegionRecord>>>,
    excluded: BTreeMap<String, String>,
    metadata: BTreeMap<String, String>,
    started_ns: u64,
    tid: TransactionId,
}

/// Records a region call when dropped.
pub struct RegionGuard<'a> {
    session: &'a Session,
    name: String,
    start_ns: u64,
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .session
            .record_region(&self.name, self.session.rank, self.start_ns, unix_nanos())
        {
            warn!(tid=self.session.tid, region=%self.name, error=%e, "Dropping region record");
        }
    }
}

/// Start measuring this process, attached to whatever world the configuration describes.
/// Partial samples are flushed to `<data_out>` if the process is interrupted.
pub fn begin_measurement(config: &WattsonConfig) -> Result<Session> {
    let tid: &TransactionId = &COORDINATOR_TID;
    install_interrupt_handler(tid);
    let comm = Comm::from_config(&config.coordination, config.barrier_timeout(), tid)?;
    let app = app_name(config);
    Session::begin(config, &app, comm)
}

/// The configured application name, else the running executable's name.
pub fn app_name(config: &WattsonConfig) -> String {
    if let Some(a) = config.output.app_name.as_ref().filter(|a| !a.trim().is_empty()) {
        return a.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string())
}

impl Session {
    pub fn begin(config: &WattsonConfig, app: &str, comm: Comm) -> Result<Self> {
        let host = HostContext::discover(config, &COORDINATOR_TID);
        Self::begin_with(config, app, comm, host)
    }

    /// Like [Session::begin] with an already discovered host.
    pub fn begin_with(config: &WattsonConfig, app: &str, mut comm: Comm, host: HostContext) -> Result<Self> {
        let tid: TransactionId = COORDINATOR_TID.clone();
        let rank = comm.rank();
        let filter = SensorFilter::new(&config.monitor);
        let sensors = host.backends.sensors(&filter);
        let inventory = RankInventory {
            rank,
            hostname: host.hostname.clone(),
            devices: devices_from_sensors(&sensors),
            visibility: visibility_hint(&config.coordination),
        };
        let inventories = comm.allgather_json(&inventory, config.barrier_timeout())?;
        let present = inventories.into_iter().flatten().collect::<Vec<RankInventory>>();
        if present.len() < comm.size() {
            warn!(tid=tid, present=present.len(), size=comm.size(), "Assigning devices without every rank's inventory");
        }
        let assignment = assign_devices(&present);
        let mine = assignment.get(&rank).cloned().unwrap_or_default();
        let assigned = sensors
            .into_iter()
            .filter(|s| mine.contains(&s.device))
            .collect::<Vec<_>>();
        info!(tid=tid, rank=rank, devices=?mine, sensors=assigned.len(), "Devices assigned");

        let metadata = host.backends.metadata();
        let excluded = host.backends.excluded.clone();
        let sampler = Sampler::new(&config.monitor, &crate::transaction::SAMPLER_TID);
        sampler.arm(host.backends.active, &assigned)?;

        let lost = comm.barrier(config.barrier_timeout())?;
        if !lost.is_empty() {
            warn!(tid=tid, lost=?lost, "Ranks missed the start barrier");
        }
        let started_ns = unix_nanos();
        sampler.start()?;

        let regions = Arc::new(Mutex::new(vec![]));
        let partial: PartialFlush = {
            let sampler = sampler.clone();
            let regions = regions.clone();
            let paths = HistoryPaths::new(&config.output.data_out, app);
            let (hostname, excluded, metadata) = (host.hostname.clone(), excluded.clone(), metadata.clone());
            Arc::new(move |tid: &TransactionId| match sampler.stop() {
                Ok(buffer) => {
                    let payload = RankPayload {
                        rank,
                        hostname: hostname.clone(),
                        buffer,
                        regions: regions.lock().clone(),
                        excluded: excluded.clone(),
                        metadata: metadata.clone(),
                    };
                    if let Err(e) = write_partial(&paths, &payload, tid) {
                        error!(tid=tid, error=%e, "Failed to flush partial samples");
                    }
                },
                Err(e) => error!(tid=tid, error=%e, "Sampler could not be stopped for flushing"),
            })
        };
        let hook = partial.clone();
        let flush = GLOB_CONT_CHECK.register_flush(Box::new(move |tid: &TransactionId| hook(tid)));

        Ok(Session {
            flush: Some(flush),
            flush_partial: partial,
            sampler,
            comm: Some(comm),
            rank,
            config: config.clone(),
            hostname: host.hostname,
            regions,
            excluded,
            metadata,
            started_ns,
            tid,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Record one call of a named region on `rank`, in unix nanoseconds.
    pub fn record_region(&self, name: &str, rank: usize, start_ns: u64, end_ns: u64) -> Result<()> {
        if end_ns < start_ns {
            bail_error!(tid=self.tid, region=name, start_ns=start_ns, end_ns=end_ns, "Region ends before it starts");
        }
        self.regions.lock().push(RegionRecord {
            name: name.to_string(),
            rank,
            start_ns,
            end_ns,
        });
        Ok(())
    }

    /// Record a call of `name` spanning the guard's lifetime.
    pub fn region(&self, name: &str) -> RegionGuard<'_> {
        RegionGuard {
            session: self,
            name: name.to_string(),
            start_ns: unix_nanos(),
        }
    }

    /// Stop sampling and hand this rank's data to the collector.
    pub fn end_measurement(self) -> Result<Option<DataNode>> {
        Ok(self.end()?.run)
    }

    /// [Session::end_measurement], returning the communicator for another measurement.
    pub fn end(mut self) -> Result<Measured> {
        let tid = self.tid.clone();
        let mut comm = match self.comm.take() {
            Some(c) => c,
            None => bail_error!(tid=tid, "Session has no communicator"),
        };
        let buffer = match self.sampler.stop() {
            Ok(b) => b,
            Err(e) => {
                error!(tid=tid, error=%e, "Sampler failed to drain, continuing without this rank's samples");
                SampleBuffer::default()
            },
        };
        self.flush.take();
        let lost = comm.barrier(self.config.barrier_timeout())?;
        if !lost.is_empty() {
            warn!(tid=tid, lost=?lost, "Ranks missed the stop barrier");
        }
        let payload = RankPayload {
            rank: self.rank,
            hostname: self.hostname.clone(),
            buffer,
            regions: std::mem::take(&mut *self.regions.lock()),
            excluded: std::mem::take(&mut self.excluded),
            metadata: std::mem::take(&mut self.metadata),
        };
        let gathered = comm.gather_json(&payload, self.config.gather_timeout())?;
        drop(payload);
        let run = match gathered {
            Some(payloads) => {
                let run_id = resolve_run_id(self.config.output.run_id.as_deref(), self.started_ns, &tid)?;
                let ctx = RunContext {
                    run_id,
                    post: &self.config.post_processing,
                    sampling_period: self.config.monitor.sampling_period,
                    started_ns: self.started_ns,
                };
                let ranks = payloads.iter().flatten().map(|p| p.rank).collect::<BTreeSet<_>>();
                debug!(tid=tid, ranks=?ranks, "Building run from gathered samples");
                Some(build_run(&ctx, payloads, &tid)?)
            },
            None => None,
        };
        Ok(Measured { run, comm })
    }
}

/// A session dropped without [Session::end] still leaves its samples behind as a partial file.
impl Drop for Session {
    fn drop(&mut self) {
        if self.flush.take().is_none() {
            return;
        }
        match self.sampler.state() {
            SamplerState::Sampling | SamplerState::Armed => {
                warn!(tid=self.tid, rank=self.rank, "Session dropped while measuring, flushing partial samples");
                (self.flush_partial)(&self.tid);
            },
            _ => (),
        }
    }
}
