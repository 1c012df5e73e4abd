//! Hardware information sources.
//!
//! Every source implements [Backend]; [BackendKind] enumerates the compiled-in variants so they can be
//! checked cheaply and constructed on demand.
use crate::data::SensorDescriptor;
use crate::monitor_config::{PathConfig, SamplingConfig};
use crate::transaction::TransactionId;
use crate::units::Number;
use crate::utils::glob_match;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, info, warn};

pub mod cpu_freq;
pub mod host;
pub mod hwmon;
pub mod nvml;
pub mod powercap;
pub mod rocm;

/// Re-read an integer sysfs attribute through a handle kept open between ticks.
pub(crate) fn read_open_u64(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut buff = String::new();
    file.read_to_string(&mut buff)?;
    Ok(buff.trim_end().parse::<u64>()?)
}

/// Values read in one call, plus the sensors that could not be read.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadBatch {
    pub values: Vec<(String, Number)>,
    /// sensor id and reason
    pub failed: Vec<(String, String)>,
}

/// One hardware information source.
/// Dropping the backend releases whatever handles it holds.
pub trait Backend: Send {
    fn name(&self) -> &str;
    /// Static facts about the source, e.g. driver version.
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
    /// Sensors readable on this host.
    fn sensors(&self) -> Vec<SensorDescriptor>;
    /// Read the given sensors.
    /// Per-sensor problems are reported in [ReadBatch::failed]; an `Err` means the whole source is broken.
    fn read(&mut self, sensor_ids: &[String], tid: &TransactionId) -> Result<ReadBatch>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Powercap,
    Nvml,
    Rocm,
    Hwmon,
    Host,
    CpuFreq,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Powercap,
        BackendKind::Nvml,
        BackendKind::Rocm,
        BackendKind::Hwmon,
        BackendKind::Host,
        BackendKind::CpuFreq,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Powercap => powercap::BACKEND_NAME,
            BackendKind::Nvml => nvml::BACKEND_NAME,
            BackendKind::Rocm => rocm::BACKEND_NAME,
            BackendKind::Hwmon => hwmon::BACKEND_NAME,
            BackendKind::Host => host::BACKEND_NAME,
            BackendKind::CpuFreq => cpu_freq::BACKEND_NAME,
        }
    }

    /// Cheap check whether the source can exist here. Never fails.
    pub fn available(&self, paths: &PathConfig) -> bool {
        match self {
            BackendKind::Powercap => powercap::PowercapBackend::available(paths),
            BackendKind::Nvml => nvml::NvmlBackend::available(),
            BackendKind::Rocm => rocm::RocmBackend::available(paths),
            BackendKind::Hwmon => hwmon::HwmonBackend::available(paths),
            BackendKind::Host => host::HostBackend::available(paths),
            BackendKind::CpuFreq => cpu_freq::CpuFreqBackend::available(paths),
        }
    }

    pub fn init(&self, paths: &PathConfig, tid: &TransactionId) -> Result<Box<dyn Backend>> {
        Ok(match self {
            BackendKind::Powercap => Box::new(powercap::PowercapBackend::new(paths, tid)?),
            BackendKind::Nvml => Box::new(nvml::NvmlBackend::new(tid)?),
            BackendKind::Rocm => Box::new(rocm::RocmBackend::new(paths, tid)?),
            BackendKind::Hwmon => Box::new(hwmon::HwmonBackend::new(paths, tid)?),
            BackendKind::Host => Box::new(host::HostBackend::new(paths, tid)?),
            BackendKind::CpuFreq => Box::new(cpu_freq::CpuFreqBackend::new(paths, tid)?),
        })
    }
}

/// Include/exclude rules for backends and sensors.
#[derive(Debug, Clone, Default)]
pub struct SensorFilter {
    include_sensors: Vec<String>,
    exclude_sensors: Vec<String>,
    include_backends: Vec<String>,
    exclude_backends: Vec<String>,
}

impl SensorFilter {
    pub fn new(cfg: &SamplingConfig) -> Self {
        SensorFilter {
            include_sensors: cfg.include_sensors.clone(),
            exclude_sensors: cfg.exclude_sensors.clone(),
            include_backends: cfg.include_backends.clone(),
            exclude_backends: cfg.exclude_backends.clone(),
        }
    }

    fn allowed(include: &[String], exclude: &[String], name: &str) -> bool {
        if !include.is_empty() {
            return include.iter().any(|p| glob_match(p, name));
        }
        !exclude.iter().any(|p| glob_match(p, name))
    }

    pub fn allows_backend(&self, name: &str) -> bool {
        Self::allowed(&self.include_backends, &self.exclude_backends, name)
    }

    pub fn allows_sensor(&self, id: &str) -> bool {
        Self::allowed(&self.include_sensors, &self.exclude_sensors, id)
    }
}

/// Backends that initialized, and why the others were left out.
pub struct BackendSet {
    pub active: Vec<Box<dyn Backend>>,
    /// backend name to reason
    pub excluded: BTreeMap<String, String>,
}

impl BackendSet {
    /// Sensors of all active backends that pass the filter.
    pub fn sensors(&self, filter: &SensorFilter) -> Vec<SensorDescriptor> {
        self.active
            .iter()
            .flat_map(|b| b.sensors())
            .filter(|s| filter.allows_sensor(&s.id))
            .collect()
    }

    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        for b in &self.active {
            for (k, v) in b.metadata() {
                md.insert(format!("{}.{}", b.name(), k), v);
            }
        }
        md
    }
}

/// Check and construct every allowed backend.
/// Failures are logged once and recorded, never retried.
pub fn discover_backends(paths: &PathConfig, filter: &SensorFilter, tid: &TransactionId) -> BackendSet {
    let mut active = vec![];
    let mut excluded = BTreeMap::new();
    for kind in BackendKind::ALL {
        let name = kind.name();
        if !filter.allows_backend(name) {
            debug!(tid=tid, backend=name, "Backend filtered out by configuration");
            excluded.insert(name.to_string(), "filtered".to_string());
            continue;
        }
        if !kind.available(paths) {
            info!(tid=tid, backend=name, "Backend not available on this host");
            excluded.insert(name.to_string(), "unavailable".to_string());
            continue;
        }
        match kind.init(paths, tid) {
            Ok(b) => {
                debug!(tid=tid, backend=name, sensors=b.sensors().len(), "Backend initialized");
                active.push(b)
            },
            Err(e) => {
                warn!(tid=tid, backend=name, error=%e, "Backend failed to initialize, excluding it");
                excluded.insert(name.to_string(), format!("init failed: {}", e));
            },
        }
    }
    BackendSet { active, excluded }
}
