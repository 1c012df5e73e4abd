use super::{Backend, ReadBatch};
use crate::bail_error;
use crate::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use crate::monitor_config::PathConfig;
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use anyhow::Result;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const BACKEND_NAME: &str = "cpu_freq";

/// Kernel-reported per-core frequencies, e.g. `/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq`.
pub struct CpuFreqBackend {
    /// sensor id to frequency file
    cores: BTreeMap<String, PathBuf>,
}

impl CpuFreqBackend {
    pub fn available(paths: &PathConfig) -> bool {
        Path::new(&paths.cpu).join("cpu0/cpufreq/scaling_cur_freq").exists()
    }

    pub fn new(paths: &PathConfig, tid: &TransactionId) -> Result<Self> {
        let base = Path::new(&paths.cpu);
        let mut cores = BTreeMap::new();
        for cpu in 0..num_cpus::get() {
            let pth = base.join(format!("cpu{}", cpu)).join("cpufreq/scaling_cur_freq");
            if pth.exists() {
                cores.insert(format!("CPU_FREQ_{}", cpu), pth);
            }
        }
        if cores.is_empty() {
            bail_error!(tid=tid, base=%paths.cpu, "No cpufreq entries found");
        }
        Ok(CpuFreqBackend { cores })
    }

    fn read_freq(pth: &Path) -> Result<u64> {
        let mut opened = std::fs::File::open(pth)?;
        let mut buff = String::new();
        opened.read_to_string(&mut buff)?;
        Ok(buff.trim_end().parse::<u64>()?)
    }
}

impl Backend for CpuFreqBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.cores
            .keys()
            .map(|id| SensorDescriptor {
                id: id.clone(),
                device: "host_cpu".to_string(),
                device_type: DeviceType::Cpu,
                backend: BACKEND_NAME.to_string(),
                unit: Unit::Hertz,
                magnitude: Magnitude::Kilo,
                kind: SensorKind::Gauge,
                measures: MetricType::CpuClock,
                metadata: BTreeMap::new(),
            })
            .collect()
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        for id in sensor_ids {
            match self.cores.get(id) {
                Some(pth) => match Self::read_freq(pth) {
                    Ok(khz) => batch.values.push((id.clone(), Number::Int(khz))),
                    Err(e) => batch.failed.push((id.clone(), e.to_string())),
                },
                None => batch.failed.push((id.clone(), "unknown sensor".to_string())),
            }
        }
        Ok(batch)
    }
}
