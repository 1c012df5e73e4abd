use super::{Backend, ReadBatch};
use crate::bail_error;
use crate::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use anyhow::Result;
use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::Nvml;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const BACKEND_NAME: &str = "nvml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuQuery {
    Power,
    Memory,
    Utilization,
    SmClock,
}

impl GpuQuery {
    const ALL: [GpuQuery; 4] = [GpuQuery::Power, GpuQuery::Memory, GpuQuery::Utilization, GpuQuery::SmClock];

    fn suffix(&self) -> &'static str {
        match self {
            GpuQuery::Power => "POWER",
            GpuQuery::Memory => "MEM",
            GpuQuery::Utilization => "UTIL",
            GpuQuery::SmClock => "CLOCK_SM",
        }
    }

    fn describe(&self, index: u32, metadata: &BTreeMap<String, String>) -> SensorDescriptor {
        let (unit, magnitude, measures) = match self {
            GpuQuery::Power => (Unit::Watt, Magnitude::Milli, MetricType::GpuPower),
            GpuQuery::Memory => (Unit::Byte, Magnitude::One, MetricType::GpuMem),
            GpuQuery::Utilization => (Unit::Percent, Magnitude::One, MetricType::GpuUtil),
            GpuQuery::SmClock => (Unit::Hertz, Magnitude::Mega, MetricType::GpuClock),
        };
        let device = gpu_key(index);
        SensorDescriptor {
            id: format!("{}_{}", device, self.suffix()),
            device,
            device_type: DeviceType::Gpu,
            backend: BACKEND_NAME.to_string(),
            unit,
            magnitude,
            kind: SensorKind::Gauge,
            measures,
            metadata: metadata.clone(),
        }
    }
}

pub fn gpu_key(index: u32) -> String {
    format!("CUDA:{}", index)
}

/// NVIDIA GPUs through the management library.
/// The library handle is shut down when the backend is dropped.
pub struct NvmlBackend {
    nvml: Nvml,
    driver_version: String,
    /// sensor id to (device index, query)
    sensors: BTreeMap<String, (u32, GpuQuery)>,
    descriptors: Vec<SensorDescriptor>,
}

impl NvmlBackend {
    /// Loading the library is the only reliable check; a missing driver is not an error.
    pub fn available() -> bool {
        Nvml::init().is_ok()
    }

    pub fn new(tid: &TransactionId) -> Result<Self> {
        let nvml = match Nvml::init() {
            Ok(n) => n,
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to load NVML"),
        };
        let driver_version = nvml.sys_driver_version().unwrap_or_else(|_| "unknown".to_string());
        let count = nvml.device_count()?;
        let mut sensors = BTreeMap::new();
        let mut descriptors = vec![];
        for index in 0..count {
            let device = match nvml.device_by_index(index) {
                Ok(d) => d,
                Err(e) => {
                    warn!(tid=tid, index=index, error=%e, "Skipping inaccessible GPU");
                    continue;
                },
            };
            let mut metadata = BTreeMap::new();
            metadata.insert("index".to_string(), index.to_string());
            if let Ok(uuid) = device.uuid() {
                metadata.insert("uuid".to_string(), uuid);
            }
            if let Ok(name) = device.name() {
                metadata.insert("name".to_string(), name);
            }
            metadata.insert("driver_version".to_string(), driver_version.clone());
            for q in GpuQuery::ALL {
                let desc = q.describe(index, &metadata);
                sensors.insert(desc.id.clone(), (index, q));
                descriptors.push(desc);
            }
        }
        if descriptors.is_empty() {
            bail_error!(tid=tid, "NVML loaded but no GPU is accessible");
        }
        debug!(tid=tid, gpus=count, driver=%driver_version, "NVML initialized");
        Ok(NvmlBackend {
            nvml,
            driver_version,
            sensors,
            descriptors,
        })
    }

    fn query(&self, index: u32, q: GpuQuery) -> Result<Number> {
        let device = self.nvml.device_by_index(index)?;
        Ok(match q {
            GpuQuery::Power => Number::Int(device.power_usage()? as u64),
            GpuQuery::Memory => Number::Int(device.memory_info()?.used),
            GpuQuery::Utilization => Number::Int(device.utilization_rates()?.gpu as u64),
            GpuQuery::SmClock => Number::Int(device.clock_info(Clock::SM)? as u64),
        })
    }
}

impl Backend for NvmlBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        md.insert("driver_version".to_string(), self.driver_version.clone());
        if let Ok(v) = self.nvml.sys_nvml_version() {
            md.insert("nvml_version".to_string(), v);
        }
        md
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.descriptors.clone()
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        for id in sensor_ids {
            match self.sensors.get(id) {
                Some((index, q)) => match self.query(*index, *q) {
                    Ok(v) => batch.values.push((id.clone(), v)),
                    Err(e) => batch.failed.push((id.clone(), e.to_string())),
                },
                None => batch.failed.push((id.clone(), "unknown sensor".to_string())),
            }
        }
        Ok(batch)
    }
}
