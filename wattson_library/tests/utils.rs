use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wattson_library::backends::{Backend, BackendSet, ReadBatch};
use wattson_library::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use wattson_library::monitor_config::{MonitorConfig, WattsonConfig};
use wattson_library::session::HostContext;
use wattson_library::transaction::TransactionId;
use wattson_library::units::{Magnitude, Number, Unit};

#[macro_export]
macro_rules! assert_error {
    ($err:expr, $exp:expr, $noerr:expr) => {
        match $err {
            Ok(_) => panic!("{}", $noerr),
            Err(e) => {
                assert!(e.to_string().contains($exp), "'{}' does not mention '{}'", e, $exp);
            },
        };
    };
}

/// Fast sampling, results under `dir`, no launcher environment consulted.
pub fn test_config(dir: &std::path::Path, overrides: Vec<(&str, &str)>) -> WattsonConfig {
    let mut ovr = vec![
        ("monitor.sampling_period".to_string(), "0.01".to_string()),
        ("coordination.barrier_timeout_ms".to_string(), "5000".to_string()),
        ("coordination.gather_timeout_ms".to_string(), "5000".to_string()),
        ("output.data_out".to_string(), dir.to_string_lossy().to_string()),
    ];
    ovr.extend(overrides.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
    let mut cfg = MonitorConfig::new(None, Some(ovr)).unwrap_or_else(|e| panic!("Failed to load config for test: {}", e));
    cfg.coordination.visibility_env = vec![];
    cfg.coordination.device_visibility = None;
    Arc::new(cfg)
}

/// A constant power gauge.
pub fn watt_gauge(id: &str, device: &str, device_type: DeviceType, backend: &str) -> SensorDescriptor {
    let measures = MetricType::power_for(device_type).unwrap_or(MetricType::OtherPower);
    SensorDescriptor {
        id: id.to_string(),
        device: device.to_string(),
        device_type,
        backend: backend.to_string(),
        unit: Unit::Watt,
        magnitude: Magnitude::One,
        kind: SensorKind::Gauge,
        measures,
        metadata: BTreeMap::new(),
    }
}

pub fn gpu_gauge(index: u32, backend: &str) -> SensorDescriptor {
    let mut d = watt_gauge(&format!("gpu_{}_power", index), &format!("CUDA:{}", index), DeviceType::Gpu, backend);
    d.metadata.insert("index".to_string(), index.to_string());
    d
}

/// Reports fixed values for its sensors, and breaks for good after `fail_after` reads.
pub struct ScriptedBackend {
    pub name: String,
    pub sensors: Vec<(SensorDescriptor, f64)>,
    pub fail_after: Option<u64>,
    pub reads: Arc<AtomicU64>,
}

impl ScriptedBackend {
    pub fn new(name: &str, sensors: Vec<(SensorDescriptor, f64)>) -> Self {
        ScriptedBackend {
            name: name.to_string(),
            sensors,
            fail_after: None,
            reads: Arc::new(AtomicU64::new(0)),
        }
    }
    pub fn failing_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }
    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.sensors.iter().map(|(d, _)| d.clone()).collect()
    }
    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.map(|f| n >= f).unwrap_or(false) {
            anyhow::bail!("device went away");
        }
        let values = self
            .sensors
            .iter()
            .filter(|(d, _)| sensor_ids.contains(&d.id))
            .map(|(d, v)| (d.id.clone(), Number::Float(*v)))
            .collect();
        Ok(ReadBatch { values, failed: vec![] })
    }
}

pub fn host(hostname: &str, backends: Vec<ScriptedBackend>) -> HostContext {
    HostContext {
        hostname: hostname.to_string(),
        backends: BackendSet {
            active: backends.into_iter().map(|b| Box::new(b) as Box<dyn Backend>).collect(),
            excluded: BTreeMap::new(),
        },
    }
}

/// Seconds between the first and last sample of a stream.
pub fn span_secs(ts: &[u64]) -> f64 {
    match (ts.first(), ts.last()) {
        (Some(a), Some(b)) => (b - a) as f64 / 1e9,
        _ => 0.0,
    }
}
