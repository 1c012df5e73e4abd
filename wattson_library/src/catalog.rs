//! What can be measured on this host, independent of any measurement.

use crate::backends::{discover_backends, BackendSet, SensorFilter};
use crate::data::{DeviceType, SensorKind};
use crate::monitor_config::MonitorConfig;
use crate::transaction::{TransactionId, CATALOG_TID};
use crate::units::{Magnitude, Unit};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub sensor: String,
    pub unit: Unit,
    pub magnitude: Magnitude,
    pub device_type: DeviceType,
    pub backend: String,
    pub kind: SensorKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorCatalog {
    /// device key to its sensors, ordered by sensor id
    pub devices: BTreeMap<String, Vec<CatalogEntry>>,
    /// backend name to why it is unusable here
    pub excluded: BTreeMap<String, String>,
}

/// Inspect the host with the same discovery and filters a measurement would use.
/// Backends are released before returning.
pub fn sensor_catalog(config: &MonitorConfig) -> SensorCatalog {
    let tid: &TransactionId = &CATALOG_TID;
    let filter = SensorFilter::new(&config.monitor);
    catalog_of(&discover_backends(&config.paths, &filter, tid), &filter, tid)
}

pub fn catalog_of(set: &BackendSet, filter: &SensorFilter, tid: &TransactionId) -> SensorCatalog {
    let mut devices: BTreeMap<String, Vec<CatalogEntry>> = BTreeMap::new();
    for s in set.sensors(filter) {
        devices.entry(s.device.clone()).or_default().push(CatalogEntry {
            sensor: s.id,
            unit: s.unit,
            magnitude: s.magnitude,
            device_type: s.device_type,
            backend: s.backend,
            kind: s.kind,
        });
    }
    for entries in devices.values_mut() {
        entries.sort_by(|a, b| a.sensor.cmp(&b.sensor));
    }
    debug!(tid=tid, devices=devices.len(), "Sensor catalog built");
    SensorCatalog {
        devices,
        excluded: set.excluded.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor_config::PathConfig;
    use crate::transaction::TEST_TID;

    fn fake_sysfs() -> (tempfile::TempDir, PathConfig) {
        let dir = tempfile::tempdir().unwrap();
        let zone = dir.path().join("powercap/intel-rapl:0");
        std::fs::create_dir_all(&zone).unwrap();
        std::fs::write(zone.join("name"), "package-0\n").unwrap();
        std::fs::write(zone.join("energy_uj"), "1000\n").unwrap();
        std::fs::write(zone.join("max_energy_range_uj"), "262143328850\n").unwrap();
        let paths = PathConfig {
            powercap: dir.path().join("powercap").to_string_lossy().to_string(),
            procfs: dir.path().join("no_proc").to_string_lossy().to_string(),
            cpu: dir.path().join("no_cpu").to_string_lossy().to_string(),
            drm: dir.path().join("no_drm").to_string_lossy().to_string(),
            hwmon: dir.path().join("no_hwmon").to_string_lossy().to_string(),
        };
        (dir, paths)
    }

    #[test]
    fn catalog_lists_sensors_by_device() {
        let (_dir, paths) = fake_sysfs();
        let mut cfg = MonitorConfig::new(None, None).unwrap();
        cfg.paths = paths;
        cfg.monitor.exclude_backends = vec!["nvml".to_string()];
        let cat = sensor_catalog(&cfg);
        let cpu = &cat.devices["cpu_0"];
        assert_eq!(cpu.len(), 1);
        assert_eq!(cpu[0].sensor, "cpu_0_package-0");
        assert_eq!(cpu[0].unit, Unit::Joule);
        assert_eq!(cpu[0].magnitude, Magnitude::Micro);
        assert_eq!(cpu[0].backend, "powercap");
        assert_eq!(cat.excluded["nvml"], "filtered");
        assert_eq!(cat.excluded["host"], "unavailable");
        assert_eq!(cat.excluded["rocm"], "unavailable");
        // same answer every time, no session involved
        assert_eq!(sensor_catalog(&cfg), cat);
    }

    #[test]
    fn sensor_filter_applies() {
        let (_dir, paths) = fake_sysfs();
        let mut cfg = MonitorConfig::new(None, None).unwrap();
        cfg.paths = paths;
        cfg.monitor.exclude_backends = vec!["nvml".to_string()];
        cfg.monitor.exclude_sensors = vec!["cpu_*".to_string()];
        let set = discover_backends(&cfg.paths, &SensorFilter::new(&cfg.monitor), &TEST_TID);
        let cat = catalog_of(&set, &SensorFilter::new(&cfg.monitor), &TEST_TID);
        assert!(cat.devices.is_empty());
    }
}
