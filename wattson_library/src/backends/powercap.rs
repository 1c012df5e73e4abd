use super::{read_open_u64, Backend, ReadBatch};
use crate::bail_error;
use crate::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use crate::monitor_config::PathConfig;
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use crate::utils::file_utils::read_trimmed;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const BACKEND_NAME: &str = "powercap";
const ZONE_PREFIX: &str = "intel-rapl:";

/// One readable RAPL zone.
struct Zone {
    descriptor: SensorDescriptor,
    energy: File,
}

/// CPU package and DRAM energy counters exposed through the
/// [powercap](https://www.kernel.org/doc/html/latest/power/powercap/powercap.html) sysfs interface.
/// Counter files are kept open for the lifetime of the backend.
pub struct PowercapBackend {
    zones: BTreeMap<String, Zone>,
}

impl PowercapBackend {
    pub fn available(paths: &PathConfig) -> bool {
        !zone_dirs(Path::new(&paths.powercap)).is_empty()
    }

    pub fn new(paths: &PathConfig, tid: &TransactionId) -> Result<Self> {
        let mut zones = BTreeMap::new();
        for (dir, socket) in zone_dirs(Path::new(&paths.powercap)) {
            match open_zone(&dir, socket, tid) {
                Ok(Some(z)) => {
                    zones.insert(z.descriptor.id.clone(), z);
                },
                Ok(None) => (),
                Err(e) => warn!(tid=tid, zone=%dir.display(), error=%e, "Skipping unreadable RAPL zone"),
            }
        }
        if zones.is_empty() {
            bail_error!(tid=tid, root=%paths.powercap, "No readable RAPL zones found");
        }
        Ok(PowercapBackend { zones })
    }
}

/// Zone directories with the socket they belong to, sorted for stable ids.
fn zone_dirs(root: &Path) -> Vec<(PathBuf, u32)> {
    let pattern = format!("{}/{}*", root.display(), ZONE_PREFIX);
    let mut found = vec![];
    let paths = match glob::glob(&pattern) {
        Ok(p) => p,
        Err(_) => return found,
    };
    for pth in paths.flatten() {
        let name = match pth.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let socket = match name
            .trim_start_matches(ZONE_PREFIX)
            .split(':')
            .next()
            .and_then(|s| s.parse::<u32>().ok())
        {
            Some(s) => s,
            None => continue,
        };
        found.push((pth, socket));
    }
    found.sort();
    found
}

/// Package and DRAM zones become sensors. core/uncore/psys overlap the package domain and are skipped.
fn open_zone(dir: &Path, socket: u32, tid: &TransactionId) -> Result<Option<Zone>> {
    let name = read_trimmed(dir.join("name"))?;
    let (device, device_type, measures) = if name.starts_with("package") {
        (format!("cpu_{}", socket), DeviceType::Cpu, MetricType::CpuEnergy)
    } else if name == "dram" {
        (format!("ram_{}", socket), DeviceType::Ram, MetricType::DramEnergy)
    } else {
        debug!(tid=tid, zone=%name, "Ignoring overlapping RAPL zone");
        return Ok(None);
    };
    let wrap = read_trimmed(dir.join("max_energy_range_uj"))?.parse::<u64>()?;
    let mut energy = File::open(dir.join("energy_uj"))?;
    // fail here rather than on the first tick if the counter needs privileges
    read_open_u64(&mut energy)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("zone".to_string(), name.clone());
    metadata.insert("socket".to_string(), socket.to_string());
    metadata.insert("max_energy_range_uj".to_string(), wrap.to_string());
    Ok(Some(Zone {
        descriptor: SensorDescriptor {
            id: format!("{}_{}", device, name),
            device,
            device_type,
            backend: BACKEND_NAME.to_string(),
            unit: Unit::Joule,
            magnitude: Magnitude::Micro,
            kind: SensorKind::Counter { wrap: Some(wrap) },
            measures,
            metadata,
        },
        energy,
    }))
}

impl Backend for PowercapBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        md.insert("zones".to_string(), self.zones.len().to_string());
        md
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.zones.values().map(|z| z.descriptor.clone()).collect()
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        for id in sensor_ids {
            match self.zones.get_mut(id) {
                Some(zone) => match read_open_u64(&mut zone.energy) {
                    Ok(v) => batch.values.push((id.clone(), Number::Int(v))),
                    Err(e) => batch.failed.push((id.clone(), e.to_string())),
                },
                None => batch.failed.push((id.clone(), "unknown sensor".to_string())),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    fn zone(root: &Path, dir: &str, name: &str, uj: u64) {
        let z = root.join(dir);
        std::fs::create_dir_all(&z).unwrap();
        std::fs::write(z.join("name"), format!("{}\n", name)).unwrap();
        std::fs::write(z.join("energy_uj"), format!("{}\n", uj)).unwrap();
        std::fs::write(z.join("max_energy_range_uj"), "262143328850\n").unwrap();
    }

    fn paths(root: &Path) -> PathConfig {
        PathConfig {
            powercap: root.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn discovers_package_and_dram() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "intel-rapl:0", "package-0", 100);
        zone(dir.path(), "intel-rapl:0:0", "core", 50);
        zone(dir.path(), "intel-rapl:0:1", "dram", 20);
        zone(dir.path(), "intel-rapl:1", "package-1", 300);
        let b = PowercapBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let ids = b.sensors().into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["cpu_0_package-0", "cpu_1_package-1", "ram_0_dram"]);
        let ram = b.sensors().into_iter().find(|s| s.device == "ram_0").unwrap();
        assert_eq!(ram.device_type, DeviceType::Ram);
        assert_eq!(ram.kind, SensorKind::Counter { wrap: Some(262143328850) });
    }

    #[test]
    fn reads_fresh_values_through_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        zone(dir.path(), "intel-rapl:0", "package-0", 100);
        let mut b = PowercapBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let ids = vec!["cpu_0_package-0".to_string(), "missing".to_string()];
        let first = b.read(&ids, &TEST_TID).unwrap();
        assert_eq!(first.values, vec![("cpu_0_package-0".to_string(), Number::Int(100))]);
        assert_eq!(first.failed.len(), 1);
        std::fs::write(dir.path().join("intel-rapl:0/energy_uj"), "250\n").unwrap();
        let second = b.read(&ids[..1], &TEST_TID).unwrap();
        assert_eq!(second.values[0].1, Number::Int(250));
    }

    #[test]
    fn empty_root_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!PowercapBackend::available(&paths(dir.path())));
        assert!(PowercapBackend::new(&paths(dir.path()), &TEST_TID).is_err());
    }
}
