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
use tracing::debug;

pub const BACKEND_NAME: &str = "rocm";
const AMD_VENDOR: &str = "0x1002";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuAttribute {
    Power,
    Memory,
    Utilization,
    SmClock,
}

impl GpuAttribute {
    const ALL: [GpuAttribute; 4] = [
        GpuAttribute::Power,
        GpuAttribute::Memory,
        GpuAttribute::Utilization,
        GpuAttribute::SmClock,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            GpuAttribute::Power => "POWER",
            GpuAttribute::Memory => "MEM",
            GpuAttribute::Utilization => "UTIL",
            GpuAttribute::SmClock => "CLOCK_SM",
        }
    }

    /// The attribute file under a card's `device` directory, if the driver exposes it.
    fn path(&self, dev: &Path) -> Option<PathBuf> {
        let file = match self {
            GpuAttribute::Power => hwmon_file(dev, &["power1_average", "power1_input"])?,
            GpuAttribute::SmClock => hwmon_file(dev, &["freq1_input"])?,
            GpuAttribute::Memory => dev.join("mem_info_vram_used"),
            GpuAttribute::Utilization => dev.join("gpu_busy_percent"),
        };
        Some(file)
    }

    fn describe(&self, index: u32, metadata: &BTreeMap<String, String>) -> SensorDescriptor {
        let (unit, magnitude, measures) = match self {
            GpuAttribute::Power => (Unit::Watt, Magnitude::Micro, MetricType::GpuPower),
            GpuAttribute::Memory => (Unit::Byte, Magnitude::One, MetricType::GpuMem),
            GpuAttribute::Utilization => (Unit::Percent, Magnitude::One, MetricType::GpuUtil),
            GpuAttribute::SmClock => (Unit::Hertz, Magnitude::One, MetricType::GpuClock),
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
    format!("ROCM:{}", index)
}

struct Attribute {
    descriptor: SensorDescriptor,
    file: File,
}

/// AMD GPUs through the attributes the amdgpu driver exposes under `/sys/class/drm/card*/device`.
/// GPUs are indexed in card order, which is how the ROCm runtime numbers them.
pub struct RocmBackend {
    attributes: BTreeMap<String, Attribute>,
    gpus: usize,
}

impl RocmBackend {
    pub fn available(paths: &PathConfig) -> bool {
        !amd_cards(Path::new(&paths.drm)).is_empty()
    }

    pub fn new(paths: &PathConfig, tid: &TransactionId) -> Result<Self> {
        let cards = amd_cards(Path::new(&paths.drm));
        let mut attributes = BTreeMap::new();
        for (index, (card, dev)) in cards.iter().enumerate() {
            let index = index as u32;
            let mut metadata = BTreeMap::new();
            metadata.insert("index".to_string(), index.to_string());
            metadata.insert("card".to_string(), card.clone());
            if let Ok(uuid) = read_trimmed(dev.join("unique_id")) {
                metadata.insert("uuid".to_string(), uuid);
            }
            if let Ok(name) = read_trimmed(dev.join("product_name")) {
                metadata.insert("name".to_string(), name);
            }
            for a in GpuAttribute::ALL {
                let path = match a.path(dev) {
                    Some(p) => p,
                    None => {
                        debug!(tid=tid, card=%card, attribute=a.suffix(), "GPU has no hwmon entry for attribute");
                        continue;
                    },
                };
                match open_attribute(&path) {
                    Ok(file) => {
                        let descriptor = a.describe(index, &metadata);
                        attributes.insert(descriptor.id.clone(), Attribute { descriptor, file });
                    },
                    Err(e) => debug!(tid=tid, path=%path.display(), error=%e, "GPU attribute not readable"),
                }
            }
        }
        if attributes.is_empty() {
            bail_error!(tid=tid, root=%paths.drm, "No readable AMD GPU attributes found");
        }
        Ok(RocmBackend {
            attributes,
            gpus: cards.len(),
        })
    }
}

fn open_attribute(path: &Path) -> Result<File> {
    let mut file = File::open(path)?;
    read_open_u64(&mut file)?;
    Ok(file)
}

/// The first of `names` present in any of the card's hwmon directories.
fn hwmon_file(dev: &Path, names: &[&str]) -> Option<PathBuf> {
    let pattern = format!("{}/hwmon/hwmon*", glob::Pattern::escape(&dev.to_string_lossy()));
    let mut dirs = glob::glob(&pattern).ok()?.flatten().collect::<Vec<_>>();
    dirs.sort();
    dirs.iter()
        .flat_map(|d| names.iter().map(move |n| d.join(n)))
        .find(|p| p.exists())
}

/// `cardN` entries whose PCI vendor is AMD, in card number order. Connector entries like `card0-DP-1` are skipped.
fn amd_cards(root: &Path) -> Vec<(String, PathBuf)> {
    let pattern = format!("{}/card*", glob::Pattern::escape(&root.to_string_lossy()));
    let paths = match glob::glob(&pattern) {
        Ok(p) => p,
        Err(_) => return vec![],
    };
    let mut found = vec![];
    for pth in paths.flatten() {
        let name = match pth.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let number = match name.strip_prefix("card").and_then(|n| n.parse::<u32>().ok()) {
            Some(n) => n,
            None => continue,
        };
        let dev = pth.join("device");
        match read_trimmed(dev.join("vendor")) {
            Ok(v) if v == AMD_VENDOR => found.push((number, name, dev)),
            _ => continue,
        }
    }
    found.sort();
    found.into_iter().map(|(_, name, dev)| (name, dev)).collect()
}

impl Backend for RocmBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        md.insert("gpus".to_string(), self.gpus.to_string());
        md
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.attributes.values().map(|a| a.descriptor.clone()).collect()
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        for id in sensor_ids {
            match self.attributes.get_mut(id) {
                Some(a) => match read_open_u64(&mut a.file) {
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

    fn card(root: &Path, name: &str, vendor: &str, files: &[(&str, &str)]) -> PathBuf {
        let dev = root.join(name).join("device");
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("vendor"), format!("{}\n", vendor)).unwrap();
        for (f, v) in files {
            let p = dev.join(f);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(p, format!("{}\n", v)).unwrap();
        }
        dev
    }

    fn paths(root: &Path) -> PathConfig {
        PathConfig {
            drm: root.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn amd_cards_become_indexed_gpus() {
        let dir = tempfile::tempdir().unwrap();
        card(
            dir.path(),
            "card0",
            AMD_VENDOR,
            &[
                ("hwmon/hwmon3/power1_average", "45000000"),
                ("hwmon/hwmon3/freq1_input", "1700000000"),
                ("mem_info_vram_used", "1073741824"),
                ("gpu_busy_percent", "37"),
                ("unique_id", "d2a1b0c3e4f50617"),
            ],
        );
        card(dir.path(), "card1", "0x10de", &[("gpu_busy_percent", "99")]);
        card(dir.path(), "card10", AMD_VENDOR, &[("gpu_busy_percent", "5")]);
        std::fs::create_dir_all(dir.path().join("card0-DP-1")).unwrap();

        let b = RocmBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let ids = b.sensors().into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["ROCM:0_CLOCK_SM", "ROCM:0_MEM", "ROCM:0_POWER", "ROCM:0_UTIL", "ROCM:1_UTIL"]);
        let power = b.sensors().into_iter().find(|s| s.id == "ROCM:0_POWER").unwrap();
        assert_eq!(power.device, "ROCM:0");
        assert_eq!(power.device_type, DeviceType::Gpu);
        assert_eq!(power.magnitude, Magnitude::Micro);
        assert_eq!(power.metadata["uuid"], "d2a1b0c3e4f50617");
        assert_eq!(power.metadata["card"], "card0");
        let second = b.sensors().into_iter().find(|s| s.id == "ROCM:1_UTIL").unwrap();
        assert_eq!(second.metadata["card"], "card10");
        assert_eq!(b.metadata()["gpus"], "2");
    }

    #[test]
    fn reads_fresh_values_through_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        let dev = card(
            dir.path(),
            "card0",
            AMD_VENDOR,
            &[("hwmon/hwmon0/power1_input", "30000000"), ("mem_info_vram_used", "2048")],
        );
        let mut b = RocmBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let ids = vec!["ROCM:0_POWER".to_string(), "ROCM:0_MEM".to_string(), "ROCM:0_UTIL".to_string()];
        let first = b.read(&ids, &TEST_TID).unwrap();
        assert_eq!(
            first.values,
            vec![
                ("ROCM:0_POWER".to_string(), Number::Int(30_000_000)),
                ("ROCM:0_MEM".to_string(), Number::Int(2048))
            ]
        );
        assert_eq!(first.failed, vec![("ROCM:0_UTIL".to_string(), "unknown sensor".to_string())]);
        std::fs::write(dev.join("hwmon/hwmon0/power1_input"), "61000000\n").unwrap();
        let second = b.read(&ids[..1], &TEST_TID).unwrap();
        assert_eq!(second.values[0].1, Number::Int(61_000_000));
    }

    #[test]
    fn other_vendors_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        card(dir.path(), "card0", "0x8086", &[("gpu_busy_percent", "10")]);
        assert!(!RocmBackend::available(&paths(dir.path())));
        assert!(RocmBackend::new(&paths(dir.path()), &TEST_TID).is_err());
    }
}
