use super::{read_open_u64, Backend, ReadBatch};
use crate::bail_error;
use crate::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use crate::monitor_config::PathConfig;
use crate::transaction::{TransactionId, STARTUP_TID};
use crate::units::{Magnitude, Number, Unit};
use crate::utils::file_utils::read_trimmed;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const BACKEND_NAME: &str = "hwmon";
/// Chips another backend already reads.
const COVERED_CHIPS: [&str; 1] = ["amdgpu"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Quantity {
    /// microwatts, `power<N>_average` or `power<N>_input`
    Power,
    /// microjoules, `energy<N>_input`
    Energy,
}

impl Quantity {
    fn prefix(&self) -> &'static str {
        match self {
            Quantity::Power => "power",
            Quantity::Energy => "energy",
        }
    }

    /// `power3_average` -> (Power, 3)
    fn of_file(name: &str) -> Option<(Quantity, u32)> {
        let (q, rest) = if let Some(r) = name.strip_prefix("power") {
            (Quantity::Power, r)
        } else if let Some(r) = name.strip_prefix("energy") {
            (Quantity::Energy, r)
        } else {
            return None;
        };
        let (index, kind) = rest.split_once('_')?;
        let ok = match q {
            Quantity::Power => kind == "average" || kind == "input",
            Quantity::Energy => kind == "input",
        };
        match ok {
            true => index.parse().ok().map(|i| (q, i)),
            false => None,
        }
    }
}

/// Device type a channel label points at. Unlabelled channels are `Other`.
fn labelled_type(label: &str) -> DeviceType {
    let l = label.to_lowercase();
    if ["cpu", "core", "processor"].iter().any(|k| l.contains(k)) {
        DeviceType::Cpu
    } else if ["gpu", "graphics"].iter().any(|k| l.contains(k)) {
        DeviceType::Gpu
    } else if ["memory", "dram"].iter().any(|k| l.contains(k)) {
        DeviceType::Ram
    } else {
        DeviceType::Other
    }
}

fn clean(s: &str) -> String {
    s.chars()
        .map(|c| match c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            true => c,
            false => '_',
        })
        .collect()
}

struct Channel {
    descriptor: SensorDescriptor,
    file: File,
}

/// Power and energy channels of the kernel's
/// [hwmon](https://www.kernel.org/doc/html/latest/hwmon/sysfs-interface.html) chips, including attributes
/// a chip keeps on its parent `device` directory. Channel files are kept open for the lifetime of the backend.
pub struct HwmonBackend {
    channels: BTreeMap<String, Channel>,
    chips: BTreeSet<String>,
}

/// One channel file found on disk, before it is opened.
struct Found {
    chip: String,
    hwmon: String,
    quantity: Quantity,
    index: u32,
    file: PathBuf,
    /// `chip` or `device`
    location: &'static str,
    label: Option<String>,
}

impl HwmonBackend {
    pub fn available(paths: &PathConfig) -> bool {
        !find_channels(Path::new(&paths.hwmon), &STARTUP_TID).is_empty()
    }

    pub fn new(paths: &PathConfig, tid: &TransactionId) -> Result<Self> {
        let mut channels = BTreeMap::new();
        let mut chips = BTreeSet::new();
        for f in find_channels(Path::new(&paths.hwmon), tid) {
            let mut file = match File::open(&f.file) {
                Ok(file) => file,
                Err(e) => {
                    warn!(tid=tid, path=%f.file.display(), error=%e, "Skipping unreadable hwmon channel");
                    continue;
                },
            };
            if let Err(e) = read_open_u64(&mut file) {
                warn!(tid=tid, path=%f.file.display(), error=%e, "Skipping unreadable hwmon channel");
                continue;
            }
            chips.insert(format!("{}:{}", f.hwmon, f.chip));
            let descriptor = describe(&f);
            channels.insert(descriptor.id.clone(), Channel { descriptor, file });
        }
        if channels.is_empty() {
            bail_error!(tid=tid, root=%paths.hwmon, "No readable hwmon power or energy channels found");
        }
        Ok(HwmonBackend { channels, chips })
    }
}

fn describe(f: &Found) -> SensorDescriptor {
    let device_type = f.label.as_deref().map(labelled_type).unwrap_or(DeviceType::Other);
    let device = match (&f.label, device_type) {
        (Some(l), t) if t != DeviceType::Other => clean(&format!("{}_{}", f.hwmon, l)),
        _ => clean(&format!("{}_{}", f.hwmon, f.chip)),
    };
    let (unit, kind, measures) = match f.quantity {
        Quantity::Power => (
            Unit::Watt,
            SensorKind::Gauge,
            MetricType::power_for(device_type).unwrap_or(MetricType::OtherPower),
        ),
        Quantity::Energy => (
            Unit::Joule,
            SensorKind::Counter { wrap: None },
            MetricType::energy_for(device_type).unwrap_or(MetricType::OtherEnergy),
        ),
    };
    let mut metadata = BTreeMap::new();
    metadata.insert("chip".to_string(), f.chip.clone());
    metadata.insert("hwmon".to_string(), f.hwmon.clone());
    metadata.insert("channel".to_string(), f.index.to_string());
    metadata.insert("location".to_string(), f.location.to_string());
    if let Some(l) = &f.label {
        metadata.insert("label".to_string(), l.clone());
    }
    SensorDescriptor {
        id: clean(&format!("{}_{}_{}{}", f.chip, f.hwmon, f.quantity.prefix(), f.index)),
        device,
        device_type,
        backend: BACKEND_NAME.to_string(),
        unit,
        magnitude: Magnitude::Micro,
        kind,
        measures,
        metadata,
    }
}

fn label_of(dir: &Path, q: Quantity, index: u32) -> Option<String> {
    let oem = dir.join(format!("{}{}_oem_info", q.prefix(), index));
    let label = dir.join(format!("{}{}_label", q.prefix(), index));
    [oem, label]
        .iter()
        .filter_map(|p| read_trimmed(p).ok())
        .find(|l| !l.is_empty())
}

/// Every power and energy channel under `root`, in stable order. A channel on the chip itself wins over
/// the same channel on its parent device, and an average wins over an instantaneous reading.
fn find_channels(root: &Path, tid: &TransactionId) -> Vec<Found> {
    let pattern = format!("{}/hwmon*", glob::Pattern::escape(&root.to_string_lossy()));
    let mut dirs = match glob::glob(&pattern) {
        Ok(p) => p.flatten().collect::<Vec<_>>(),
        Err(_) => return vec![],
    };
    dirs.sort();
    let mut found = vec![];
    for dir in dirs {
        let hwmon = match dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let chip = read_trimmed(dir.join("name")).unwrap_or_else(|_| hwmon.clone());
        if COVERED_CHIPS.contains(&chip.as_str()) {
            debug!(tid=tid, hwmon=%hwmon, chip=%chip, "Chip read by another backend");
            continue;
        }
        let mut seen = BTreeSet::new();
        for (location, sub) in [("chip", dir.clone()), ("device", dir.join("device"))] {
            let mut names = match std::fs::read_dir(&sub) {
                Ok(rd) => rd
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect::<Vec<_>>(),
                Err(_) => continue,
            };
            names.sort();
            for name in names {
                let (quantity, index) = match Quantity::of_file(&name) {
                    Some(c) => c,
                    None => continue,
                };
                if !seen.insert((quantity, index)) {
                    continue;
                }
                found.push(Found {
                    chip: chip.clone(),
                    hwmon: hwmon.clone(),
                    quantity,
                    index,
                    file: sub.join(&name),
                    location,
                    label: label_of(&sub, quantity, index),
                });
            }
        }
    }
    found
}

impl Backend for HwmonBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        md.insert("chips".to_string(), self.chips.iter().cloned().collect::<Vec<_>>().join(","));
        md
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        self.channels.values().map(|c| c.descriptor.clone()).collect()
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        for id in sensor_ids {
            match self.channels.get_mut(id) {
                Some(c) => match read_open_u64(&mut c.file) {
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
    use rstest::rstest;

    fn chip(root: &Path, hwmon: &str, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(hwmon);
        std::fs::create_dir_all(dir.join("device")).unwrap();
        std::fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        for (f, v) in files {
            std::fs::write(dir.join(f), format!("{}\n", v)).unwrap();
        }
        dir
    }

    fn paths(root: &Path) -> PathConfig {
        PathConfig {
            hwmon: root.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    fn fixture(root: &Path) {
        chip(root, "hwmon0", "k10temp", &[("temp1_input", "41000")]);
        chip(
            root,
            "hwmon1",
            "power_meter",
            &[("power1_average", "150000000"), ("power1_input", "149000000")],
        );
        chip(root, "hwmon2", "amdgpu", &[("power1_average", "45000000")]);
        chip(
            root,
            "hwmon3",
            "grace",
            &[
                ("device/power1_average", "50000000"),
                ("device/power1_oem_info", "Module Power Socket 0"),
                ("device/power2_average", "20000000"),
                ("device/power2_oem_info", "CPU Power Socket 0"),
                ("device/power3_average", "7000000"),
                ("device/power3_label", "Grace DRAM"),
            ],
        );
        chip(root, "hwmon4", "amd_energy", &[("energy1_input", "5000000"), ("energy1_label", "Esocket0")]);
    }

    #[rstest]
    #[case("power1_average", Some((Quantity::Power, 1)))]
    #[case("power12_input", Some((Quantity::Power, 12)))]
    #[case("energy2_input", Some((Quantity::Energy, 2)))]
    #[case("power1_cap", None)]
    #[case("energy1_average", None)]
    #[case("temp1_input", None)]
    fn channel_files(#[case] name: &str, #[case] expected: Option<(Quantity, u32)>) {
        assert_eq!(Quantity::of_file(name), expected);
    }

    #[test]
    fn discovers_power_and_energy_channels() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let b = HwmonBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let by_id = b
            .sensors()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(
            by_id.keys().cloned().collect::<Vec<_>>(),
            vec![
                "amd_energy_hwmon4_energy1",
                "grace_hwmon3_power1",
                "grace_hwmon3_power2",
                "grace_hwmon3_power3",
                "power_meter_hwmon1_power1",
            ]
        );
        let meter = &by_id["power_meter_hwmon1_power1"];
        assert_eq!(meter.device, "hwmon1_power_meter");
        assert_eq!(meter.device_type, DeviceType::Other);
        assert!(meter.metadata.get("label").is_none());
        let cpu = &by_id["grace_hwmon3_power2"];
        assert_eq!(cpu.device, "hwmon3_CPU_Power_Socket_0");
        assert_eq!(cpu.device_type, DeviceType::Cpu);
        assert_eq!(cpu.measures, MetricType::CpuPower);
        assert_eq!(cpu.metadata["location"], "device");
        assert_eq!(by_id["grace_hwmon3_power3"].device_type, DeviceType::Ram);
        assert_eq!(by_id["grace_hwmon3_power1"].device_type, DeviceType::Other);
        let energy = &by_id["amd_energy_hwmon4_energy1"];
        assert_eq!(energy.kind, SensorKind::Counter { wrap: None });
        assert_eq!(energy.unit, Unit::Joule);
        assert_eq!(energy.magnitude, Magnitude::Micro);
        assert_eq!(b.metadata()["chips"], "hwmon1:power_meter,hwmon3:grace,hwmon4:amd_energy");
    }

    #[test]
    fn reads_average_through_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let mut b = HwmonBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        let ids = vec!["power_meter_hwmon1_power1".to_string()];
        assert_eq!(b.read(&ids, &TEST_TID).unwrap().values[0].1, Number::Int(150_000_000));
        std::fs::write(dir.path().join("hwmon1/power1_average"), "151000000\n").unwrap();
        assert_eq!(b.read(&ids, &TEST_TID).unwrap().values[0].1, Number::Int(151_000_000));
    }

    #[test]
    fn temperature_only_chips_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        chip(dir.path(), "hwmon0", "k10temp", &[("temp1_input", "41000")]);
        chip(dir.path(), "hwmon1", "amdgpu", &[("power1_average", "45000000")]);
        assert!(!HwmonBackend::available(&paths(dir.path())));
        assert!(HwmonBackend::new(&paths(dir.path()), &TEST_TID).is_err());
    }
}
