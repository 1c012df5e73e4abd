use super::{Backend, ReadBatch};
use crate::data::{DeviceType, MetricType, SensorDescriptor, SensorKind};
use crate::monitor_config::PathConfig;
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const BACKEND_NAME: &str = "host";

pub const CPU_USAGE: &str = "CPU_USAGE";
pub const RAM_USAGE: &str = "RAM_USAGE";
pub const NET_READ: &str = "NET_READ_BYTES";
pub const NET_WRITE: &str = "NET_WRITE_BYTES";
pub const DISK_READ: &str = "DISK_READ_BYTES";
pub const DISK_WRITE: &str = "DISK_WRITE_BYTES";

const SECTOR_BYTES: u64 = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Host-wide utilization and I/O counters from procfs.
pub struct HostBackend {
    proc_root: PathBuf,
    last_cpu: CpuTimes,
}

impl HostBackend {
    pub fn available(paths: &PathConfig) -> bool {
        Path::new(&paths.procfs).join("stat").exists()
    }

    pub fn new(paths: &PathConfig, _tid: &TransactionId) -> Result<Self> {
        let proc_root = PathBuf::from(&paths.procfs);
        let last_cpu = cpu_times(&proc_root)?;
        Ok(HostBackend { proc_root, last_cpu })
    }

    fn cpu_usage(&mut self) -> Result<Number> {
        let now = cpu_times(&self.proc_root)?;
        let d_total = now.total.saturating_sub(self.last_cpu.total);
        let d_busy = now.busy.saturating_sub(self.last_cpu.busy);
        self.last_cpu = now;
        if d_total == 0 {
            return Ok(Number::Float(0.0));
        }
        Ok(Number::Float(100.0 * d_busy as f64 / d_total as f64))
    }
}

fn descriptor(id: &str, device: &str, device_type: DeviceType, unit: Unit, kind: SensorKind, measures: MetricType) -> SensorDescriptor {
    SensorDescriptor {
        id: id.to_string(),
        device: device.to_string(),
        device_type,
        backend: BACKEND_NAME.to_string(),
        unit,
        magnitude: Magnitude::One,
        kind,
        measures,
        metadata: BTreeMap::new(),
    }
}

/// Aggregate jiffies from the first line of `/proc/stat`.
fn cpu_times(proc_root: &Path) -> Result<CpuTimes> {
    let stat = std::fs::read_to_string(proc_root.join("stat"))?;
    let line = match stat.lines().find(|l| l.starts_with("cpu ")) {
        Some(l) => l,
        None => anyhow::bail!("No aggregate cpu line in stat file"),
    };
    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<std::result::Result<Vec<u64>, _>>()?;
    if fields.len() < 4 {
        anyhow::bail!("Truncated cpu line in stat file: '{}'", line);
    }
    // guest time is already included in user/nice
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn mem_used(proc_root: &Path) -> Result<u64> {
    let info = std::fs::read_to_string(proc_root.join("meminfo"))?;
    let field = |name: &str| -> Option<u64> {
        info.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
    };
    match (field("MemTotal:"), field("MemAvailable:")) {
        (Some(total), Some(avail)) => Ok(total.saturating_sub(avail) * 1024),
        _ => anyhow::bail!("meminfo is missing MemTotal or MemAvailable"),
    }
}

/// Bytes received and sent over all non-loopback interfaces.
fn net_bytes(proc_root: &Path) -> Result<(u64, u64)> {
    let dev = std::fs::read_to_string(proc_root.join("net/dev"))?;
    let mut rx = 0;
    let mut tx = 0;
    for line in dev.lines().skip(2) {
        let (iface, rest) = match line.split_once(':') {
            Some(p) => p,
            None => continue,
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields = rest.split_whitespace().collect::<Vec<&str>>();
        if fields.len() < 9 {
            continue;
        }
        rx += fields[0].parse::<u64>()?;
        tx += fields[8].parse::<u64>()?;
    }
    Ok((rx, tx))
}

fn is_virtual_disk(name: &str) -> bool {
    ["loop", "ram", "zram", "dm-", "md"].iter().any(|p| name.starts_with(p))
}

/// Bytes read and written by whole disks; partitions are folded into their parent.
fn disk_bytes(proc_root: &Path) -> Result<(u64, u64)> {
    let stats = std::fs::read_to_string(proc_root.join("diskstats"))?;
    let rows = stats
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<&str>>())
        .filter(|f| f.len() >= 10)
        .collect::<Vec<_>>();
    let names = rows.iter().map(|f| f[2]).collect::<Vec<&str>>();
    let mut read = 0;
    let mut written = 0;
    for f in &rows {
        let name = f[2];
        if is_virtual_disk(name) {
            continue;
        }
        let is_partition = name.ends_with(|c: char| c.is_ascii_digit())
            && names.iter().any(|other| *other != name && name.starts_with(other));
        if is_partition {
            continue;
        }
        read += f[5].parse::<u64>()? * SECTOR_BYTES;
        written += f[9].parse::<u64>()? * SECTOR_BYTES;
    }
    Ok((read, written))
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        let mut md = BTreeMap::new();
        md.insert("logical_cpus".to_string(), num_cpus::get().to_string());
        md.insert("physical_cpus".to_string(), num_cpus::get_physical().to_string());
        md
    }

    fn sensors(&self) -> Vec<SensorDescriptor> {
        let counter = SensorKind::Counter { wrap: None };
        let mut out = vec![
            descriptor(CPU_USAGE, "host_cpu", DeviceType::Cpu, Unit::Percent, SensorKind::Gauge, MetricType::CpuUtil),
            descriptor(RAM_USAGE, "host_ram", DeviceType::Ram, Unit::Byte, SensorKind::Gauge, MetricType::DramMem),
        ];
        if net_bytes(&self.proc_root).is_ok() {
            out.push(descriptor(NET_READ, "host_net", DeviceType::Net, Unit::Byte, counter, MetricType::NetRead));
            out.push(descriptor(NET_WRITE, "host_net", DeviceType::Net, Unit::Byte, counter, MetricType::NetWrite));
        }
        if disk_bytes(&self.proc_root).is_ok() {
            out.push(descriptor(DISK_READ, "host_disk", DeviceType::Disk, Unit::Byte, counter, MetricType::DiskRead));
            out.push(descriptor(DISK_WRITE, "host_disk", DeviceType::Disk, Unit::Byte, counter, MetricType::DiskWrite));
        }
        out
    }

    fn read(&mut self, sensor_ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        let wants = |id: &str| sensor_ids.iter().any(|s| s == id);
        let mut record = |id: &str, r: Result<Number>| match r {
            Ok(v) => batch.values.push((id.to_string(), v)),
            Err(e) => batch.failed.push((id.to_string(), e.to_string())),
        };
        if wants(CPU_USAGE) {
            let v = self.cpu_usage();
            record(CPU_USAGE, v);
        }
        if wants(RAM_USAGE) {
            record(RAM_USAGE, mem_used(&self.proc_root).map(Number::Int));
        }
        if wants(NET_READ) || wants(NET_WRITE) {
            let net = net_bytes(&self.proc_root);
            if wants(NET_READ) {
                record(NET_READ, net.as_ref().map(|n| Number::Int(n.0)).map_err(|e| anyhow::anyhow!("{}", e)));
            }
            if wants(NET_WRITE) {
                record(NET_WRITE, net.as_ref().map(|n| Number::Int(n.1)).map_err(|e| anyhow::anyhow!("{}", e)));
            }
        }
        if wants(DISK_READ) || wants(DISK_WRITE) {
            let disk = disk_bytes(&self.proc_root);
            if wants(DISK_READ) {
                record(DISK_READ, disk.as_ref().map(|n| Number::Int(n.0)).map_err(|e| anyhow::anyhow!("{}", e)));
            }
            if wants(DISK_WRITE) {
                record(DISK_WRITE, disk.as_ref().map(|n| Number::Int(n.1)).map_err(|e| anyhow::anyhow!("{}", e)));
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    fn fake_proc(root: &Path, user: u64, idle: u64) {
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::write(
            root.join("stat"),
            format!("cpu  {} 0 0 {} 0 0 0 0 0 0\ncpu0 1 0 0 1 0 0 0 0 0 0\n", user, idle),
        )
        .unwrap();
        std::fs::write(
            root.join("meminfo"),
            "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    6000000 kB\n",
        )
        .unwrap();
        std::fs::write(
            root.join("net/dev"),
            "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    lo: 999 1 0 0 0 0 0 0 999 1 0 0 0 0 0 0\n  eth0: 1000 10 0 0 0 0 0 0 2000 20 0 0 0 0 0 0\n",
        )
        .unwrap();
        std::fs::write(
            root.join("diskstats"),
            "   8       0 sda 10 0 100 5 20 0 200 7 0 12 12\n   8       1 sda1 5 0 50 2 10 0 100 3 0 5 5\n   7       0 loop0 1 0 8 0 0 0 0 0 0 0 0\n",
        )
        .unwrap();
    }

    fn paths(root: &Path) -> PathConfig {
        PathConfig {
            procfs: root.to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_counters() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 100, 100);
        assert_eq!(mem_used(dir.path()).unwrap(), 10_000_000 * 1024);
        assert_eq!(net_bytes(dir.path()).unwrap(), (1000, 2000));
        assert_eq!(disk_bytes(dir.path()).unwrap(), (100 * 512, 200 * 512));
    }

    #[test]
    fn cpu_usage_from_deltas() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 100, 100);
        let mut b = HostBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        fake_proc(dir.path(), 175, 125);
        let batch = b.read(&[CPU_USAGE.to_string()], &TEST_TID).unwrap();
        assert_eq!(batch.values, vec![(CPU_USAGE.to_string(), Number::Float(75.0))]);
    }

    #[test]
    fn missing_file_reported_per_sensor() {
        let dir = tempfile::tempdir().unwrap();
        fake_proc(dir.path(), 1, 1);
        let mut b = HostBackend::new(&paths(dir.path()), &TEST_TID).unwrap();
        std::fs::remove_file(dir.path().join("meminfo")).unwrap();
        let batch = b
            .read(&[RAM_USAGE.to_string(), NET_READ.to_string()], &TEST_TID)
            .unwrap();
        assert_eq!(batch.values, vec![(NET_READ.to_string(), Number::Int(1000))]);
        assert_eq!(batch.failed[0].0, RAM_USAGE);
    }
}
