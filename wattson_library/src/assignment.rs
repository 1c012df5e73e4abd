//! Decides which rank samples which device so shared hardware is read exactly once per host.
//!
//! The functions here are pure: the same inventories always produce the same assignment.
//! Host-level devices go to the lowest rank on the host. Each GPU goes to a rank whose visibility
//! hint names it, else to any rank that can see it, else to the lowest rank; among several candidates
//! the one with the fewest GPUs so far wins, ties broken by ascending rank.

use crate::data::{DeviceType, SensorDescriptor};
use crate::monitor_config::CoordinationConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub key: String,
    pub device_type: DeviceType,
    /// Other names the device goes by in visibility settings, e.g. index or UUID.
    pub aliases: BTreeSet<String>,
}

/// What one rank can see, exchanged between ranks before sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankInventory {
    pub rank: usize,
    pub hostname: String,
    pub devices: Vec<DeviceInfo>,
    /// Devices this rank is bound to, if the launcher said so.
    pub visibility: Option<Vec<String>>,
}

/// rank to device keys
pub type Assignment = BTreeMap<usize, BTreeSet<String>>;

/// Collapse sensors into their devices.
pub fn devices_from_sensors(sensors: &[SensorDescriptor]) -> Vec<DeviceInfo> {
    let mut devices: BTreeMap<String, DeviceInfo> = BTreeMap::new();
    for s in sensors {
        let entry = devices.entry(s.device.clone()).or_insert_with(|| DeviceInfo {
            key: s.device.clone(),
            device_type: s.device_type,
            aliases: BTreeSet::new(),
        });
        for k in ["index", "uuid"] {
            if let Some(v) = s.metadata.get(k) {
                entry.aliases.insert(v.clone());
            }
        }
    }
    devices.into_values().collect()
}

/// This rank's visibility hint: the explicit override, else the first set environment variable.
pub fn visibility_hint(cfg: &CoordinationConfig) -> Option<Vec<String>> {
    if let Some(v) = &cfg.device_visibility {
        return Some(v.clone());
    }
    cfg.visibility_env
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
        .map(|v| parse_visibility(&v))
}

pub fn parse_visibility(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn names_device(hint: &Option<Vec<String>>, dev: &DeviceInfo) -> bool {
    match hint {
        Some(h) => h.iter().any(|t| *t == dev.key || dev.aliases.contains(t)),
        None => false,
    }
}

/// Assign every device seen on every host. Ranks with nothing to sample map to an empty set.
pub fn assign_devices(inventories: &[RankInventory]) -> Assignment {
    let mut hosts: BTreeMap<&str, Vec<&RankInventory>> = BTreeMap::new();
    for inv in inventories {
        hosts.entry(inv.hostname.as_str()).or_default().push(inv);
    }
    let mut out = Assignment::new();
    for (_, mut ranks) in hosts {
        ranks.sort_by_key(|r| r.rank);
        out.extend(assign_host(&ranks));
    }
    out
}

/// `ranks` must be non-empty, sorted by rank and all on one host.
fn assign_host(ranks: &[&RankInventory]) -> Assignment {
    let mut out: Assignment = ranks.iter().map(|r| (r.rank, BTreeSet::new())).collect();
    let lowest = match ranks.first() {
        Some(r) => r.rank,
        None => return out,
    };

    let mut union: BTreeMap<&str, &DeviceInfo> = BTreeMap::new();
    for r in ranks {
        for d in &r.devices {
            union.entry(d.key.as_str()).or_insert(d);
        }
    }

    let mut gpu_load: BTreeMap<usize, usize> = ranks.iter().map(|r| (r.rank, 0)).collect();
    for (key, dev) in union {
        let owner = if dev.device_type.is_host_level() {
            lowest
        } else {
            let bound = ranks
                .iter()
                .filter(|r| names_device(&r.visibility, dev))
                .map(|r| r.rank)
                .collect::<Vec<usize>>();
            let candidates = match bound.is_empty() {
                false => bound,
                true => ranks
                    .iter()
                    .filter(|r| r.devices.iter().any(|d| d.key == key))
                    .map(|r| r.rank)
                    .collect(),
            };
            let chosen = candidates
                .into_iter()
                .min_by_key(|r| (gpu_load.get(r).copied().unwrap_or(0), *r))
                .unwrap_or(lowest);
            *gpu_load.entry(chosen).or_insert(0) += 1;
            chosen
        };
        out.entry(owner).or_default().insert(key.to_string());
    }
    out
}
