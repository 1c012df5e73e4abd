//! The measurement tree: APP -> MULTI_RUN -> RUN -> NODE -> DEVICE -> SENSOR, plus REGION nodes under a RUN.

use crate::units::{Magnitude, Number, Unit};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    App,
    MultiRun,
    Run,
    /// A host
    Node,
    Device,
    Sensor,
    Region,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Ram,
    Net,
    Disk,
    Other,
}
impl DeviceType {
    /// Devices that live on the host rather than being bound to a process.
    pub fn is_host_level(&self) -> bool {
        !matches!(self, DeviceType::Gpu)
    }
    /// Devices whose power contributes to host energy.
    pub fn draws_power(&self) -> bool {
        matches!(self, DeviceType::Cpu | DeviceType::Gpu | DeviceType::Ram | DeviceType::Other)
    }
}
impl Display for DeviceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Ram => "RAM",
            DeviceType::Net => "NET",
            DeviceType::Disk => "DISK",
            DeviceType::Other => "OTHER",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Sum,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Runtime,
    Power,
    CpuPower,
    GpuPower,
    DramPower,
    OtherPower,
    CpuUtil,
    GpuUtil,
    DramMem,
    GpuMem,
    OtherMem,
    NetRead,
    NetWrite,
    DiskRead,
    DiskWrite,
    Energy,
    CpuEnergy,
    GpuEnergy,
    DramEnergy,
    OtherEnergy,
    CpuClock,
    GpuClock,
    NRuns,
    NCalls,
    Money,
    Co2,
}

impl MetricType {
    /// How values of this metric combine across sibling nodes.
    pub fn aggregate(&self) -> AggregateType {
        use MetricType::*;
        match self {
            Runtime => AggregateType::Max,
            CpuUtil | GpuUtil | CpuClock | GpuClock => AggregateType::Mean,
            _ => AggregateType::Sum,
        }
    }

    pub fn unit(&self) -> Unit {
        use MetricType::*;
        match self {
            Runtime => Unit::Second,
            Power | CpuPower | GpuPower | DramPower | OtherPower => Unit::Watt,
            CpuUtil | GpuUtil => Unit::Percent,
            DramMem | GpuMem | OtherMem | NetRead | NetWrite | DiskRead | DiskWrite => Unit::Byte,
            Energy | CpuEnergy | GpuEnergy | DramEnergy | OtherEnergy => Unit::Joule,
            CpuClock | GpuClock => Unit::Hertz,
            NRuns | NCalls | Money => Unit::Scalar,
            Co2 => Unit::Gram,
        }
    }

    /// The device-specific power metric matching a device type.
    pub fn power_for(dt: DeviceType) -> Option<Self> {
        match dt {
            DeviceType::Cpu => Some(MetricType::CpuPower),
            DeviceType::Gpu => Some(MetricType::GpuPower),
            DeviceType::Ram => Some(MetricType::DramPower),
            DeviceType::Other => Some(MetricType::OtherPower),
            _ => None,
        }
    }
    /// The device-specific energy metric matching a device type.
    pub fn energy_for(dt: DeviceType) -> Option<Self> {
        match dt {
            DeviceType::Cpu => Some(MetricType::CpuEnergy),
            DeviceType::Gpu => Some(MetricType::GpuEnergy),
            DeviceType::Ram => Some(MetricType::DramEnergy),
            DeviceType::Other => Some(MetricType::OtherEnergy),
            _ => None,
        }
    }
}

/// Summary statistics over a set of samples or children.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    /// population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len() as f64;
        let sum: f64 = values.iter().sum();
        let mean = sum / count;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        Some(Stats {
            count: values.len() as u64,
            sum,
            mean,
            std: var.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// The statistic selected by an aggregation rule.
    pub fn select(&self, agg: AggregateType) -> f64 {
        match agg {
            AggregateType::Sum => self.sum,
            AggregateType::Mean => self.mean,
            AggregateType::Max => self.max,
            AggregateType::Min => self.min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric_type: MetricType,
    pub value: Number,
    pub unit: Unit,
    pub magnitude: Magnitude,
    pub agg: AggregateType,
    /// Present when the value summarizes several samples or children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
}

impl Metric {
    /// A metric in base units using the type's default unit and aggregation.
    pub fn new(metric_type: MetricType, value: f64) -> Self {
        Metric {
            metric_type,
            value: Number::Float(value),
            unit: metric_type.unit(),
            magnitude: Magnitude::One,
            agg: metric_type.aggregate(),
            stats: None,
        }
    }
    pub fn with_stats(mut self, stats: Option<Stats>) -> Self {
        self.stats = stats;
        self
    }
    pub fn with_agg(mut self, agg: AggregateType) -> Self {
        self.agg = agg;
        self
    }
    /// Value converted to base units.
    pub fn base_value(&self) -> f64 {
        self.value.as_f64() * self.magnitude.factor()
    }
}

/// Whether a sensor reports a running counter or an instantaneous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Monotonic counter that wraps back to zero after `wrap`.
    Counter { wrap: Option<u64> },
    Gauge,
}

/// Everything needed to interpret a sensor's readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: String,
    /// Stable key of the device owning this sensor, e.g. `cpu_0` or `CUDA:1`.
    pub device: String,
    pub device_type: DeviceType,
    pub backend: String,
    pub unit: Unit,
    pub magnitude: Magnitude,
    pub kind: SensorKind,
    /// The metric this sensor feeds.
    pub measures: MetricType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One sample from one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp_ns: u64,
    pub value: Number,
    pub unit: Unit,
    pub magnitude: Magnitude,
}

/// Append-only samples of a single sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStream {
    pub descriptor: SensorDescriptor,
    pub timestamps: Vec<u64>,
    pub values: Vec<Number>,
    /// Ticks during which this sensor was scheduled for reading.
    #[serde(default)]
    pub expected: u64,
    /// Reads that failed and were skipped.
    #[serde(default)]
    pub failed: u64,
    /// Why sampling stopped early, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SensorStream {
    pub fn new(descriptor: SensorDescriptor) -> Self {
        SensorStream {
            descriptor,
            timestamps: vec![],
            values: vec![],
            expected: 0,
            failed: 0,
            note: None,
        }
    }

    /// Append a sample; samples older than the last one are rejected.
    pub fn push(&mut self, timestamp_ns: u64, value: Number) -> Result<()> {
        if let Some(last) = self.timestamps.last() {
            if timestamp_ns < *last {
                anyhow::bail!(
                    "Out of order sample for sensor '{}': {} < {}",
                    self.descriptor.id,
                    timestamp_ns,
                    last
                );
            }
        }
        self.timestamps.push(timestamp_ns);
        self.values.push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn readings(&self) -> impl Iterator<Item = Reading> + '_ {
        self.timestamps.iter().zip(self.values.iter()).map(|(t, v)| Reading {
            timestamp_ns: *t,
            value: *v,
            unit: self.descriptor.unit,
            magnitude: self.descriptor.magnitude,
        })
    }

    /// Samples that were scheduled but never recorded.
    pub fn shortfall(&self) -> u64 {
        self.expected.saturating_sub(self.values.len() as u64)
    }
}

/// One execution of an instrumented code region on one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub name: String,
    pub rank: usize,
    pub start_ns: u64,
    pub end_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<MetricType, Metric>,
    #[serde(default)]
    pub children: BTreeMap<String, DataNode>,
    /// Raw samples, only on SENSOR nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<SensorStream>,
    /// Region intervals recorded during a RUN.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RegionRecord>,
    /// Set once the node's metrics reflect its subtree.
    #[serde(default)]
    pub processed: bool,
}

impl DataNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        DataNode {
            id: id.into(),
            node_type,
            device_type: None,
            metadata: BTreeMap::new(),
            metrics: BTreeMap::new(),
            children: BTreeMap::new(),
            raw: None,
            regions: vec![],
            processed: false,
        }
    }

    pub fn sensor(stream: SensorStream) -> Self {
        let mut n = DataNode::new(stream.descriptor.id.clone(), NodeType::Sensor);
        n.device_type = Some(stream.descriptor.device_type);
        n.metadata = stream.descriptor.metadata.clone();
        n.metadata.insert("backend".to_string(), stream.descriptor.backend.clone());
        n.raw = Some(stream);
        n
    }

    /// Attach a child; ids must be unique among siblings.
    pub fn add_child(&mut self, child: DataNode) -> Result<()> {
        if self.children.contains_key(&child.id) {
            anyhow::bail!("Node '{}' already has a child with id '{}'", self.id, child.id);
        }
        self.children.insert(child.id.clone(), child);
        Ok(())
    }

    pub fn child(&self, id: &str) -> Option<&DataNode> {
        self.children.get(id)
    }

    pub fn children_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &DataNode> {
        self.children.values().filter(move |c| c.node_type == node_type)
    }

    pub fn metric(&self, metric_type: MetricType) -> Option<&Metric> {
        self.metrics.get(&metric_type)
    }

    /// Metric value in base units, if present.
    pub fn value(&self, metric_type: MetricType) -> Option<f64> {
        self.metric(metric_type).map(|m| m.base_value())
    }

    pub fn set_metric(&mut self, metric: Metric) {
        self.metrics.insert(metric.metric_type, metric);
    }

    /// Every SENSOR node in this subtree, depth first.
    pub fn sensors(&self) -> Vec<&DataNode> {
        let mut out = vec![];
        self.collect_sensors(&mut out);
        out
    }
    fn collect_sensors<'a>(&'a self, out: &mut Vec<&'a DataNode>) {
        if self.node_type == NodeType::Sensor {
            out.push(self);
        }
        for c in self.children.values() {
            c.collect_sensors(out);
        }
    }
}
