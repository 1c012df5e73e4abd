//! Turns gathered sample buffers into the measurement tree and keeps every level's metrics
//! consistent with what lies beneath it.
//!
//! All functions are pure over the tree: processing the same nodes twice yields the same metrics.
//! Metrics are stored in base units.

use crate::clock::iso_timestamp;
use crate::data::{
    AggregateType, DataNode, DeviceType, Metric, MetricType, NodeType, RegionRecord, SensorKind, SensorStream, Stats,
};
use crate::monitor_config::PostProcessingConfig;
use crate::sampler::SampleBuffer;
use crate::transaction::TransactionId;
use crate::units::{Magnitude, Number, Unit};
use crate::utils::{env_first, increase_id_counter};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

const NS_PER_S: f64 = 1e9;
const J_PER_KWH: f64 = 3.6e6;

/// Unix nanosecond interval, inclusive on both ends.
pub type Window = (u64, u64);

/// What one rank hands to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankPayload {
    pub rank: usize,
    pub hostname: String,
    pub buffer: SampleBuffer,
    pub regions: Vec<RegionRecord>,
    /// backend name to why it never started
    #[serde(default)]
    pub excluded: BTreeMap<String, String>,
    /// static backend facts, e.g. `nvml.driver_version`
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Facts about a run that are not in any payload.
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub run_id: String,
    pub post: &'a PostProcessingConfig,
    pub sampling_period: f64,
    pub started_ns: u64,
}

fn secs(ns: u64) -> f64 {
    ns as f64 / NS_PER_S
}

/// Increment between two counter reads, correcting for a wrap at `wrap`.
/// A decrease without a known wrap bound is treated as a counter restart.
pub fn counter_delta(prev: u64, cur: u64, wrap: Option<u64>) -> u128 {
    if cur >= prev {
        return (cur - prev) as u128;
    }
    match wrap {
        Some(w) if w >= prev => (w - prev) as u128 + cur as u128,
        _ => cur as u128,
    }
}

fn counter_raw(v: &Number) -> u64 {
    match v {
        Number::Int(i) => *i,
        Number::Float(f) => f.max(0.0) as u64,
    }
}

/// Running total of counter increments, zero at the first sample.
fn cumulative(stream: &SensorStream, wrap: Option<u64>) -> Vec<u128> {
    let mut out = Vec::with_capacity(stream.len());
    let mut acc: u128 = 0;
    let mut prev = None;
    for v in &stream.values {
        let cur = counter_raw(v);
        if let Some(p) = prev {
            acc += counter_delta(p, cur, wrap);
        }
        out.push(acc);
        prev = Some(cur);
    }
    out
}

/// Linear interpolation of `ys` at `t`, clamped to the sampled range. `ts` must not be empty.
fn interpolate(ts: &[u64], ys: &[f64], t: u64) -> f64 {
    let last = ts.len() - 1;
    if t <= ts[0] {
        return ys[0];
    }
    if t >= ts[last] {
        return ys[last];
    }
    let i = ts.partition_point(|x| *x <= t);
    let (t0, t1) = (ts[i - 1], ts[i]);
    if t1 == t0 {
        return ys[i];
    }
    let frac = (t - t0) as f64 / (t1 - t0) as f64;
    ys[i - 1] + (ys[i] - ys[i - 1]) * frac
}

/// Points for integrating over `[start, end]`: interpolated edges plus every sample strictly inside.
fn clip(ts: &[u64], ys: &[f64], start: u64, end: u64) -> (Vec<u64>, Vec<f64>) {
    let mut pts_t = vec![start];
    let mut pts_y = vec![interpolate(ts, ys, start)];
    if end == start {
        return (pts_t, pts_y);
    }
    for (t, y) in ts.iter().zip(ys.iter()) {
        if *t > start && *t < end {
            pts_t.push(*t);
            pts_y.push(*y);
        }
    }
    pts_t.push(end);
    pts_y.push(interpolate(ts, ys, end));
    (pts_t, pts_y)
}

/// Trapezoidal integral of `ys` over `ts` (nanoseconds), in value-seconds.
/// Fewer than two points integrate to zero.
pub fn trapezoid(ts: &[u64], ys: &[f64]) -> f64 {
    ts.windows(2)
        .zip(ys.windows(2))
        .map(|(t, y)| secs(t[1].saturating_sub(t[0])) * (y[0] + y[1]) / 2.0)
        .sum()
}

fn insert_energy(out: &mut BTreeMap<MetricType, Metric>, dt: DeviceType, energy: f64, runtime: f64, power_stats: Option<Stats>) {
    let power = match runtime > 0.0 {
        true => energy / runtime,
        false => 0.0,
    };
    out.insert(MetricType::Energy, Metric::new(MetricType::Energy, energy));
    out.insert(MetricType::Power, Metric::new(MetricType::Power, power).with_stats(power_stats));
    if let Some(e) = MetricType::energy_for(dt) {
        out.insert(e, Metric::new(e, energy));
    }
    if let Some(p) = MetricType::power_for(dt) {
        out.insert(p, Metric::new(p, power).with_stats(power_stats));
    }
}

/// Metrics of one sensor, over the whole stream or restricted to `window`.
/// A window that does not overlap the samples yields no metrics.
pub fn sensor_metrics(stream: &SensorStream, window: Option<Window>) -> BTreeMap<MetricType, Metric> {
    let mut out = BTreeMap::new();
    let ts = &stream.timestamps;
    let (first, last) = match (ts.first(), ts.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return out,
    };
    let (start, end) = match window {
        None => (first, last),
        Some((a, b)) => (a.max(first), b.min(last)),
    };
    if start > end {
        return out;
    }
    let d = &stream.descriptor;
    let factor = d.magnitude.factor();
    let runtime = secs(end - start);
    out.insert(MetricType::Runtime, Metric::new(MetricType::Runtime, runtime));

    match d.kind {
        SensorKind::Counter { wrap } => {
            let cum = cumulative(stream, wrap);
            let total = match window {
                None => cum.last().copied().unwrap_or(0) as f64 * factor,
                Some(_) => {
                    let ys = cum.iter().map(|c| *c as f64).collect::<Vec<f64>>();
                    (interpolate(ts, &ys, end) - interpolate(ts, &ys, start)) * factor
                },
            };
            if d.unit == Unit::Joule {
                let interval_power = match window {
                    None => {
                        let p = ts
                            .windows(2)
                            .zip(cum.windows(2))
                            .filter(|(t, _)| t[1] > t[0])
                            .map(|(t, c)| (c[1] - c[0]) as f64 * factor / secs(t[1] - t[0]))
                            .collect::<Vec<f64>>();
                        Stats::from_values(&p)
                    },
                    Some(_) => None,
                };
                insert_energy(&mut out, d.device_type, total, runtime, interval_power);
            } else {
                let mut m = Metric::new(d.measures, total);
                if window.is_none() && d.magnitude == Magnitude::One {
                    let exact = cum.last().copied().unwrap_or(0);
                    m.value = Number::Int(u64::try_from(exact).unwrap_or(u64::MAX));
                }
                m.unit = d.unit;
                out.insert(d.measures, m);
            }
        },
        SensorKind::Gauge => {
            let ys = stream.values.iter().map(|v| v.as_f64() * factor).collect::<Vec<f64>>();
            let (pts_t, pts_y) = clip(ts, &ys, start, end);
            let inside = ts
                .iter()
                .zip(ys.iter())
                .filter(|(t, _)| **t >= start && **t <= end)
                .map(|(_, y)| *y)
                .collect::<Vec<f64>>();
            let stats = match inside.is_empty() {
                false => Stats::from_values(&inside),
                true => Stats::from_values(&pts_y),
            };
            let mean = match window {
                // time weighted, so the edges count as much as the samples
                Some(_) if end > start => trapezoid(&pts_t, &pts_y) / runtime,
                _ => stats.map(|s| s.mean).unwrap_or(0.0),
            };
            if d.unit == Unit::Watt {
                let energy = trapezoid(&pts_t, &pts_y);
                insert_energy(&mut out, d.device_type, energy, runtime, stats);
                // instantaneous power is reported as the sample mean
                for p in [Some(MetricType::Power), MetricType::power_for(d.device_type)].into_iter().flatten() {
                    out.insert(p, Metric::new(p, mean).with_stats(stats));
                }
            } else {
                let mut m = Metric::new(d.measures, mean).with_stats(stats);
                m.unit = d.unit;
                out.insert(d.measures, m);
            }
        },
    }
    out
}

fn combine(metric_type: MetricType, metrics: &[&Metric]) -> Metric {
    let agg = metric_type.aggregate();
    if let [only] = metrics {
        let mut m = (*only).clone();
        if m.magnitude != Magnitude::One {
            m.value = Number::Float(m.base_value());
            m.magnitude = Magnitude::One;
        }
        m.agg = agg;
        return m;
    }
    let values = metrics.iter().map(|m| m.base_value()).collect::<Vec<f64>>();
    let stats = Stats::from_values(&values);
    let mut m = Metric::new(metric_type, stats.map(|s| s.select(agg)).unwrap_or(0.0)).with_stats(stats);
    m.unit = metrics.first().map(|f| f.unit).unwrap_or(m.unit);
    let exact = agg == AggregateType::Sum
        && metrics
            .iter()
            .all(|m| m.magnitude == Magnitude::One && m.value.as_u64().is_some());
    if exact {
        let sum = metrics
            .iter()
            .fold(0u64, |acc, m| acc.saturating_add(m.value.as_u64().unwrap_or(0)));
        m.value = Number::Int(sum);
    }
    m
}

/// Combine the metrics of sibling nodes by each metric's aggregation rule.
pub fn rollup<'a>(children: impl IntoIterator<Item = &'a DataNode>) -> BTreeMap<MetricType, Metric> {
    let mut by_type: BTreeMap<MetricType, Vec<&Metric>> = BTreeMap::new();
    for c in children {
        for (t, m) in c.metrics.iter() {
            by_type.entry(*t).or_default().push(m);
        }
    }
    by_type.into_iter().map(|(t, ms)| (t, combine(t, &ms))).collect()
}

fn annotate_samples(metadata: &mut BTreeMap<String, String>, samples: u64, expected: u64, failed: u64, note: Option<&str>) {
    metadata.insert("samples".to_string(), samples.to_string());
    metadata.insert("samples_expected".to_string(), expected.to_string());
    if expected > samples {
        metadata.insert("shortfall".to_string(), (expected - samples).to_string());
    }
    if failed > 0 {
        metadata.insert("failed_reads".to_string(), failed.to_string());
    }
    if let Some(n) = note {
        metadata.insert("note".to_string(), n.to_string());
    }
}

fn process_device(dev: &mut DataNode) {
    let mut samples = u64::MAX;
    let mut expected = 0;
    let mut failed = 0;
    let mut notes = BTreeSet::new();
    for s in dev.children.values_mut().filter(|c| c.node_type == NodeType::Sensor) {
        if let Some(raw) = &s.raw {
            s.metrics = sensor_metrics(raw, None);
            annotate_samples(
                &mut s.metadata,
                raw.len() as u64,
                raw.expected,
                raw.failed,
                raw.note.as_deref(),
            );
            samples = samples.min(raw.len() as u64);
            expected = expected.max(raw.expected);
            failed += raw.failed;
            if let Some(n) = &raw.note {
                notes.insert(n.clone());
            }
            s.processed = true;
        }
    }
    dev.metrics = rollup(dev.children.values());
    if samples != u64::MAX {
        let note = notes.into_iter().collect::<Vec<_>>().join("; ");
        annotate_samples(
            &mut dev.metadata,
            samples,
            expected,
            failed,
            Some(note.as_str()).filter(|n| !n.is_empty()),
        );
    }
    dev.processed = true;
}

fn meta_u64(node: &DataNode, key: &str) -> Option<u64> {
    node.metadata.get(key).and_then(|v| v.parse().ok())
}

fn scale(m: &mut Metric, by: f64) {
    m.value = Number::Float(m.base_value() * by);
    m.magnitude = Magnitude::One;
    if let Some(s) = m.stats.as_mut() {
        s.sum *= by;
        s.mean *= by;
        s.std *= by;
        s.min *= by;
        s.max *= by;
    }
}

fn add_to(metrics: &mut BTreeMap<MetricType, Metric>, t: MetricType, amount: f64) {
    let current = metrics.get(&t).map(|m| m.base_value()).unwrap_or(0.0);
    let stats = metrics.get(&t).and_then(|m| m.stats);
    metrics.insert(t, Metric::new(t, current + amount).with_stats(stats));
}

/// Process a host's devices and sum them into the host; the host's own metrics are its "All" aggregate.
fn process_host(host: &mut DataNode, post: &PostProcessingConfig) {
    for d in host.children.values_mut().filter(|c| c.node_type == NodeType::Device) {
        process_device(d);
    }
    host.metrics = rollup(host.children_of_type(NodeType::Device));
    if let (Some(start), Some(stop)) = (meta_u64(host, "started_ns"), meta_u64(host, "stopped_ns")) {
        host.set_metric(Metric::new(MetricType::Runtime, secs(stop.saturating_sub(start))));
    }
    if post.power_overhead > 0.0 {
        let runtime = host.value(MetricType::Runtime).unwrap_or(0.0);
        add_to(&mut host.metrics, MetricType::Power, post.power_overhead);
        add_to(&mut host.metrics, MetricType::Energy, post.power_overhead * runtime);
    }
    host.processed = true;
}

fn cost_metrics(metrics: &mut BTreeMap<MetricType, Metric>, post: &PostProcessingConfig) {
    let kwh = metrics.get(&MetricType::Energy).map(|m| m.base_value()).unwrap_or(0.0) / J_PER_KWH;
    metrics.insert(MetricType::Money, Metric::new(MetricType::Money, kwh * post.price_factor));
    metrics.insert(MetricType::Co2, Metric::new(MetricType::Co2, kwh * post.emissions_factor));
}

/// Recompute a RUN from its hosts and raw streams, replacing its REGION children.
pub fn process_run(run: &mut DataNode, post: &PostProcessingConfig) {
    for h in run.children.values_mut().filter(|c| c.node_type == NodeType::Node) {
        process_host(h, post);
    }
    let mut metrics = rollup(run.children_of_type(NodeType::Node));
    // facility overhead applies to the energy bill, not to what the hosts drew
    if let Some(m) = metrics.get_mut(&MetricType::Energy) {
        scale(m, post.pue);
    }
    cost_metrics(&mut metrics, post);
    run.metrics = metrics;
    run.metadata.insert("pue".to_string(), post.pue.to_string());
    run.metadata.insert("price_unit".to_string(), post.price_unit.clone());

    run.children.retain(|_, c| c.node_type != NodeType::Region);
    for r in region_nodes(run, post) {
        run.children.insert(r.id.clone(), r);
    }
    run.processed = true;
}

fn host_of_rank(run: &DataNode, rank: usize) -> Option<&DataNode> {
    let rank = rank.to_string();
    run.children_of_type(NodeType::Node).find(|h| {
        h.metadata
            .get("ranks")
            .map(|rs| rs.split(',').any(|r| r == rank))
            .unwrap_or(false)
    })
}

const REGION_ENERGIES: [MetricType; 4] = [
    MetricType::Energy,
    MetricType::CpuEnergy,
    MetricType::GpuEnergy,
    MetricType::DramEnergy,
];

/// Levels averaged over a region call, combined across devices by their aggregation rule.
const REGION_LEVELS: [MetricType; 4] = [MetricType::CpuUtil, MetricType::GpuUtil, MetricType::DramMem, MetricType::GpuMem];

/// Metrics of one region call, from the host devices of the host running its rank.
fn region_call(run: &DataNode, rec: &RegionRecord, post: &PostProcessingConfig) -> Option<BTreeMap<MetricType, f64>> {
    let host = host_of_rank(run, rec.rank)?;
    let window = (rec.start_ns, rec.end_ns);
    let runtime = secs(rec.end_ns.saturating_sub(rec.start_ns));
    let mut vals: BTreeMap<MetricType, f64> = REGION_ENERGIES.iter().map(|t| (*t, 0.0)).collect();
    let mut levels: BTreeMap<MetricType, Vec<f64>> = BTreeMap::new();
    for dev in host.children_of_type(NodeType::Device) {
        if !matches!(dev.device_type, Some(DeviceType::Cpu | DeviceType::Gpu | DeviceType::Ram)) {
            continue;
        }
        for s in dev.sensors() {
            if let Some(raw) = &s.raw {
                let m = sensor_metrics(raw, Some(window));
                for t in REGION_ENERGIES {
                    if let Some(v) = m.get(&t) {
                        *vals.entry(t).or_insert(0.0) += v.base_value();
                    }
                }
                for t in REGION_LEVELS {
                    if let Some(v) = m.get(&t) {
                        levels.entry(t).or_default().push(v.base_value());
                    }
                }
            }
        }
    }
    for (t, vs) in levels {
        if let Some(s) = Stats::from_values(&vs) {
            vals.insert(t, s.select(t.aggregate()));
        }
    }
    let energy = vals.get(&MetricType::Energy).copied().unwrap_or(0.0) + post.power_overhead * runtime;
    vals.insert(MetricType::Energy, energy);
    vals.insert(MetricType::Runtime, runtime);
    vals.insert(
        MetricType::Power,
        match runtime > 0.0 {
            true => energy / runtime,
            false => 0.0,
        },
    );
    Some(vals)
}

/// One REGION node per region name, merging every recorded call of that name.
pub fn region_nodes(run: &DataNode, post: &PostProcessingConfig) -> Vec<DataNode> {
    let mut by_name: BTreeMap<&str, Vec<&RegionRecord>> = BTreeMap::new();
    for r in &run.regions {
        by_name.entry(r.name.as_str()).or_default().push(r);
    }
    let mut out = vec![];
    for (name, calls) in by_name {
        let mut node = DataNode::new(name, NodeType::Region);
        let mut per_type: BTreeMap<MetricType, Vec<f64>> = BTreeMap::new();
        let mut unmatched = 0;
        for rec in &calls {
            match region_call(run, rec, post) {
                Some(vals) => {
                    for (t, v) in vals {
                        per_type.entry(t).or_default().push(v);
                    }
                },
                None => unmatched += 1,
            }
        }
        for (t, vals) in per_type {
            let stats = Stats::from_values(&vals);
            let agg = match t {
                MetricType::Power => AggregateType::Mean,
                t if REGION_LEVELS.contains(&t) => AggregateType::Mean,
                _ => AggregateType::Sum,
            };
            let value = stats.map(|s| s.select(agg)).unwrap_or(0.0);
            node.set_metric(Metric::new(t, value).with_stats(stats).with_agg(agg));
        }
        let mut n_calls = Metric::new(MetricType::NCalls, 0.0);
        n_calls.value = Number::Int(calls.len() as u64);
        node.set_metric(n_calls);
        let ranks = calls.iter().map(|c| c.rank).collect::<BTreeSet<usize>>();
        node.metadata.insert("ranks".to_string(), join(ranks.iter()));
        if unmatched > 0 {
            node.metadata.insert("unmatched_calls".to_string(), unmatched.to_string());
        }
        node.processed = true;
        out.push(node);
    }
    out
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}

/// Build and process a RUN from whatever ranks delivered; `None` entries are lost ranks.
pub fn build_run(ctx: &RunContext, payloads: Vec<Option<RankPayload>>, tid: &TransactionId) -> Result<DataNode> {
    let mut run = DataNode::new(ctx.run_id.clone(), NodeType::Run);
    run.metadata.insert("sampling_period".to_string(), ctx.sampling_period.to_string());
    run.metadata.insert("world_size".to_string(), payloads.len().to_string());
    run.metadata.insert("started".to_string(), iso_timestamp(ctx.started_ns)?);
    run.metadata.insert("started_ns".to_string(), ctx.started_ns.to_string());

    let mut lost = vec![];
    let mut excluded = BTreeSet::new();
    let mut disabled = BTreeSet::new();
    for (idx, payload) in payloads.into_iter().enumerate() {
        let p = match payload {
            Some(p) => p,
            None => {
                lost.push(idx);
                continue;
            },
        };
        let host = run
            .children
            .entry(p.hostname.clone())
            .or_insert_with(|| DataNode::new(p.hostname.clone(), NodeType::Node));
        let mut ranks = host
            .metadata
            .get("ranks")
            .map(|r| r.split(',').filter_map(|s| s.parse::<usize>().ok()).collect::<BTreeSet<_>>())
            .unwrap_or_default();
        ranks.insert(p.rank);
        host.metadata.insert("ranks".to_string(), join(ranks.iter()));
        if p.buffer.ticks > 0 {
            let start = meta_u64(host, "started_ns").unwrap_or(u64::MAX).min(p.buffer.started_ns);
            let stop = meta_u64(host, "stopped_ns").unwrap_or(0).max(p.buffer.stopped_ns);
            host.metadata.insert("started_ns".to_string(), start.to_string());
            host.metadata.insert("stopped_ns".to_string(), stop.to_string());
        }
        host.metadata.extend(p.metadata);

        for stream in p.buffer.streams {
            let key = stream.descriptor.device.clone();
            let dt = stream.descriptor.device_type;
            let dev = host.children.entry(key.clone()).or_insert_with(|| {
                let mut d = DataNode::new(key, NodeType::Device);
                d.device_type = Some(dt);
                d
            });
            dev.metadata.insert("rank".to_string(), p.rank.to_string());
            let sensor_id = stream.descriptor.id.clone();
            if let Err(e) = dev.add_child(DataNode::sensor(stream)) {
                warn!(tid=tid, rank=p.rank, sensor=%sensor_id, error=%e, "Sensor sampled twice on one host, keeping the first");
            }
        }
        for (b, why) in p.excluded {
            excluded.insert(format!("{}@{}: {}", b, p.hostname, why));
        }
        for (b, why) in p.buffer.disabled {
            disabled.insert(format!("{}@{} (rank {}): {}", b, p.hostname, p.rank, why));
        }
        run.regions.extend(p.regions);
    }
    run.regions
        .sort_by(|a, b| (&a.name, a.rank, a.start_ns, a.end_ns).cmp(&(&b.name, b.rank, b.start_ns, b.end_ns)));

    if !lost.is_empty() {
        warn!(tid=tid, ranks=?lost, "Ranks never delivered samples, aggregating without them");
        run.metadata.insert("lost_ranks".to_string(), join(lost.iter()));
    }
    if !excluded.is_empty() {
        run.metadata.insert("excluded_backends".to_string(), excluded.into_iter().collect::<Vec<_>>().join("; "));
    }
    if !disabled.is_empty() {
        run.metadata.insert("disabled_backends".to_string(), disabled.into_iter().collect::<Vec<_>>().join("; "));
    }
    process_run(&mut run, ctx.post);
    debug!(tid=tid, run=%run.id, hosts=run.children_of_type(NodeType::Node).count(), "Run processed");
    Ok(run)
}

/// The run id to use: explicit, `SLURM` for the job id, or the ISO start time.
pub fn resolve_run_id(requested: Option<&str>, started_ns: u64, tid: &TransactionId) -> Result<String> {
    match requested.map(str::trim) {
        Some("SLURM") => match env_first(&["SLURM_JOB_ID"]) {
            Some(id) => Ok(id),
            None => {
                warn!(tid = tid, "run_id is SLURM but SLURM_JOB_ID is not set, using start time");
                iso_timestamp(started_ns)
            },
        },
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => iso_timestamp(started_ns),
    }
}

/// Stats across RUN children; each metric's value is the mean over runs.
pub fn process_multi_run(mr: &mut DataNode) {
    let mut by_type: BTreeMap<MetricType, Vec<f64>> = BTreeMap::new();
    let mut n_runs = 0;
    for run in mr.children_of_type(NodeType::Run) {
        n_runs += 1;
        for (t, m) in run.metrics.iter() {
            by_type.entry(*t).or_default().push(m.base_value());
        }
    }
    mr.metrics = by_type
        .into_iter()
        .map(|(t, vals)| {
            let stats = Stats::from_values(&vals);
            let m = Metric::new(t, stats.map(|s| s.mean).unwrap_or(0.0))
                .with_stats(stats)
                .with_agg(AggregateType::Mean);
            (t, m)
        })
        .collect();
    let mut runs = Metric::new(MetricType::NRuns, 0.0);
    runs.value = Number::Int(n_runs);
    mr.set_metric(runs);
    mr.processed = true;
}

const LIFETIME_TOTALS: [MetricType; 4] = [MetricType::Energy, MetricType::Co2, MetricType::Money, MetricType::Runtime];

/// Lifetime totals over every RUN in the history.
pub fn process_app(app: &mut DataNode) {
    for mr in app.children.values_mut().filter(|c| c.node_type == NodeType::MultiRun) {
        process_multi_run(mr);
    }
    let mut totals: BTreeMap<MetricType, f64> = LIFETIME_TOTALS.iter().map(|t| (*t, 0.0)).collect();
    let mut n_runs = 0;
    for mr in app.children_of_type(NodeType::MultiRun) {
        for run in mr.children_of_type(NodeType::Run) {
            n_runs += 1;
            for t in LIFETIME_TOTALS {
                *totals.entry(t).or_insert(0.0) += run.value(t).unwrap_or(0.0);
            }
        }
    }
    app.metrics = totals
        .into_iter()
        .map(|(t, v)| (t, Metric::new(t, v).with_agg(AggregateType::Sum)))
        .collect();
    let mut runs = Metric::new(MetricType::NRuns, 0.0);
    runs.value = Number::Int(n_runs);
    app.set_metric(runs);
    app.processed = true;
}

pub fn new_app(name: &str) -> DataNode {
    let mut app = DataNode::new(name, NodeType::App);
    process_app(&mut app);
    app
}

fn all_run_ids(app: &DataNode) -> Vec<String> {
    app.children_of_type(NodeType::MultiRun)
        .flat_map(|mr| mr.children_of_type(NodeType::Run).map(|r| r.id.clone()))
        .collect()
}

/// Wrap `runs` in a MULTI_RUN, add it to the history and refresh the totals.
/// Run ids already in the history get `_N` suffixes. Returns the MULTI_RUN id.
pub fn append_runs(app: &mut DataNode, runs: Vec<DataNode>, tid: &TransactionId) -> Result<String> {
    let mut taken = all_run_ids(app);
    let mut mr_id = None;
    let mut renamed = vec![];
    for mut run in runs {
        let id = increase_id_counter(taken.iter(), &run.id);
        if id != run.id {
            debug!(tid=tid, from=%run.id, to=%id, "Run id already used, renaming");
            run.id = id.clone();
        }
        taken.push(id.clone());
        mr_id.get_or_insert_with(|| id.clone());
        renamed.push(run);
    }
    let mr_id = match mr_id {
        Some(id) => increase_id_counter(app.children.keys(), &id),
        None => anyhow::bail!("Refusing to append an empty set of runs to '{}'", app.id),
    };
    let mut mr = DataNode::new(mr_id.clone(), NodeType::MultiRun);
    for r in renamed {
        mr.add_child(r)?;
    }
    app.add_child(mr)?;
    process_app(app);
    info!(tid=tid, app=%app.id, multi_run=%mr_id, "Appended runs to history");
    Ok(mr_id)
}
