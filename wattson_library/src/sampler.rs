//! Background sampling of assigned sensors.
//!
//! `Idle -> Armed -> Sampling -> Stopping -> Drained`. Sampling happens on a dedicated OS thread;
//! the only things shared with the caller are the stop channel and the state flag.

use crate::backends::Backend;
use crate::bail_error;
use crate::clock::{now, unix_nanos};
use crate::continuation::GLOB_CONT_CHECK;
use crate::data::{SensorDescriptor, SensorStream};
use crate::monitor_config::SamplingConfig;
use crate::transaction::TransactionId;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerState {
    Idle,
    Armed,
    Sampling,
    Stopping,
    Drained,
}

/// Everything one rank sampled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleBuffer {
    pub streams: Vec<SensorStream>,
    /// sampling loop iterations, including the first read and any final read
    pub ticks: u64,
    pub started_ns: u64,
    pub stopped_ns: u64,
    /// backend name to why it was dropped mid-run
    pub disabled: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    period: Duration,
    max_consecutive_failures: u32,
    budget: Duration,
    overrun_ticks: u32,
}

struct ActiveBackend {
    name: String,
    /// `None` once disabled, which releases its handles
    backend: Option<Box<dyn Backend>>,
    ids: Vec<String>,
    consecutive_failures: u32,
    overruns: u32,
}

/// State owned by the sampling thread.
struct Worker {
    backends: Vec<ActiveBackend>,
    streams: BTreeMap<String, SensorStream>,
    limits: Limits,
    ticks: u64,
    started_ns: u64,
    disabled: BTreeMap<String, String>,
}

impl Worker {
    fn disable(&mut self, idx: usize, reason: String, tid: &TransactionId) {
        let ab = &mut self.backends[idx];
        warn!(tid=tid, backend=%ab.name, reason=%reason, tick=self.ticks, "Disabling backend for the rest of the run");
        ab.backend = None;
        for id in &ab.ids {
            if let Some(s) = self.streams.get_mut(id) {
                s.note = Some(format!("backend disabled: {}", reason));
            }
        }
        self.disabled.insert(ab.name.clone(), reason);
    }

    fn tick(&mut self, tid: &TransactionId) {
        self.ticks += 1;
        let ts = unix_nanos();
        for idx in 0..self.backends.len() {
            let ab = &mut self.backends[idx];
            let backend = match ab.backend.as_mut() {
                Some(b) => b,
                None => continue,
            };
            let start = now();
            let outcome = backend.read(&ab.ids, tid);
            let took = start.elapsed();
            let mut failure = None;
            match outcome {
                Ok(batch) => {
                    for (id, v) in batch.values.iter() {
                        if let Some(s) = self.streams.get_mut(id) {
                            if let Err(e) = s.push(ts, *v) {
                                debug!(tid=tid, error=%e, "Dropping sample");
                                s.failed += 1;
                            }
                        }
                    }
                    for (id, why) in batch.failed.iter() {
                        trace!(tid=tid, sensor=%id, reason=%why, "Sensor read failed");
                        if let Some(s) = self.streams.get_mut(id) {
                            s.failed += 1;
                        }
                    }
                    if batch.values.is_empty() && !ab.ids.is_empty() {
                        ab.consecutive_failures += 1;
                        if ab.consecutive_failures >= self.limits.max_consecutive_failures {
                            failure = Some(format!("{} consecutive ticks without a reading", ab.consecutive_failures));
                        }
                    } else {
                        ab.consecutive_failures = 0;
                    }
                },
                Err(e) => failure = Some(format!("read failed: {}", e)),
            }
            if failure.is_none() {
                if took > self.limits.budget {
                    ab.overruns += 1;
                    debug!(tid=tid, backend=%ab.name, took_ms=took.as_millis() as u64, "Backend read over budget");
                    if ab.overruns >= self.limits.overrun_ticks {
                        failure = Some(format!(
                            "read took {}ms, over budget of {}ms for {} ticks",
                            took.as_millis(),
                            self.limits.budget.as_millis(),
                            ab.overruns
                        ));
                    }
                } else {
                    ab.overruns = 0;
                }
            }
            if let Some(reason) = failure {
                self.disable(idx, reason, tid);
            }
        }
    }

    /// Run until told to stop, reading once at start and once more on the way out.
    /// The read on the way out is skipped when a periodic read happened less than half a period earlier,
    /// so a run of `n` periods yields `n` or `n + 1` samples.
    fn run(mut self, stop: std::sync::mpsc::Receiver<()>, tid: TransactionId) -> Self {
        debug!(tid=tid, period_ms=self.limits.period.as_millis() as u64, "Sampling thread started");
        let mut tick_start: Instant = now();
        self.tick(&tid);
        loop {
            let wait = self.limits.period.saturating_sub(tick_start.elapsed());
            match stop.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if !GLOB_CONT_CHECK.check_continue() {
                        break;
                    }
                    tick_start = now();
                    self.tick(&tid);
                },
            }
        }
        if self.ticks < 2 || tick_start.elapsed() >= self.limits.period / 2 {
            self.tick(&tid);
        }
        debug!(tid=tid, ticks=self.ticks, "Sampling thread finished");
        self
    }

    /// Release every backend and hand over the streams.
    fn drain(mut self, stopped_ns: u64) -> SampleBuffer {
        self.backends.clear();
        let ticks = self.ticks;
        let streams = self
            .streams
            .into_values()
            .map(|mut s| {
                s.expected = ticks;
                s
            })
            .collect();
        SampleBuffer {
            streams,
            ticks,
            started_ns: self.started_ns,
            stopped_ns,
            disabled: self.disabled,
        }
    }
}

struct Inner {
    state: SamplerState,
    armed: Option<Worker>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<Worker>>,
}

/// Handle to one rank's sampler. Clones share the same sampler.
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<Mutex<Inner>>,
    state: Arc<RwLock<SamplerState>>,
    limits: Limits,
    tid: TransactionId,
}

impl Sampler {
    pub fn new(cfg: &SamplingConfig, tid: &TransactionId) -> Self {
        let period = Duration::from_secs_f64(cfg.sampling_period);
        Sampler {
            inner: Arc::new(Mutex::new(Inner {
                state: SamplerState::Idle,
                armed: None,
                stop_tx: None,
                handle: None,
            })),
            state: Arc::new(RwLock::new(SamplerState::Idle)),
            limits: Limits {
                period,
                max_consecutive_failures: cfg.max_consecutive_failures.max(1),
                budget: period.mul_f64(cfg.overrun_fraction),
                overrun_ticks: cfg.overrun_ticks.max(1),
            },
            tid: tid.clone(),
        }
    }

    pub fn state(&self) -> SamplerState {
        *self.state.read()
    }

    fn set_state(&self, inner: &mut Inner, state: SamplerState) {
        inner.state = state;
        *self.state.write() = state;
    }

    /// Take ownership of the backends and prepare streams for the assigned sensors.
    /// Backends with nothing assigned are released immediately.
    pub fn arm(&self, backends: Vec<Box<dyn Backend>>, sensors: &[SensorDescriptor]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SamplerState::Idle {
            bail_error!(tid=self.tid, state=?inner.state, "Sampler can only be armed when idle");
        }
        let wanted: BTreeMap<&str, &SensorDescriptor> = sensors.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut active = vec![];
        let mut streams = BTreeMap::new();
        for b in backends {
            let ids = b
                .sensors()
                .into_iter()
                .filter_map(|s| wanted.get(s.id.as_str()).map(|d| (*d).clone()))
                .collect::<Vec<SensorDescriptor>>();
            if ids.is_empty() {
                debug!(tid=self.tid, backend=%b.name(), "No assigned sensors, releasing backend");
                continue;
            }
            for d in &ids {
                streams.insert(d.id.clone(), SensorStream::new(d.clone()));
            }
            active.push(ActiveBackend {
                name: b.name().to_string(),
                backend: Some(b),
                ids: ids.into_iter().map(|d| d.id).collect(),
                consecutive_failures: 0,
                overruns: 0,
            });
        }
        let unknown = wanted
            .keys()
            .filter(|id| !streams.contains_key(**id))
            .collect::<BTreeSet<_>>();
        if !unknown.is_empty() {
            warn!(tid=self.tid, sensors=?unknown, "Assigned sensors not offered by any backend");
        }
        info!(tid=self.tid, backends=active.len(), sensors=streams.len(), "Sampler armed");
        inner.armed = Some(Worker {
            backends: active,
            streams,
            limits: self.limits,
            ticks: 0,
            started_ns: 0,
            disabled: BTreeMap::new(),
        });
        self.set_state(&mut inner, SamplerState::Armed);
        Ok(())
    }

    /// Begin the periodic loop on its own thread.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SamplerState::Armed {
            bail_error!(tid=self.tid, state=?inner.state, "Sampler must be armed before it is started");
        }
        let mut worker = match inner.armed.take() {
            Some(w) => w,
            None => bail_error!(tid=self.tid, "Armed sampler lost its worker"),
        };
        worker.started_ns = unix_nanos();
        let (tx, rx) = channel();
        let tid = self.tid.clone();
        let handle = match std::thread::Builder::new()
            .name(self.tid.clone())
            .spawn(move || worker.run(rx, tid))
        {
            Ok(h) => h,
            Err(e) => bail_error!(tid=self.tid, error=%e, "Failed to spawn sampling thread"),
        };
        inner.stop_tx = Some(tx);
        inner.handle = Some(handle);
        self.set_state(&mut inner, SamplerState::Sampling);
        Ok(())
    }

    /// Signal the loop, wait for its final read, and take the buffered samples.
    /// A sampler that was armed but never started drains to an empty buffer.
    pub fn stop(&self) -> Result<SampleBuffer> {
        let mut inner = self.inner.lock();
        match inner.state {
            SamplerState::Armed => {
                let worker = inner.armed.take();
                self.set_state(&mut inner, SamplerState::Drained);
                let stopped = unix_nanos();
                return Ok(worker.map(|w| w.drain(stopped)).unwrap_or_default());
            },
            SamplerState::Sampling => (),
            s => bail_error!(tid=self.tid, state=?s, "Sampler is not running"),
        }
        self.set_state(&mut inner, SamplerState::Stopping);
        if let Some(tx) = inner.stop_tx.take() {
            // the thread may already have exited on an application exit signal
            let _ = tx.send(());
        }
        let handle = match inner.handle.take() {
            Some(h) => h,
            None => bail_error!(tid=self.tid, "Running sampler has no thread"),
        };
        let worker = match handle.join() {
            Ok(w) => w,
            Err(_) => {
                self.set_state(&mut inner, SamplerState::Drained);
                bail_error!(tid=self.tid, "Sampling thread panicked, samples are lost");
            },
        };
        let buffer = worker.drain(unix_nanos());
        self.set_state(&mut inner, SamplerState::Drained);
        info!(tid=self.tid, ticks=buffer.ticks, streams=buffer.streams.len(), "Sampler drained");
        Ok(buffer)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!("Sampling thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ReadBatch;
    use crate::data::{DeviceType, MetricType, SensorKind};
    use crate::transaction::TEST_TID;
    use crate::units::{Magnitude, Number, Unit};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counting {
        calls: Arc<AtomicU64>,
        fail_after: Option<u64>,
    }
    fn desc(id: &str) -> SensorDescriptor {
        SensorDescriptor {
            id: id.to_string(),
            device: "dev".to_string(),
            device_type: DeviceType::Other,
            backend: "counting".to_string(),
            unit: Unit::Watt,
            magnitude: Magnitude::One,
            kind: SensorKind::Gauge,
            measures: MetricType::OtherPower,
            metadata: BTreeMap::new(),
        }
    }
    impl Backend for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn sensors(&self) -> Vec<SensorDescriptor> {
            vec![desc("a"), desc("b")]
        }
        fn read(&mut self, ids: &[String], _tid: &TransactionId) -> Result<ReadBatch> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(f) = self.fail_after {
                if n >= f {
                    anyhow::bail!("counter file vanished");
                }
            }
            Ok(ReadBatch {
                values: ids.iter().map(|i| (i.clone(), Number::Int(n))).collect(),
                failed: vec![],
            })
        }
    }

    fn cfg(period: f64) -> SamplingConfig {
        SamplingConfig {
            sampling_period: period,
            include_sensors: vec![],
            exclude_sensors: vec![],
            include_backends: vec![],
            exclude_backends: vec![],
            max_consecutive_failures: 3,
            overrun_fraction: 0.5,
            overrun_ticks: 3,
        }
    }

    #[test]
    fn lifecycle_and_final_read() {
        let calls = Arc::new(AtomicU64::new(0));
        let s = Sampler::new(&cfg(0.02), &TEST_TID);
        assert_eq!(s.state(), SamplerState::Idle);
        assert!(s.start().is_err());
        s.arm(
            vec![Box::new(Counting {
                calls: calls.clone(),
                fail_after: None,
            })],
            &[desc("a")],
        )
        .unwrap();
        assert_eq!(s.state(), SamplerState::Armed);
        s.start().unwrap();
        assert_eq!(s.state(), SamplerState::Sampling);
        std::thread::sleep(Duration::from_millis(110));
        let buf = s.stop().unwrap();
        assert_eq!(s.state(), SamplerState::Drained);
        assert_eq!(buf.streams.len(), 1);
        let stream = &buf.streams[0];
        assert_eq!(stream.len() as u64, buf.ticks);
        assert!(buf.ticks >= 4, "only {} ticks", buf.ticks);
        assert_eq!(calls.load(Ordering::SeqCst), buf.ticks);
        assert!(stream.timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(s.stop().is_err());
    }

    #[rstest::rstest]
    #[case(0.05, 10)]
    #[case(0.02, 25)]
    fn sample_count_follows_the_period(#[case] period: f64, #[case] periods: u32) {
        let calls = Arc::new(AtomicU64::new(0));
        let s = Sampler::new(&cfg(period), &TEST_TID);
        s.arm(
            vec![Box::new(Counting {
                calls: calls.clone(),
                fail_after: None,
            })],
            &[desc("a")],
        )
        .unwrap();
        s.start().unwrap();
        std::thread::sleep(Duration::from_secs_f64(period) * periods);
        let buf = s.stop().unwrap();
        let n = buf.streams[0].len() as u64;
        assert!(n == periods as u64 || n == periods as u64 + 1, "{} samples over {} periods", n, periods);
        assert_eq!(n, buf.ticks);
    }

    #[test]
    fn short_run_still_gets_two_reads() {
        let s = Sampler::new(&cfg(1.0), &TEST_TID);
        s.arm(
            vec![Box::new(Counting {
                calls: Arc::new(AtomicU64::new(0)),
                fail_after: None,
            })],
            &[desc("a")],
        )
        .unwrap();
        s.start().unwrap();
        let buf = s.stop().unwrap();
        assert_eq!(buf.ticks, 2);
    }

    #[test]
    fn failing_backend_is_dropped() {
        let s = Sampler::new(&cfg(0.01), &TEST_TID);
        s.arm(
            vec![Box::new(Counting {
                calls: Arc::new(AtomicU64::new(0)),
                fail_after: Some(5),
            })],
            &[desc("a"), desc("b")],
        )
        .unwrap();
        s.start().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let buf = s.stop().unwrap();
        for stream in &buf.streams {
            assert_eq!(stream.len(), 5);
            assert!(stream.shortfall() > 0);
            assert!(stream.note.as_ref().unwrap().contains("counter file vanished"));
        }
        assert!(buf.disabled.contains_key("counting"));
    }

    #[test]
    fn armed_but_never_started_drains_empty() {
        let s = Sampler::new(&cfg(1.0), &TEST_TID);
        s.arm(vec![], &[]).unwrap();
        let buf = s.stop().unwrap();
        assert!(buf.streams.is_empty());
        assert_eq!(s.state(), SamplerState::Drained);
    }
}
