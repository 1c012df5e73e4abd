//! Message passing between ranks.
//!
//! Collectives are star shaped through rank 0. Every call advances a sequence number so a late
//! frame from a timed-out collective can never be mistaken for the current one.
//! A rank that does not answer within the timeout is reported as missing instead of blocking.
//!
//! Rank 0 waits at most one timeout for the others, but it may itself arrive up to one timeout after
//! them. The other ranks therefore wait [release_window] for its answer, and the answer to a barrier
//! carries the ranks rank 0 gave up on.

mod rpc;

use crate::bail_error;
use crate::clock::now;
use crate::monitor_config::CoordinationConfig;
use crate::transaction::TransactionId;
use crate::utils::env_first;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const ROOT: usize = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub src: usize,
    pub body: Vec<u8>,
}

/// How long a rank waits for rank 0 to answer a collective with `timeout`.
pub fn release_window(timeout: Duration) -> Duration {
    timeout.saturating_mul(2)
}

/// Frames arriving on one channel, matched to collectives by sequence number.
struct Mailbox {
    rx: Receiver<Frame>,
    /// frames that arrived for a later collective
    early: Vec<Frame>,
}

impl Mailbox {
    fn new(rx: Receiver<Frame>) -> Self {
        Mailbox { rx, early: vec![] }
    }

    fn next(&mut self, seq: u64, deadline: Instant, tid: &TransactionId) -> Option<Frame> {
        if let Some(pos) = self.early.iter().position(|f| f.seq == seq) {
            return Some(self.early.remove(pos));
        }
        loop {
            let remaining = deadline.saturating_duration_since(now());
            if remaining.is_zero() {
                return None;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(f) if f.seq == seq => return Some(f),
                Ok(f) if f.seq > seq => self.early.push(f),
                Ok(f) => debug!(tid=tid, src=f.src, seq=f.seq, current=seq, "Dropping stale frame"),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// How frames travel between one rank and rank 0.
trait Transport: Send {
    /// The frame of collective `seq` from any other rank. Only used on rank 0.
    fn recv_any(&mut self, seq: u64, deadline: Instant) -> Option<Frame>;
    /// Make `frame` rank 0's answer to collective `frame.seq`. Only used on rank 0.
    fn publish(&mut self, frame: Frame, size: usize);
    /// Hand a frame to rank 0.
    fn send_root(&mut self, frame: Frame, deadline: Instant) -> Result<()>;
    /// Rank 0's answer to collective `seq`, `None` once `deadline` passes.
    fn recv_root(&mut self, seq: u64, deadline: Instant) -> Result<Option<Frame>>;
    /// Arrive at a barrier and wait for its release.
    fn arrive(&mut self, arrival: Frame, deadline: Instant) -> Result<Option<Frame>> {
        let seq = arrival.seq;
        self.send_root(arrival, deadline)?;
        self.recv_root(seq, deadline)
    }
}

/// A world of one.
struct Alone;
impl Transport for Alone {
    fn recv_any(&mut self, _seq: u64, _deadline: Instant) -> Option<Frame> {
        None
    }
    fn publish(&mut self, _frame: Frame, _size: usize) {}
    fn send_root(&mut self, _frame: Frame, _deadline: Instant) -> Result<()> {
        anyhow::bail!("Rank 0 does not send to itself")
    }
    fn recv_root(&mut self, _seq: u64, _deadline: Instant) -> Result<Option<Frame>> {
        Ok(None)
    }
}

/// Threads of one process. Rank 0's mailbox holds frames from the others, theirs hold rank 0's answers.
struct ChannelTransport {
    peers: Vec<Sender<Frame>>,
    mailbox: Mailbox,
    tid: TransactionId,
}
impl Transport for ChannelTransport {
    fn recv_any(&mut self, seq: u64, deadline: Instant) -> Option<Frame> {
        self.mailbox.next(seq, deadline, &self.tid)
    }
    fn publish(&mut self, frame: Frame, size: usize) {
        for dest in 1..size {
            let sent = match self.peers.get(dest) {
                Some(p) => p.send(frame.clone()).is_ok(),
                None => false,
            };
            if !sent {
                warn!(tid=self.tid, rank=dest, "Rank has gone away, answer not delivered");
            }
        }
    }
    fn send_root(&mut self, frame: Frame, _deadline: Instant) -> Result<()> {
        match self.peers[ROOT].send(frame) {
            Ok(_) => Ok(()),
            Err(_) => anyhow::bail!("Rank {} has gone away", ROOT),
        }
    }
    fn recv_root(&mut self, seq: u64, deadline: Instant) -> Result<Option<Frame>> {
        Ok(self.mailbox.next(seq, deadline, &self.tid))
    }
}

/// One process's endpoint in a group of ranks.
pub struct Comm {
    rank: usize,
    size: usize,
    seq: u64,
    transport: Box<dyn Transport>,
    tid: TransactionId,
}

fn missing(slots: &[Option<Vec<u8>>]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(r, _)| r)
        .collect()
}

impl Comm {
    fn build(rank: usize, size: usize, transport: Box<dyn Transport>, tid: &TransactionId) -> Self {
        Comm {
            rank,
            size,
            seq: 0,
            transport,
            tid: tid.clone(),
        }
    }

    /// A world of one.
    pub fn local(tid: &TransactionId) -> Self {
        Self::build(ROOT, 1, Box::new(Alone), tid)
    }

    /// `size` connected endpoints for use on threads of one process.
    pub fn in_process_world(size: usize, tid: &TransactionId) -> Vec<Self> {
        let (senders, receivers): (Vec<Sender<Frame>>, Vec<Receiver<Frame>>) = (0..size.max(1)).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                let transport = ChannelTransport {
                    peers: senders.clone(),
                    mailbox: Mailbox::new(rx),
                    tid: tid.clone(),
                };
                Self::build(rank, senders.len(), Box::new(transport), tid)
            })
            .collect()
    }

    /// Connect to the other ranks over gRPC. Rank 0 serves on `coordinator`; the others dial it.
    /// Ranks that have not joined after `timeout` are treated as lost for every later collective.
    pub fn tcp(rank: usize, size: usize, coordinator: &str, timeout: Duration, tid: &TransactionId) -> Result<Self> {
        let transport: Box<dyn Transport> = match rank == ROOT {
            true => Box::new(rpc::RpcRoot::serve(size, coordinator, timeout, tid)?),
            false => Box::new(rpc::RpcRank::connect(rank, size, coordinator, timeout, tid)?),
        };
        Ok(Self::build(rank, size, transport, tid))
    }

    /// Attach to the launcher's world if one is described by configuration or environment.
    pub fn from_config(cfg: &CoordinationConfig, timeout: Duration, tid: &TransactionId) -> Result<Self> {
        let rank = cfg.rank.or_else(|| {
            env_first(&["WATTSON_RANK", "OMPI_COMM_WORLD_RANK", "PMI_RANK", "SLURM_PROCID"]).and_then(|v| v.parse().ok())
        });
        let size = cfg.world_size.or_else(|| {
            env_first(&["WATTSON_WORLD_SIZE", "OMPI_COMM_WORLD_SIZE", "PMI_SIZE", "SLURM_NTASKS"]).and_then(|v| v.parse().ok())
        });
        match (rank, size) {
            (Some(rank), Some(size)) if size > 1 => {
                let coordinator = match cfg.coordinator.clone().or_else(|| env_first(&["WATTSON_COORDINATOR"])) {
                    Some(c) => c,
                    None => {
                        warn!(tid=tid, rank=rank, size=size, "Distributed launch detected but no coordinator address set, measuring this rank alone");
                        return Ok(Self::local(tid));
                    },
                };
                if rank >= size {
                    bail_error!(tid=tid, rank=rank, size=size, "Rank outside of world size");
                }
                info!(tid=tid, rank=rank, size=size, coordinator=%coordinator, "Joining distributed world");
                Self::tcp(rank, size, &coordinator, timeout, tid)
            },
            _ => Ok(Self::local(tid)),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub fn is_root(&self) -> bool {
        self.rank == ROOT
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Rank 0 only: every rank's frame of collective `seq`, waiting at most `timeout`.
    fn collect(&mut self, seq: u64, own: Vec<u8>, timeout: Duration) -> Vec<Option<Vec<u8>>> {
        let deadline = now() + timeout;
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.size];
        slots[ROOT] = Some(own);
        while slots.iter().any(|s| s.is_none()) {
            match self.transport.recv_any(seq, deadline) {
                Some(f) if f.src < self.size && f.src != ROOT => slots[f.src] = Some(f.body),
                Some(f) => warn!(tid=self.tid, src=f.src, "Frame from unknown rank"),
                None => break,
            }
        }
        let lost = missing(&slots);
        if !lost.is_empty() {
            warn!(tid=self.tid, missing=?lost, timeout_ms=timeout.as_millis() as u64, "Ranks did not respond in time and are excluded");
        }
        slots
    }

    fn own_frame(&self, seq: u64, body: Vec<u8>) -> Frame {
        Frame { seq, src: self.rank, body }
    }

    /// Collect every rank's payload on rank 0, which gets `Some` with one slot per rank; `None` marks a lost rank.
    /// Other ranks get `None` once their payload is sent.
    pub fn gather(&mut self, payload: Vec<u8>, timeout: Duration) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        let seq = self.next_seq();
        if self.is_root() {
            return Ok(Some(self.collect(seq, payload, timeout)));
        }
        let frame = self.own_frame(seq, payload);
        self.transport.send_root(frame, now() + timeout)?;
        Ok(None)
    }

    /// Every rank receives every rank's payload.
    pub fn allgather(&mut self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<Option<Vec<u8>>>> {
        let seq = self.next_seq();
        if self.is_root() {
            let slots = self.collect(seq, payload, timeout);
            let answer = Frame {
                seq,
                src: ROOT,
                body: serde_json::to_vec(&slots)?,
            };
            self.transport.publish(answer, self.size);
            return Ok(slots);
        }
        let deadline = now() + release_window(timeout);
        let frame = self.own_frame(seq, payload);
        self.transport.send_root(frame, deadline)?;
        match self.transport.recv_root(seq, deadline)? {
            Some(f) => Ok(serde_json::from_slice(&f.body)?),
            None => bail_error!(tid=self.tid, rank=self.rank, seq=seq, "Timed out waiting for the coordinator rank"),
        }
    }

    /// Wait until every responsive rank arrives. Returns the ranks considered lost, as decided by rank 0.
    pub fn barrier(&mut self, timeout: Duration) -> Result<Vec<usize>> {
        let seq = self.next_seq();
        if self.is_root() {
            let lost = missing(&self.collect(seq, vec![], timeout));
            let release = Frame {
                seq,
                src: ROOT,
                body: serde_json::to_vec(&lost)?,
            };
            self.transport.publish(release, self.size);
            return Ok(lost);
        }
        let arrival = self.own_frame(seq, vec![]);
        match self.transport.arrive(arrival, now() + release_window(timeout))? {
            Some(release) => Ok(serde_json::from_slice(&release.body)?),
            None => bail_error!(tid=self.tid, rank=self.rank, seq=seq, "Timed out waiting for the coordinator rank"),
        }
    }

    pub fn gather_json<T: Serialize + DeserializeOwned>(&mut self, item: &T, timeout: Duration) -> Result<Option<Vec<Option<T>>>> {
        let bytes = serde_json::to_vec(item)?;
        match self.gather(bytes, timeout)? {
            None => Ok(None),
            Some(slots) => {
                let mut out = vec![];
                for (rank, s) in slots.into_iter().enumerate() {
                    out.push(match s {
                        None => None,
                        Some(b) => match serde_json::from_slice(&b) {
                            Ok(v) => Some(v),
                            Err(e) => {
                                warn!(tid=self.tid, rank=rank, error=%e, "Discarding undecodable payload");
                                None
                            },
                        },
                    });
                }
                Ok(Some(out))
            },
        }
    }

    pub fn allgather_json<T: Serialize + DeserializeOwned>(&mut self, item: &T, timeout: Duration) -> Result<Vec<Option<T>>> {
        let bytes = serde_json::to_vec(item)?;
        self.allgather(bytes, timeout)?
            .into_iter()
            .map(|s| match s {
                None => Ok(None),
                Some(b) => Ok(Some(serde_json::from_slice(&b)?)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    fn run_world<F>(size: usize, f: F) -> Vec<Vec<Option<Vec<u8>>>>
    where
        F: Fn(&mut Comm) -> Vec<Option<Vec<u8>>> + Send + Sync + Copy + 'static,
    {
        let handles = Comm::in_process_world(size, &TEST_TID)
            .into_iter()
            .map(|mut c| std::thread::spawn(move || f(&mut c)))
            .collect::<Vec<_>>();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn local_world_gathers_itself() {
        let mut c = Comm::local(&TEST_TID);
        let g = c.gather(vec![1, 2], Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(g, vec![Some(vec![1, 2])]);
        assert!(c.barrier(Duration::from_millis(10)).unwrap().is_empty());
        assert_eq!(c.allgather(vec![3], Duration::from_millis(10)).unwrap(), vec![Some(vec![3])]);
    }

    #[test]
    fn allgather_reaches_everyone() {
        let results = run_world(4, |c| {
            c.allgather(vec![c.rank() as u8], Duration::from_secs(5)).unwrap()
        });
        let expected = (0..4u8).map(|r| Some(vec![r])).collect::<Vec<_>>();
        for r in results {
            assert_eq!(r, expected);
        }
    }

    #[test]
    fn silent_rank_is_reported_missing() {
        let mut world = Comm::in_process_world(3, &TEST_TID);
        let mut r1 = world.remove(1);
        let mut root = world.remove(0);
        // rank 2 never participates
        let t = std::thread::spawn(move || r1.gather(vec![7], Duration::from_secs(5)).unwrap());
        let g = root.gather(vec![0], Duration::from_millis(200)).unwrap().unwrap();
        assert!(t.join().unwrap().is_none());
        assert_eq!(g, vec![Some(vec![0]), Some(vec![7]), None]);
    }

    #[test]
    fn late_root_still_releases_waiting_ranks() {
        let mut world = Comm::in_process_world(3, &TEST_TID);
        let _silent = world.pop();
        let mut r1 = world.pop().unwrap();
        let mut root = world.pop().unwrap();
        let timeout = Duration::from_millis(300);
        let t = std::thread::spawn(move || r1.barrier(timeout));
        std::thread::sleep(Duration::from_millis(100));
        // rank 0 arrives last and then waits out rank 2
        assert_eq!(root.barrier(timeout).unwrap(), vec![2]);
        assert_eq!(t.join().unwrap().unwrap(), vec![2]);
    }

    #[test]
    fn missing_root_times_out() {
        let mut world = Comm::in_process_world(2, &TEST_TID);
        let mut r1 = world.pop().unwrap();
        let err = r1.barrier(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.to_string(), "Timed out waiting for the coordinator rank");
    }

    #[test]
    fn stale_frames_do_not_leak_into_next_collective() {
        let mut world = Comm::in_process_world(2, &TEST_TID);
        let mut r1 = world.remove(1);
        let mut root = world.remove(0);
        // root times out on the first gather, then rank 1 answers late
        let first = root.gather(vec![0], Duration::from_millis(20)).unwrap().unwrap();
        assert_eq!(first[1], None);
        r1.gather(vec![1], Duration::from_secs(1)).unwrap();
        let t = std::thread::spawn(move || r1.gather(vec![2], Duration::from_secs(1)).unwrap());
        let second = root.gather(vec![0], Duration::from_secs(1)).unwrap().unwrap();
        t.join().unwrap();
        assert_eq!(second[1], Some(vec![2]));
    }
}
