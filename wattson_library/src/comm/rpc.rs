//! gRPC transport between processes.
//!
//! Rank 0 runs a [WattsonCoordinator] service on its own small runtime. Frames it receives are handed
//! to the collective waiting in [super::Comm]; answers it publishes are kept until the other ranks fetch them.
//! Collectives are blocking calls, so every RPC is spawned on the transport's runtime and awaited from
//! the calling thread, which may itself be a worker of another runtime.

use super::{Frame, Mailbox, Transport, ROOT};
use crate::bail_error;
use crate::clock::now;
use crate::rpc::wattson_coordinator_client::WattsonCoordinatorClient;
use crate::rpc::wattson_coordinator_server::{WattsonCoordinator, WattsonCoordinatorServer};
use crate::rpc::{Ack, BarrierRequest, BroadcastRequest, Envelope, JoinRequest, JoinResponse, RPCError};
use crate::transaction::TransactionId;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{oneshot, Notify};
use tonic::transport::{Channel, Server};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, warn};

const JOIN_POLL: Duration = Duration::from_millis(10);
const CONNECT_RETRY: Duration = Duration::from_millis(50);
/// Extra time on top of a server-side wait before the client gives up on the call itself.
const CALL_SLACK: Duration = Duration::from_millis(500);
/// Published answers older than this many collectives are dropped.
const KEEP_RELEASED: u64 = 16;

fn runtime(name: &str, threads: usize) -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(name)
        .enable_all()
        .build()?)
}

/// Run `fut` on `handle` and block this thread until it finishes.
fn block_on<F, T>(handle: &Handle, fut: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = channel();
    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    match rx.recv() {
        Ok(v) => Ok(v),
        Err(_) => anyhow::bail!("RPC task ended without a result"),
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    match addr.to_socket_addrs()?.next() {
        Some(a) => Ok(a),
        None => anyhow::bail!("Coordinator address '{}' did not resolve", addr),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// State shared between the service and rank 0's [Comm](super::Comm).
struct Coordinator {
    size: usize,
    inbox: Mutex<Sender<Frame>>,
    joined: Mutex<BTreeSet<usize>>,
    released: Mutex<BTreeMap<u64, Vec<u8>>>,
    notify: Notify,
    tid: TransactionId,
}

impl Coordinator {
    fn rank(&self, rank: u64, call: &str) -> Result<usize, Status> {
        match usize::try_from(rank) {
            Ok(r) if r != ROOT && r < self.size => Ok(r),
            _ => {
                warn!(tid=self.tid, rank=rank, size=self.size, call=call, "Rejecting call from a rank outside the world");
                Err(Status::invalid_argument(format!(
                    "Rank {} is not a client rank of a world of {}",
                    rank, self.size
                )))
            },
        }
    }

    fn deliver(&self, frame: Frame) -> Result<(), Status> {
        match self.inbox.lock().send(frame) {
            Ok(_) => Ok(()),
            Err(_) => Err(Status::unavailable("Coordinator rank has stopped collecting")),
        }
    }

    fn release(&self, seq: u64, body: Vec<u8>) {
        let mut released = self.released.lock();
        released.insert(seq, body);
        released.retain(|s, _| s + KEEP_RELEASED >= seq);
        drop(released);
        self.notify.notify_waiters();
    }

    async fn released(&self, seq: u64, wait: Duration) -> Result<Vec<u8>, Status> {
        let fetch = async {
            loop {
                let notified = self.notify.notified();
                let ready = self.released.lock().get(&seq).cloned();
                if let Some(body) = ready {
                    return body;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(wait, fetch).await {
            Ok(body) => Ok(body),
            Err(_) => Err(Status::deadline_exceeded(format!("Collective {} was not answered in time", seq))),
        }
    }
}

#[tonic::async_trait]
impl WattsonCoordinator for Coordinator {
    async fn join(&self, request: Request<JoinRequest>) -> Result<Response<JoinResponse>, Status> {
        let req = request.into_inner();
        if req.world_size != self.size as u64 {
            warn!(tid=self.tid, rank=req.rank, theirs=req.world_size, ours=self.size, "Rank disagrees on the world size");
            return Err(Status::failed_precondition(format!(
                "World size {} does not match the coordinator's {}",
                req.world_size, self.size
            )));
        }
        let rank = self.rank(req.rank, "join")?;
        if !self.joined.lock().insert(rank) {
            warn!(tid=self.tid, rank=rank, "Rank joined twice");
        }
        debug!(tid=self.tid, rank=rank, peer_tid=%req.transaction_id, "Rank joined");
        Ok(Response::new(JoinResponse {
            world_size: self.size as u64,
        }))
    }

    async fn gather(&self, request: Request<Envelope>) -> Result<Response<Ack>, Status> {
        let env = request.into_inner();
        let src = self.rank(env.src, "gather")?;
        self.deliver(Frame {
            seq: env.seq,
            src,
            body: env.body,
        })?;
        Ok(Response::new(Ack {}))
    }

    async fn broadcast(&self, request: Request<BroadcastRequest>) -> Result<Response<Envelope>, Status> {
        let req = request.into_inner();
        self.rank(req.rank, "broadcast")?;
        let body = self.released(req.seq, Duration::from_millis(req.timeout_ms)).await?;
        Ok(Response::new(Envelope {
            seq: req.seq,
            src: ROOT as u64,
            body,
        }))
    }

    async fn barrier(&self, request: Request<BarrierRequest>) -> Result<Response<Envelope>, Status> {
        let req = request.into_inner();
        let src = self.rank(req.rank, "barrier")?;
        self.deliver(Frame {
            seq: req.seq,
            src,
            body: vec![],
        })?;
        let body = self.released(req.seq, Duration::from_millis(req.timeout_ms)).await?;
        Ok(Response::new(Envelope {
            seq: req.seq,
            src: ROOT as u64,
            body,
        }))
    }
}

/// Rank 0: serves the coordinator and collects what arrives.
pub(super) struct RpcRoot {
    state: Arc<Coordinator>,
    mailbox: Mailbox,
    shutdown: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
    tid: TransactionId,
}

impl RpcRoot {
    /// Serve on `addr` and wait up to `timeout` for the other ranks to join.
    pub(super) fn serve(size: usize, addr: &str, timeout: Duration, tid: &TransactionId) -> Result<Self> {
        let sock = match resolve(addr) {
            Ok(s) => s,
            Err(e) => bail_error!(tid=tid, error=%e, addr=addr, "Invalid coordinator address"),
        };
        let runtime = runtime("wattson-coordinator", 2)?;
        let (tx, rx) = channel();
        let state = Arc::new(Coordinator {
            size,
            inbox: Mutex::new(tx),
            joined: Mutex::new(BTreeSet::new()),
            released: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            tid: tid.clone(),
        });
        let service = WattsonCoordinatorServer::from_arc(state.clone())
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (failed_tx, failed_rx) = channel();
        let t = tid.clone();
        runtime.spawn(async move {
            let served = Server::builder()
                .add_service(service)
                .serve_with_shutdown(sock, async {
                    let _ = stop_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!(tid=t, error=%e, "Coordinator service stopped");
                let _ = failed_tx.send(e.to_string());
            }
        });

        let start = now();
        loop {
            if let Ok(e) = failed_rx.try_recv() {
                runtime.shutdown_background();
                bail_error!(tid=tid, error=%e, addr=addr, "Coordinator failed to serve");
            }
            let joined = state.joined.lock().len();
            if joined + 1 >= size {
                debug!(tid=tid, size=size, "Every rank joined");
                break;
            }
            if start.elapsed() >= timeout {
                warn!(tid=tid, joined=joined + 1, expected=size, "Not every rank joined before the timeout");
                break;
            }
            std::thread::sleep(JOIN_POLL);
        }
        Ok(RpcRoot {
            state,
            mailbox: Mailbox::new(rx),
            shutdown: Some(stop_tx),
            runtime: Some(runtime),
            tid: tid.clone(),
        })
    }
}

impl Transport for RpcRoot {
    fn recv_any(&mut self, seq: u64, deadline: Instant) -> Option<Frame> {
        self.mailbox.next(seq, deadline, &self.tid)
    }
    fn publish(&mut self, frame: Frame, _size: usize) {
        self.state.release(frame.seq, frame.body);
    }
    fn send_root(&mut self, _frame: Frame, _deadline: Instant) -> Result<()> {
        anyhow::bail!("Rank 0 does not send to itself")
    }
    fn recv_root(&mut self, _seq: u64, _deadline: Instant) -> Result<Option<Frame>> {
        Ok(None)
    }
}

impl Drop for RpcRoot {
    fn drop(&mut self) {
        if let Some(s) = self.shutdown.take() {
            let _ = s.send(());
        }
        // may be dropped from inside another runtime, where a blocking shutdown would panic
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

/// Every rank but 0: a client of the coordinator.
pub(super) struct RpcRank {
    rank: usize,
    client: WattsonCoordinatorClient<Channel>,
    runtime: Option<Runtime>,
    tid: TransactionId,
}

impl RpcRank {
    /// Dial the coordinator until it answers or `timeout` passes, then join.
    pub(super) fn connect(rank: usize, size: usize, addr: &str, timeout: Duration, tid: &TransactionId) -> Result<Self> {
        let runtime = runtime("wattson-rank", 1)?;
        let endpoint = format!("http://{}", addr);
        let t = tid.clone();
        let client = block_on(runtime.handle(), async move {
            let start = now();
            loop {
                match WattsonCoordinatorClient::connect(endpoint.clone()).await {
                    Ok(c) => return Ok(c),
                    Err(e) => {
                        if start.elapsed() >= timeout {
                            bail_error!(tid=t, error=%e, addr=%endpoint, "Could not reach coordinator rank");
                        }
                        tokio::time::sleep(CONNECT_RETRY).await;
                    },
                }
            }
        })??
        .max_decoding_message_size(usize::MAX)
        .max_encoding_message_size(usize::MAX);

        let mut c = client.clone();
        let req = JoinRequest {
            rank: rank as u64,
            world_size: size as u64,
            transaction_id: tid.clone(),
        };
        match block_on(runtime.handle(), async move { c.join(Request::new(req)).await })? {
            Ok(_) => debug!(tid=tid, rank=rank, addr=addr, "Joined coordinator"),
            Err(s) => {
                let e = RPCError::new(s, "[Comm:join]");
                bail_error!(tid=tid, error=%e, rank=rank, "Coordinator refused this rank");
            },
        }
        Ok(RpcRank {
            rank,
            client,
            runtime: Some(runtime),
            tid: tid.clone(),
        })
    }

    fn handle(&self) -> Result<Handle> {
        match &self.runtime {
            Some(rt) => Ok(rt.handle().clone()),
            None => anyhow::bail!("Transport already shut down"),
        }
    }

    /// Outcome of a call that waits on rank 0: `None` when rank 0 did not answer before `deadline`.
    fn answer(&self, res: Option<Result<Response<Envelope>, Status>>, source: &str) -> Result<Option<Frame>> {
        match res {
            Some(Ok(r)) => {
                let env = r.into_inner();
                Ok(Some(Frame {
                    seq: env.seq,
                    src: ROOT,
                    body: env.body,
                }))
            },
            Some(Err(s)) if s.code() == Code::DeadlineExceeded => Ok(None),
            Some(Err(s)) => {
                let e = RPCError::new(s, source);
                bail_error!(tid=self.tid, error=%e, rank=self.rank, "Coordinator call failed")
            },
            None => Ok(None),
        }
    }
}

impl Transport for RpcRank {
    fn recv_any(&mut self, _seq: u64, _deadline: Instant) -> Option<Frame> {
        None
    }
    fn publish(&mut self, _frame: Frame, _size: usize) {}

    fn send_root(&mut self, frame: Frame, deadline: Instant) -> Result<()> {
        let mut c = self.client.clone();
        let wait = deadline.saturating_duration_since(now());
        let env = Envelope {
            seq: frame.seq,
            src: frame.src as u64,
            body: frame.body,
        };
        let res = block_on(&self.handle()?, async move {
            tokio::time::timeout(wait + CALL_SLACK, c.gather(Request::new(env))).await
        })?;
        match res {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(s)) => {
                let e = RPCError::new(s, "[Comm:gather]");
                bail_error!(tid=self.tid, error=%e, rank=self.rank, "Handing data to the coordinator rank failed")
            },
            Err(_) => bail_error!(tid=self.tid, rank=self.rank, "Coordinator rank did not accept data in time"),
        }
    }

    fn recv_root(&mut self, seq: u64, deadline: Instant) -> Result<Option<Frame>> {
        let mut c = self.client.clone();
        let wait = deadline.saturating_duration_since(now());
        let req = BroadcastRequest {
            seq,
            rank: self.rank as u64,
            timeout_ms: millis(wait),
        };
        let res = block_on(&self.handle()?, async move {
            tokio::time::timeout(wait + CALL_SLACK, c.broadcast(Request::new(req))).await.ok()
        })?;
        self.answer(res, "[Comm:broadcast]")
    }

    fn arrive(&mut self, arrival: Frame, deadline: Instant) -> Result<Option<Frame>> {
        let mut c = self.client.clone();
        let wait = deadline.saturating_duration_since(now());
        let req = BarrierRequest {
            seq: arrival.seq,
            rank: self.rank as u64,
            timeout_ms: millis(wait),
        };
        let res = block_on(&self.handle()?, async move {
            tokio::time::timeout(wait + CALL_SLACK, c.barrier(Request::new(req))).await.ok()
        })?;
        self.answer(res, "[Comm:barrier]")
    }
}

impl Drop for RpcRank {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Comm;
    use super::*;
    use crate::transaction::TEST_TID;

    fn free_addr() -> String {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    }

    #[test]
    fn tcp_world_allgathers() {
        let addr = free_addr();
        let handles = (0..3)
            .map(|rank| {
                let addr = addr.clone();
                std::thread::spawn(move || {
                    let mut c = Comm::tcp(rank, 3, &addr, Duration::from_secs(10), &TEST_TID).unwrap();
                    let all = c.allgather_json(&format!("rank-{}", rank), Duration::from_secs(10)).unwrap();
                    let gathered = c.gather_json(&rank, Duration::from_secs(10)).unwrap();
                    (all, gathered)
                })
            })
            .collect::<Vec<_>>();
        for (rank, h) in handles.into_iter().enumerate() {
            let (all, gathered): (Vec<Option<String>>, Option<Vec<Option<usize>>>) = h.join().unwrap();
            assert_eq!(
                all,
                vec![Some("rank-0".to_string()), Some("rank-1".to_string()), Some("rank-2".to_string())]
            );
            match rank {
                0 => assert_eq!(gathered, Some(vec![Some(0), Some(1), Some(2)])),
                _ => assert_eq!(gathered, None),
            }
        }
    }

    #[test]
    fn tcp_lost_rank_reported_to_everyone() {
        let addr = free_addr();
        let join = Duration::from_millis(200);
        let timeout = Duration::from_secs(1);
        let a = addr.clone();
        let r1 = std::thread::spawn(move || {
            let mut c = Comm::tcp(1, 3, &a, Duration::from_secs(5), &TEST_TID).unwrap();
            let lost = c.barrier(timeout).unwrap();
            let inventories = c.allgather_json(&1usize, timeout).unwrap();
            (lost, inventories)
        });
        // rank 2 never starts, and rank 0 reaches the barrier well after rank 1
        let mut root = Comm::tcp(0, 3, &addr, join, &TEST_TID).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(root.barrier(timeout).unwrap(), vec![2]);
        let seen = root.allgather_json(&0usize, timeout).unwrap();
        assert_eq!(seen, vec![Some(0), Some(1), None]);

        let (lost, inventories) = r1.join().unwrap();
        assert_eq!(lost, vec![2]);
        assert_eq!(inventories, seen);
    }

    #[test]
    fn bad_join_does_not_abort_setup() {
        let addr = free_addr();
        let a = addr.clone();
        let root = std::thread::spawn(move || {
            let mut c = Comm::tcp(0, 2, &a, Duration::from_secs(10), &TEST_TID).unwrap();
            c.barrier(Duration::from_secs(5)).unwrap()
        });

        let err = match Comm::tcp(7, 2, &addr, Duration::from_secs(5), &TEST_TID) {
            Ok(_) => panic!("rank outside the world was accepted"),
            Err(e) => e,
        };
        assert_eq!(err.to_string(), "Coordinator refused this rank");
        assert!(Comm::tcp(1, 3, &addr, Duration::from_secs(5), &TEST_TID).is_err());

        let mut r1 = Comm::tcp(1, 2, &addr, Duration::from_secs(5), &TEST_TID).unwrap();
        assert!(r1.barrier(Duration::from_secs(5)).unwrap().is_empty());
        assert!(root.join().unwrap().is_empty());
    }

    #[test]
    fn unreachable_coordinator_fails() {
        let addr = free_addr();
        let err = match Comm::tcp(1, 2, &addr, Duration::from_millis(200), &TEST_TID) {
            Ok(_) => panic!("connected to nothing"),
            Err(e) => e,
        };
        assert_eq!(err.to_string(), "Could not reach coordinator rank");
    }
}
