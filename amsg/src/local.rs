//! In-process fabric: every core is a thread of one process.
//!
//! Each core owns an inbox holding its posted receives and the sends that
//! arrived before a receive was available. A send is matched against the
//! oldest posted receive as soon as one exists, on whichever thread gets
//! there first, so matching does not depend on the receiver polling. Per
//! ordered pair of cores, delivery is FIFO.
//!
//! By default a send completes only once it has been copied into a posted
//! receive, so a receiver that stops draining its ring stalls its senders.
//! [`LocalFabric::with_eager_sends`] completes sends at once instead.

use std::collections::{HashMap, VecDeque};
use std::hint::spin_loop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{Backend, Received, Test};
use crate::error::BackendError;
use crate::geometry::Core;

struct Envelope {
    id: u64,
    source: Core,
    bytes: Box<[u8]>,
    delivered: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inbox {
    posted: VecDeque<(u64, Box<[u8]>)>,
    unexpected: VecDeque<Envelope>,
    completed: HashMap<u64, Received>,
}

impl Inbox {
    /// Rejects a message that would not fit, before anything is dequeued.
    fn check_fits(env_len: usize, source: Core, buf_len: usize) -> Result<(), BackendError> {
        if env_len > buf_len {
            return Err(BackendError::new(
                "recv",
                format!("message of {env_len} bytes from core {source} truncated by {buf_len}-byte buffer"),
            ));
        }
        Ok(())
    }

    fn deliver(&mut self, rid: u64, mut buf: Box<[u8]>, env: Envelope) {
        buf[..env.bytes.len()].copy_from_slice(&env.bytes);
        env.delivered.store(true, Ordering::Release);
        self.completed.insert(
            rid,
            Received {
                source: env.source,
                len: env.bytes.len(),
                buf,
            },
        );
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct Exchange {
    contributions: Vec<Option<Vec<Vec<u8>>>>,
    collected: usize,
}

struct Shared {
    cores: usize,
    eager: bool,
    next_id: AtomicU64,
    inboxes: Vec<Mutex<Inbox>>,
    barrier: Mutex<BarrierState>,
    exchanges: Mutex<HashMap<u64, Exchange>>,
}

/// Builder for a set of connected in-process endpoints.
#[derive(Clone)]
pub struct LocalFabric {
    shared: Arc<Shared>,
}

impl LocalFabric {
    pub fn new(cores: usize) -> Self {
        Self::build(cores, false)
    }

    /// Sends complete immediately instead of waiting for a matching receive.
    pub fn with_eager_sends(self) -> Self {
        Self::build(self.shared.cores, true)
    }

    fn build(cores: usize, eager: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                cores,
                eager,
                next_id: AtomicU64::new(1),
                inboxes: (0..cores).map(|_| Mutex::new(Inbox::default())).collect(),
                barrier: Mutex::new(BarrierState::default()),
                exchanges: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cores(&self) -> usize {
        self.shared.cores
    }

    /// The endpoint for `core`. Each core must use exactly one endpoint.
    pub fn endpoint(&self, core: Core) -> LocalBackend {
        assert!(core < self.shared.cores, "core {core} out of range");
        LocalBackend {
            shared: Arc::clone(&self.shared),
            rank: core,
            collective_seq: 0,
        }
    }

    /// One endpoint per core, in core order.
    pub fn endpoints(&self) -> Vec<LocalBackend> {
        (0..self.shared.cores).map(|c| self.endpoint(c)).collect()
    }
}

/// One core's view of a [`LocalFabric`].
pub struct LocalBackend {
    shared: Arc<Shared>,
    rank: Core,
    collective_seq: u64,
}

/// Pending in-process send.
#[derive(Debug)]
pub struct LocalSend {
    id: u64,
    dest: Core,
    delivered: Arc<AtomicBool>,
}

/// Posted in-process receive.
#[derive(Debug)]
pub struct LocalRecv {
    id: u64,
}

/// Entered in-process barrier.
#[derive(Debug)]
pub struct LocalBarrier {
    generation: u64,
}

impl LocalBackend {
    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deposits this core's contribution and waits for all others.
    fn exchange(&mut self, mine: Vec<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
        let seq = self.collective_seq;
        self.collective_seq += 1;
        let cores = self.shared.cores;
        {
            let mut board = self.shared.exchanges.lock();
            let ex = board.entry(seq).or_insert_with(|| Exchange {
                contributions: vec![None; cores],
                collected: 0,
            });
            ex.contributions[self.rank] = Some(mine);
        }
        loop {
            {
                let mut board = self.shared.exchanges.lock();
                if let Some(ex) = board.get_mut(&seq)
                    && ex.contributions.iter().all(Option::is_some)
                {
                    let all: Vec<Vec<Vec<u8>>> = ex.contributions.iter().flatten().cloned().collect();
                    ex.collected += 1;
                    if ex.collected == cores {
                        board.remove(&seq);
                    }
                    return all;
                }
            }
            spin_loop();
            std::thread::yield_now();
        }
    }
}

impl Backend for LocalBackend {
    type Send = LocalSend;
    type Recv = LocalRecv;
    type Barrier = LocalBarrier;

    fn rank(&self) -> Core {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.cores
    }

    fn isend(&mut self, dest: Core, buf: Box<[u8]>) -> Result<LocalSend, BackendError> {
        if dest >= self.shared.cores {
            return Err(BackendError::new("isend", format!("no such core {dest}")));
        }
        let id = self.next_id();
        let delivered = Arc::new(AtomicBool::new(self.shared.eager));
        let env = Envelope {
            id,
            source: self.rank,
            bytes: buf,
            delivered: Arc::clone(&delivered),
        };
        let mut inbox = self.shared.inboxes[dest].lock();
        if let Some((_, rbuf)) = inbox.posted.front() {
            Inbox::check_fits(env.bytes.len(), env.source, rbuf.len())?;
        }
        match inbox.posted.pop_front() {
            Some((rid, rbuf)) => inbox.deliver(rid, rbuf, env),
            None => inbox.unexpected.push_back(env),
        }
        Ok(LocalSend { id, dest, delivered })
    }

    fn test_send(&mut self, req: LocalSend) -> Result<Test<(), LocalSend>, BackendError> {
        if req.delivered.load(Ordering::Acquire) {
            Ok(Test::Complete(()))
        } else {
            Ok(Test::Pending(req))
        }
    }

    fn cancel_send(&mut self, req: LocalSend) -> Result<(), BackendError> {
        let mut inbox = self.shared.inboxes[req.dest].lock();
        inbox.unexpected.retain(|e| e.id != req.id);
        Ok(())
    }

    fn post_recv(&mut self, buf: Box<[u8]>) -> Result<LocalRecv, BackendError> {
        let id = self.next_id();
        let mut inbox = self.shared.inboxes[self.rank].lock();
        if let Some(env) = inbox.unexpected.front() {
            Inbox::check_fits(env.bytes.len(), env.source, buf.len())?;
        }
        match inbox.unexpected.pop_front() {
            Some(env) => inbox.deliver(id, buf, env),
            None => inbox.posted.push_back((id, buf)),
        }
        Ok(LocalRecv { id })
    }

    fn test_recv(&mut self, req: LocalRecv) -> Result<Test<Received, LocalRecv>, BackendError> {
        let mut inbox = self.shared.inboxes[self.rank].lock();
        Ok(match inbox.completed.remove(&req.id) {
            Some(r) => Test::Complete(r),
            None => Test::Pending(req),
        })
    }

    fn cancel_recv(&mut self, req: LocalRecv) -> Result<Box<[u8]>, BackendError> {
        let mut inbox = self.shared.inboxes[self.rank].lock();
        if let Some(pos) = inbox.posted.iter().position(|(id, _)| *id == req.id)
            && let Some((_, buf)) = inbox.posted.remove(pos)
        {
            return Ok(buf);
        }
        inbox
            .completed
            .remove(&req.id)
            .map(|r| r.buf)
            .ok_or_else(|| BackendError::new("cancel_recv", format!("unknown receive {}", req.id)))
    }

    fn barrier(&mut self) -> Result<(), BackendError> {
        let mut req = self.barrier_notify()?;
        loop {
            match self.barrier_try(req)? {
                Test::Complete(()) => return Ok(()),
                Test::Pending(r) => req = r,
            }
            spin_loop();
            std::thread::yield_now();
        }
    }

    fn barrier_notify(&mut self) -> Result<LocalBarrier, BackendError> {
        let mut state = self.shared.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.cores {
            state.arrived = 0;
            state.generation += 1;
        }
        Ok(LocalBarrier { generation })
    }

    fn barrier_try(&mut self, req: LocalBarrier) -> Result<Test<(), LocalBarrier>, BackendError> {
        if self.shared.barrier.lock().generation > req.generation {
            Ok(Test::Complete(()))
        } else {
            Ok(Test::Pending(req))
        }
    }

    fn all_gather(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self
            .exchange(vec![mine.to_vec()])
            .into_iter()
            .map(|mut c| c.swap_remove(0))
            .collect())
    }

    fn all_to_all(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, BackendError> {
        if outgoing.len() != self.shared.cores {
            return Err(BackendError::new(
                "all_to_all",
                format!("{} chunks for {} cores", outgoing.len(), self.shared.cores),
            ));
        }
        let rank = self.rank;
        Ok(self
            .exchange(outgoing.to_vec())
            .into_iter()
            .map(|mut c| std::mem::take(&mut c[rank]))
            .collect())
    }

    fn all_reduce_max(&mut self, value: u64) -> Result<u64, BackendError> {
        let all = self.exchange(vec![value.to_le_bytes().to_vec()]);
        Ok(all.iter().map(|c| decode_u64(&c[0])).max().unwrap_or(value))
    }

    fn all_reduce_min(&mut self, value: u64) -> Result<u64, BackendError> {
        let all = self.exchange(vec![value.to_le_bytes().to_vec()]);
        Ok(all.iter().map(|c| decode_u64(&c[0])).min().unwrap_or(value))
    }
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(b)
}
