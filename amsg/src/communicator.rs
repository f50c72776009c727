//! The per-core active-message communicator.
//!
//! A [`Communicator`] owns the backend, the two context rings and the
//! handler table. It moves through three phases: after [`init`] handlers are
//! registered; [`activate`] arms the receive ring and opens communication;
//! [`finish`] cancels everything still in flight.
//!
//! [`init`]: Communicator::init
//! [`activate`]: Communicator::activate
//! [`finish`]: Communicator::finish

use std::hint::spin_loop;

use tracing::{debug, info, trace};

use crate::backend::{Backend, Received, Test};
use crate::codec::{Frame, FrameBuilder, Wire};
use crate::config::CommConfig;
use crate::context::{Callback, RecvRing, SendRing};
use crate::error::{BackendError, Error, Result};
use crate::geometry::{Core, Geometry, Locale};
use crate::handler::{HandlerId, MessageId, Registry};
use crate::site::{Environment, SiteAdapter, detect_site};

/// Lifecycle phase of a communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Handlers may be registered; no messages flow.
    Init,
    /// Receive ring armed; messages flow.
    Active,
    /// Torn down.
    Finished,
}

/// Per-core message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    /// Sends that found no free context and had to spin.
    pub send_stalls: u64,
    /// Send contexts returned to the free stack by garbage collection.
    pub gc_reclaimed: u64,
}

enum Dest {
    One(Core),
    All,
}

/// Send half of a communicator: backend, send ring and counters.
pub(crate) struct Tx<B: Backend> {
    backend: B,
    ring: SendRing<B::Send>,
    stats: Stats,
    rank: Core,
    cores: usize,
    max_frame: usize,
}

impl<B: Backend> Tx<B> {
    fn garbage_collect(&mut self) -> Result<usize> {
        let n = self.ring.garbage_collect(&mut self.backend)?;
        self.stats.gc_reclaimed += n as u64;
        Ok(n)
    }

    /// Spins on garbage collection until a send context is free.
    fn wait_for_context(&mut self) -> Result<()> {
        if self.ring.has_free() {
            return Ok(());
        }
        self.stats.send_stalls += 1;
        while self.garbage_collect()? == 0 {
            spin_loop();
        }
        Ok(())
    }

    fn frame(&self, handler: HandlerId, encode: impl FnOnce(FrameBuilder) -> FrameBuilder, trailing: &[u8]) -> Result<Box<[u8]>> {
        let builder = FrameBuilder::with_capacity(handler.raw(), self.rank as u32, 64 + trailing.len());
        let frame = encode(builder).finish(trailing)?;
        if frame.len() > self.max_frame {
            return Err(Error::MessageTooLarge {
                len: frame.len(),
                max: self.max_frame,
            });
        }
        Ok(frame)
    }

    fn post(&mut self, dest: Dest, frame: Box<[u8]>, callback: Option<Callback>) -> Result<()> {
        if let Dest::One(core) = dest
            && core >= self.cores
        {
            return Err(Error::InvalidCore {
                core,
                cores: self.cores,
            });
        }
        self.wait_for_context()?;
        let len = frame.len();
        let requests = match dest {
            Dest::One(core) => vec![self.backend.isend(core, frame)?],
            Dest::All => {
                let mut reqs = Vec::with_capacity(self.cores);
                for core in 0..self.cores {
                    reqs.push(self.backend.isend(core, frame.clone())?);
                }
                reqs
            }
        };
        let fanout = requests.len() as u64;
        self.stats.messages_sent += fanout;
        self.stats.bytes_sent += fanout * len as u64;
        self.ring
            .occupy(requests, len, callback)
            .map_err(|_| BackendError::new("isend", "send ring exhausted after garbage collection"))?;
        Ok(())
    }
}

/// Send access handed to handlers.
///
/// Sends issued here share the communicator's send ring. A full ring is
/// waited out by garbage collection only; receives are not polled from
/// inside a handler.
pub struct Outbox<'a, B: Backend> {
    tx: &'a mut Tx<B>,
}

impl<B: Backend> Outbox<'_, B> {
    /// The core running the handler.
    pub fn mycore(&self) -> Core {
        self.tx.rank
    }

    pub fn cores(&self) -> usize {
        self.tx.cores
    }

    pub fn send<M: Wire>(&mut self, dest: Core, id: MessageId<M>, msg: &M) -> Result<()> {
        self.send_with_trailing(dest, id, msg, &[])
    }

    pub fn send_with_trailing<M: Wire>(&mut self, dest: Core, id: MessageId<M>, msg: &M, trailing: &[u8]) -> Result<()> {
        let frame = self.tx.frame(id.handler(), |b| b.message(msg), trailing)?;
        self.tx.post(Dest::One(dest), frame, None)
    }

    pub fn send_raw(&mut self, dest: Core, handler: HandlerId, payload: &[u8], trailing: &[u8]) -> Result<()> {
        let frame = self.tx.frame(handler, |b| b.bytes(payload), trailing)?;
        self.tx.post(Dest::One(dest), frame, None)
    }

    pub fn send_with_callback<M, F>(&mut self, dest: Core, id: MessageId<M>, msg: &M, callback: F) -> Result<()>
    where
        M: Wire,
        F: FnOnce() + 'static,
    {
        let frame = self.tx.frame(id.handler(), |b| b.message(msg), &[])?;
        self.tx.post(Dest::One(dest), frame, Some(Box::new(callback)))
    }

    pub fn send_to_all<M: Wire>(&mut self, id: MessageId<M>, msg: &M) -> Result<()> {
        let frame = self.tx.frame(id.handler(), |b| b.message(msg), &[])?;
        self.tx.post(Dest::All, frame, None)
    }
}

/// Job-wide collectives usable in any phase before `finish`.
pub trait Collectives {
    fn mycore(&self) -> Core;
    fn cores(&self) -> usize;
    /// Gathers one byte string per core, indexed by core.
    fn all_gather(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>>;
    /// Sends `outgoing[j]` to core `j`; returns what each core sent here.
    fn all_to_all(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>>;
    fn barrier(&mut self) -> Result<()>;
}

/// Active-message endpoint of one core.
pub struct Communicator<B: Backend> {
    tx: Tx<B>,
    recv: RecvRing<B::Recv>,
    registry: Registry<B>,
    geometry: Geometry,
    config: CommConfig,
    phase: Phase,
    site: &'static str,
}

impl<B: Backend> Communicator<B> {
    /// Builds the communicator and agrees on locale geometry.
    ///
    /// Every core must call this collectively. Geometry errors are reported
    /// on every core, not only on the core whose launcher data was bad.
    pub fn init(
        mut backend: B,
        config: CommConfig,
        adapters: &[Box<dyn SiteAdapter>],
        env: &dyn Environment,
    ) -> Result<Self> {
        config.validate()?;
        let rank = backend.rank();
        let cores = backend.size();
        let detected = detect_site(adapters, rank, env);

        // A core that failed detection contributes 0 so the others see a
        // mismatch instead of waiting on it.
        let local_size = detected.as_ref().map_or(0, |(_, g)| g.local_size);
        let max = backend.all_reduce_max(local_size as u64)? as usize;
        let min = backend.all_reduce_min(local_size as u64)? as usize;
        let (site, local) = detected?;
        if min != max {
            return Err(Error::LocaleSizeMismatch { min, max });
        }
        let geometry = Geometry::new(cores, local.local_size)?;

        let reported = backend.all_gather(&(local.local_rank as u64).to_le_bytes())?;
        for (core, bytes) in reported.iter().enumerate() {
            let reported = bytes
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| BackendError::new("all_gather", format!("short local rank from core {core}")))?
                as usize;
            let expected = geometry.locale_core_of(core);
            if reported != expected {
                return Err(Error::NonContiguousLayout {
                    core,
                    reported,
                    expected,
                });
            }
        }

        info!(
            core = rank,
            cores,
            locale = geometry.locale_of(rank),
            locale_size = geometry.locale_size(),
            site,
            "communicator initialized"
        );
        Ok(Self {
            tx: Tx {
                backend,
                ring: SendRing::new(config.log2_send_contexts),
                stats: Stats::default(),
                rank,
                cores,
                max_frame: config.recv_buffer_size,
            },
            recv: RecvRing::new(config.log2_recv_contexts, config.recv_buffer_size),
            registry: Registry::new(),
            geometry,
            config,
            phase: Phase::Init,
            site,
        })
    }

    fn expect_phase(&self, op: &'static str, phase: Phase) -> Result<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(Error::Phase { op, phase: self.phase })
        }
    }

    pub fn register<F>(&mut self, f: F) -> Result<HandlerId>
    where
        F: FnMut(&mut Outbox<'_, B>, Core, &[u8], &[u8]) -> Result<()> + 'static,
    {
        self.expect_phase("register", Phase::Init)?;
        self.registry.register(f)
    }

    pub fn register_message<M, F>(&mut self, f: F) -> Result<MessageId<M>>
    where
        M: Wire + 'static,
        F: FnMut(&mut Outbox<'_, B>, Core, M) -> Result<()> + 'static,
    {
        self.expect_phase("register", Phase::Init)?;
        self.registry.register_message(f)
    }

    /// Arms the receive ring and waits for every core to do the same.
    pub fn activate(&mut self) -> Result<()> {
        self.expect_phase("activate", Phase::Init)?;
        self.recv.arm(&mut self.tx.backend)?;
        self.tx.backend.barrier()?;
        self.phase = Phase::Active;
        debug!(
            core = self.tx.rank,
            handlers = self.registry.len(),
            send_contexts = self.tx.ring.capacity(),
            recv_contexts = self.recv.capacity(),
            "communicator active"
        );
        Ok(())
    }

    /// Waits for a free send context, polling receives while it spins.
    fn reserve(&mut self) -> Result<()> {
        if self.tx.ring.has_free() {
            return Ok(());
        }
        self.tx.stats.send_stalls += 1;
        loop {
            self.tx.garbage_collect()?;
            if self.tx.ring.has_free() {
                return Ok(());
            }
            self.poll_received(self.config.poll_budget)?;
            spin_loop();
        }
    }

    fn outbox(&mut self) -> Outbox<'_, B> {
        Outbox { tx: &mut self.tx }
    }

    pub fn send<M: Wire>(&mut self, dest: Core, id: MessageId<M>, msg: &M) -> Result<()> {
        self.expect_phase("send", Phase::Active)?;
        self.reserve()?;
        self.outbox().send(dest, id, msg)
    }

    /// Sends `msg` followed by a raw trailing byte range.
    pub fn send_with_trailing<M: Wire>(&mut self, dest: Core, id: MessageId<M>, msg: &M, trailing: &[u8]) -> Result<()> {
        self.expect_phase("send", Phase::Active)?;
        self.reserve()?;
        self.outbox().send_with_trailing(dest, id, msg, trailing)
    }

    /// Sends pre-encoded payload bytes to a raw handler.
    pub fn send_raw(&mut self, dest: Core, handler: HandlerId, payload: &[u8], trailing: &[u8]) -> Result<()> {
        self.expect_phase("send", Phase::Active)?;
        self.reserve()?;
        self.outbox().send_raw(dest, handler, payload, trailing)
    }

    /// Sends `msg`; `callback` runs once the send context completes.
    pub fn send_with_callback<M, F>(&mut self, dest: Core, id: MessageId<M>, msg: &M, callback: F) -> Result<()>
    where
        M: Wire,
        F: FnOnce() + 'static,
    {
        self.expect_phase("send", Phase::Active)?;
        self.reserve()?;
        self.outbox().send_with_callback(dest, id, msg, callback)
    }

    /// Sends `msg` to every core, this one included, through one context.
    pub fn send_to_all<M: Wire>(&mut self, id: MessageId<M>, msg: &M) -> Result<()> {
        self.send_to_all_with_callback(id, msg, || {})
    }

    /// Broadcast whose callback runs once, after every destination completed.
    pub fn send_to_all_with_callback<M, F>(&mut self, id: MessageId<M>, msg: &M, callback: F) -> Result<()>
    where
        M: Wire,
        F: FnOnce() + 'static,
    {
        self.expect_phase("send", Phase::Active)?;
        self.reserve()?;
        let frame = self.tx.frame(id.handler(), |b| b.message(msg), &[])?;
        self.tx.post(Dest::All, frame, Some(Box::new(callback)))
    }

    /// Tests up to `budget` armed receives in posting order and runs their
    /// handlers. Returns the number of messages handled.
    pub fn poll(&mut self, budget: usize) -> Result<usize> {
        self.expect_phase("poll", Phase::Active)?;
        self.poll_received(budget)
    }

    fn poll_received(&mut self, budget: usize) -> Result<usize> {
        let mut handled = 0;
        while handled < budget {
            let Some(received) = self.recv.poll_head(&mut self.tx.backend)? else {
                break;
            };
            let outcome = self.dispatch(&received);
            // Re-arm before surfacing a handler error.
            self.recv.rearm(&mut self.tx.backend, received.buf)?;
            outcome?;
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch(&mut self, received: &Received) -> Result<()> {
        let frame = Frame::decode(received.bytes())?;
        self.tx.stats.messages_received += 1;
        self.tx.stats.bytes_received += received.len as u64;
        let source = frame.header.source as Core;
        trace!(
            core = self.tx.rank,
            source,
            handler = frame.header.handler,
            len = received.len,
            "dispatch"
        );
        let mut out = Outbox { tx: &mut self.tx };
        self.registry.dispatch(
            HandlerId(frame.header.handler),
            &mut out,
            source,
            frame.payload,
            frame.trailing,
        )
    }

    /// Reclaims completed send contexts. Returns how many were freed.
    pub fn garbage_collect(&mut self) -> Result<usize> {
        self.tx.garbage_collect()
    }

    /// One round of progress: garbage collection, then a default-budget poll.
    pub fn try_progress(&mut self) -> Result<usize> {
        self.expect_phase("try_progress", Phase::Active)?;
        self.tx.garbage_collect()?;
        self.poll_received(self.config.poll_budget)
    }

    /// Enters a barrier without waiting.
    pub fn barrier_notify(&mut self) -> Result<B::Barrier> {
        Ok(self.tx.backend.barrier_notify()?)
    }

    pub fn barrier_try(&mut self, req: B::Barrier) -> Result<Test<(), B::Barrier>> {
        Ok(self.tx.backend.barrier_try(req)?)
    }

    /// Blocking barrier. While active, handlers keep running until every
    /// core has arrived.
    pub fn barrier(&mut self) -> Result<()> {
        match self.phase {
            Phase::Init => Ok(self.tx.backend.barrier()?),
            Phase::Finished => Err(Error::Phase {
                op: "barrier",
                phase: self.phase,
            }),
            Phase::Active => {
                let mut req = self.tx.backend.barrier_notify()?;
                loop {
                    self.tx.garbage_collect()?;
                    self.poll_received(self.config.poll_budget)?;
                    match self.tx.backend.barrier_try(req)? {
                        Test::Complete(()) => return Ok(()),
                        Test::Pending(r) => req = r,
                    }
                    spin_loop();
                }
            }
        }
    }

    /// Cancels outstanding sends and receives.
    ///
    /// Collective. Messages still in flight are dropped; quiesce first.
    pub fn finish(&mut self) -> Result<()> {
        if self.phase == Phase::Finished {
            return Err(Error::Phase {
                op: "finish",
                phase: self.phase,
            });
        }
        let sends = self.tx.ring.cancel_all(&mut self.tx.backend)?;
        self.tx.backend.barrier()?;
        let recvs = self.recv.cancel_all(&mut self.tx.backend)?;
        self.tx.backend.barrier()?;
        self.phase = Phase::Finished;
        debug!(core = self.tx.rank, sends, recvs, stats = ?self.tx.stats, "communicator finished");
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> Stats {
        self.tx.stats
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn mycore(&self) -> Core {
        self.tx.rank
    }

    pub fn cores(&self) -> usize {
        self.tx.cores
    }

    pub fn locale(&self) -> Locale {
        self.geometry.locale_of(self.tx.rank)
    }

    /// This core's index within its locale.
    pub fn locale_core(&self) -> usize {
        self.geometry.locale_core_of(self.tx.rank)
    }

    pub fn locale_size(&self) -> usize {
        self.geometry.locale_size()
    }

    pub fn locales(&self) -> usize {
        self.geometry.locales()
    }

    /// Name of the site adapter that reported this core's geometry.
    pub fn site(&self) -> &'static str {
        self.site
    }

    /// Receives currently posted. Constant while active.
    pub fn armed_receives(&self) -> usize {
        self.recv.armed()
    }

    pub fn free_send_contexts(&self) -> usize {
        self.tx.ring.free_count()
    }

    pub fn backend(&self) -> &B {
        &self.tx.backend
    }
}

impl<B: Backend> Collectives for Communicator<B> {
    fn mycore(&self) -> Core {
        self.tx.rank
    }

    fn cores(&self) -> usize {
        self.tx.cores
    }

    fn all_gather(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>> {
        if self.phase == Phase::Finished {
            return Err(Error::Phase {
                op: "all_gather",
                phase: self.phase,
            });
        }
        Ok(self.tx.backend.all_gather(mine)?)
    }

    fn all_to_all(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        if self.phase == Phase::Finished {
            return Err(Error::Phase {
                op: "all_to_all",
                phase: self.phase,
            });
        }
        Ok(self.tx.backend.all_to_all(outgoing)?)
    }

    fn barrier(&mut self) -> Result<()> {
        Communicator::barrier(self)
    }
}
