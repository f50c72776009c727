//! Delegate calls: run an operation on another core and get its output back.
//!
//! A request carries a 16-byte tag `(slot, sequence)` as payload and the
//! encoded operation as trailing bytes. The target runs the registered
//! function and replies with the same tag and the encoded output. The slot
//! indexes this core's pending table; the sequence number tells a late
//! response to an abandoned call from one for the slot's next occupant.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use amsg::codec::{Reader, from_bytes, to_bytes};
use amsg::{Backend, Communicator, Core, HandlerId, Wire};
use slab::Slab;
use tracing::{trace, warn};

use crate::error::Result;
use crate::full_empty::FullEmpty;
use crate::promise::{Pending, PendingTable, Promise};

/// An operation that can be delegated to another core.
pub trait DelegateOp: Wire + 'static {
    type Output: Wire + 'static;
}

/// Handle naming a registered delegate operation.
pub struct DelegateId<Op> {
    request: HandlerId,
    _marker: PhantomData<fn(Op)>,
}

impl<Op> Clone for DelegateId<Op> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Op> Copy for DelegateId<Op> {}

impl<Op> std::fmt::Debug for DelegateId<Op> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DelegateId").field(&self.request).finish()
    }
}

fn tag(key: usize, seq: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&(key as u64).to_le_bytes());
    buf[8..].copy_from_slice(&seq.to_le_bytes());
    buf
}

fn read_tag(payload: &[u8]) -> amsg::Result<(usize, u64)> {
    let mut r = Reader::new(payload);
    let key = u64::decode(&mut r)? as usize;
    let seq = u64::decode(&mut r)?;
    Ok((key, seq))
}

/// Per-core delegate state.
pub struct Delegates {
    pending: PendingTable,
    response: HandlerId,
    next_seq: Cell<u64>,
}

impl Delegates {
    /// Registers the response handler. Must be called in the same order on
    /// every core, while the communicator is still initializing.
    pub fn new<B: Backend>(comm: &mut Communicator<B>) -> Result<Self> {
        let pending: PendingTable = Rc::new(RefCell::new(Slab::new()));
        let table = Rc::clone(&pending);
        let response = comm.register(move |_, source, payload, output| {
            let (key, seq) = read_tag(payload)?;
            let mut table = table.borrow_mut();
            match table.get(key) {
                Some(p) if p.seq == seq => {
                    let p = table.remove(key);
                    // A fresh cell per call; it cannot already be full.
                    let _ = p.cell.fill(output.to_vec());
                    trace!(source, key, seq, "delegate response");
                }
                _ => warn!(source, key, seq, "dropping response to abandoned delegate call"),
            }
            Ok(())
        })?;
        Ok(Self {
            pending,
            response,
            next_seq: Cell::new(0),
        })
    }

    /// Registers `f` as the implementation of `Op` on this core.
    pub fn register<B, Op, F>(&self, comm: &mut Communicator<B>, mut f: F) -> Result<DelegateId<Op>>
    where
        B: Backend,
        Op: DelegateOp,
        F: FnMut(Op) -> Op::Output + 'static,
    {
        let response = self.response;
        let request = comm.register(move |out, source, tag, op| {
            let op = from_bytes::<Op>(op)?;
            let output = f(op);
            out.send_raw(source, response, tag, &to_bytes(&output))
        })?;
        Ok(DelegateId {
            request,
            _marker: PhantomData,
        })
    }

    /// Sends `op` to `core` and returns a promise for its output.
    ///
    /// Calls to this core take the same path through the transport.
    pub fn call<B, Op>(
        &self,
        comm: &mut Communicator<B>,
        core: Core,
        id: DelegateId<Op>,
        op: &Op,
    ) -> Result<Promise<Op::Output>>
    where
        B: Backend,
        Op: DelegateOp,
    {
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        let cell = Rc::new(FullEmpty::new());
        let key = self.pending.borrow_mut().insert(Pending {
            seq,
            cell: Rc::clone(&cell),
        });
        if let Err(e) = comm.send_raw(core, id.request, &tag(key, seq), &to_bytes(op)) {
            self.pending.borrow_mut().try_remove(key);
            return Err(e.into());
        }
        Ok(Promise::new(cell, Rc::clone(&self.pending), key, seq))
    }

    /// Calls whose responses have not arrived yet.
    pub fn outstanding(&self) -> usize {
        self.pending.borrow().len()
    }
}
