//! Handle on the result of one delegate call.

use std::cell::RefCell;
use std::hint::spin_loop;
use std::marker::PhantomData;
use std::rc::Rc;

use amsg::codec::from_bytes;
use amsg::{Backend, Communicator, Wire};
use slab::Slab;

use crate::error::{Error, Result};
use crate::full_empty::FullEmpty;

/// A call waiting for its response.
pub(crate) struct Pending {
    pub(crate) seq: u64,
    pub(crate) cell: Rc<FullEmpty<Vec<u8>>>,
}

pub(crate) type PendingTable = Rc<RefCell<Slab<Pending>>>;

/// The eventual output of a delegate call.
///
/// Dropping an unfulfilled promise abandons the call; its response is
/// discarded when it arrives.
pub struct Promise<T: Wire> {
    cell: Rc<FullEmpty<Vec<u8>>>,
    pending: PendingTable,
    key: usize,
    seq: u64,
    consumed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Wire> Promise<T> {
    pub(crate) fn new(cell: Rc<FullEmpty<Vec<u8>>>, pending: PendingTable, key: usize, seq: u64) -> Self {
        Self {
            cell,
            pending,
            key,
            seq,
            consumed: false,
            _marker: PhantomData,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.cell.is_full()
    }

    /// Takes the output if the response has arrived. Does not drive progress.
    pub fn try_take(&mut self) -> Result<Option<T>> {
        if self.consumed {
            return Err(Error::Consumed);
        }
        match self.cell.take() {
            Some(bytes) => {
                self.consumed = true;
                Ok(Some(from_bytes(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Drives the communicator until the response arrives.
    pub fn wait<B: Backend>(mut self, comm: &mut Communicator<B>) -> Result<T> {
        loop {
            if let Some(v) = self.try_take()? {
                return Ok(v);
            }
            comm.try_progress()?;
            spin_loop();
        }
    }
}

impl<T: Wire> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.consumed || self.cell.is_full() {
            return;
        }
        let mut pending = self.pending.borrow_mut();
        if pending.get(self.key).is_some_and(|p| p.seq == self.seq) {
            pending.remove(self.key);
        }
    }
}
