//! Send and receive context rings.
//!
//! Sends and receives use separate fixed-capacity rings, so a burst of
//! outbound traffic can never starve the receive side and vice versa.
//!
//! A send context may cover several requests (one per destination of a
//! broadcast); its reference count is the number still in flight and its
//! callback runs once, when the count reaches zero. Free send contexts form
//! a LIFO stack so the most recently used (cache-warm) slot is reused first.
//!
//! Receive contexts are posted in slot order and re-posted in the same
//! order, so the oldest posted receive is always at the ring head.

use tracing::trace;

use crate::backend::{Backend, Received, Test};
use crate::error::Result;

/// Completion callback of a send context.
pub type Callback = Box<dyn FnOnce()>;

/// One in-flight send (possibly fanned out to several destinations).
pub struct SendContext<R> {
    pending: Vec<Option<R>>,
    reference_count: usize,
    len: usize,
    callback: Option<Callback>,
}

impl<R> SendContext<R> {
    fn empty() -> Self {
        Self {
            pending: Vec::new(),
            reference_count: 0,
            len: 0,
            callback: None,
        }
    }

    /// Requests still outstanding.
    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity pool of send contexts.
pub struct SendRing<R> {
    slots: Vec<SendContext<R>>,
    free: Vec<usize>,
}

impl<R> SendRing<R> {
    pub fn new(log2_capacity: u32) -> Self {
        let capacity = 1usize << log2_capacity;
        Self {
            slots: (0..capacity).map(|_| SendContext::empty()).collect(),
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Contexts on the free stack.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Takes a free context and fills it with the given requests.
    ///
    /// Returns the requests back if no context is free.
    pub fn occupy(
        &mut self,
        requests: Vec<R>,
        len: usize,
        callback: Option<Callback>,
    ) -> std::result::Result<usize, (Vec<R>, Option<Callback>)> {
        let Some(idx) = self.free.pop() else {
            return Err((requests, callback));
        };
        let ctx = &mut self.slots[idx];
        debug_assert_eq!(ctx.reference_count, 0);
        ctx.pending.clear();
        ctx.reference_count = requests.len();
        ctx.pending.extend(requests.into_iter().map(Some));
        ctx.len = len;
        ctx.callback = callback;
        if ctx.reference_count == 0 {
            // Nothing to wait for.
            self.complete(idx);
        }
        Ok(idx)
    }

    fn complete(&mut self, idx: usize) {
        let ctx = &mut self.slots[idx];
        ctx.pending.clear();
        ctx.len = 0;
        let callback = ctx.callback.take();
        self.free.push(idx);
        if let Some(cb) = callback {
            cb();
        }
    }

    /// Tests every in-flight context; completed ones run their callback and
    /// return to the free stack. Returns the number reclaimed.
    pub fn garbage_collect<B: Backend<Send = R>>(&mut self, backend: &mut B) -> Result<usize> {
        let mut reclaimed = 0;
        for idx in 0..self.slots.len() {
            let ctx = &mut self.slots[idx];
            if ctx.reference_count == 0 {
                continue;
            }
            for entry in ctx.pending.iter_mut() {
                let Some(req) = entry.take() else { continue };
                match backend.test_send(req)? {
                    Test::Complete(()) => ctx.reference_count -= 1,
                    Test::Pending(req) => *entry = Some(req),
                }
            }
            if ctx.reference_count == 0 {
                self.complete(idx);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            trace!(reclaimed, free = self.free.len(), "send contexts reclaimed");
        }
        Ok(reclaimed)
    }

    /// Cancels every outstanding request and frees all contexts without
    /// running callbacks. Returns the number of requests cancelled.
    pub fn cancel_all<B: Backend<Send = R>>(&mut self, backend: &mut B) -> Result<usize> {
        let mut cancelled = 0;
        for idx in 0..self.slots.len() {
            let ctx = &mut self.slots[idx];
            if ctx.reference_count == 0 {
                continue;
            }
            for req in ctx.pending.drain(..).flatten() {
                backend.cancel_send(req)?;
                cancelled += 1;
            }
            ctx.reference_count = 0;
            ctx.len = 0;
            ctx.callback = None;
            self.free.push(idx);
        }
        Ok(cancelled)
    }

    #[cfg(test)]
    pub(crate) fn free_stack(&self) -> &[usize] {
        &self.free
    }
}

struct RecvContext<R> {
    request: Option<R>,
}

/// Always-armed ring of posted receives.
pub struct RecvRing<R> {
    slots: Vec<RecvContext<R>>,
    head: usize,
    buffer_size: usize,
    armed: usize,
}

impl<R> RecvRing<R> {
    pub fn new(log2_capacity: u32, buffer_size: usize) -> Self {
        let capacity = 1usize << log2_capacity;
        Self {
            slots: (0..capacity).map(|_| RecvContext { request: None }).collect(),
            head: 0,
            buffer_size,
            armed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Receives currently posted.
    pub fn armed(&self) -> usize {
        self.armed
    }

    /// Posts a receive in every slot, in slot order.
    pub fn arm<B: Backend<Recv = R>>(&mut self, backend: &mut B) -> Result<()> {
        for slot in self.slots.iter_mut() {
            if slot.request.is_none() {
                let buf = vec![0u8; self.buffer_size].into_boxed_slice();
                slot.request = Some(backend.post_recv(buf)?);
                self.armed += 1;
            }
        }
        self.head = 0;
        Ok(())
    }

    /// Tests the oldest posted receive.
    ///
    /// On completion the slot is left empty and must be refilled with
    /// [`rearm`](Self::rearm) before the next call.
    pub fn poll_head<B: Backend<Recv = R>>(&mut self, backend: &mut B) -> Result<Option<Received>> {
        let slot = &mut self.slots[self.head];
        let Some(req) = slot.request.take() else {
            return Ok(None);
        };
        match backend.test_recv(req)? {
            Test::Complete(received) => {
                self.armed -= 1;
                Ok(Some(received))
            }
            Test::Pending(req) => {
                slot.request = Some(req);
                Ok(None)
            }
        }
    }

    /// Re-posts the head slot with `buf` and advances the head.
    pub fn rearm<B: Backend<Recv = R>>(&mut self, backend: &mut B, buf: Box<[u8]>) -> Result<()> {
        let slot = &mut self.slots[self.head];
        debug_assert!(slot.request.is_none());
        slot.request = Some(backend.post_recv(buf)?);
        self.armed += 1;
        self.head = (self.head + 1) % self.slots.len();
        Ok(())
    }

    /// Withdraws every posted receive. Returns how many were cancelled.
    pub fn cancel_all<B: Backend<Recv = R>>(&mut self, backend: &mut B) -> Result<usize> {
        let mut cancelled = 0;
        for slot in self.slots.iter_mut() {
            if let Some(req) = slot.request.take() {
                backend.cancel_recv(req)?;
                cancelled += 1;
            }
        }
        self.armed = 0;
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFabric;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn free_stack_is_lifo() {
        let fabric = LocalFabric::new(1).with_eager_sends();
        let mut be = fabric.endpoint(0);
        let mut ring = SendRing::new(2);
        let a = ring.occupy(vec![be.isend(0, Box::new([1])).unwrap()], 1, None).ok().unwrap();
        let b = ring.occupy(vec![be.isend(0, Box::new([2])).unwrap()], 1, None).ok().unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(ring.garbage_collect(&mut be).unwrap(), 2);
        // Slot 1 was pushed last, so it comes back first.
        assert_eq!(ring.free_stack().last(), Some(&1));
        let c = ring.occupy(vec![be.isend(0, Box::new([3])).unwrap()], 1, None).ok().unwrap();
        assert_eq!(c, 1);
    }

    #[test]
    fn full_ring_hands_requests_back() {
        let fabric = LocalFabric::new(2);
        let mut be = fabric.endpoint(0);
        let mut ring = SendRing::new(0);
        ring.occupy(vec![be.isend(1, Box::new([1])).unwrap()], 1, None).ok().unwrap();
        let req = be.isend(1, Box::new([2])).unwrap();
        let (back, _) = ring.occupy(vec![req], 1, None).err().unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn broadcast_callback_fires_once_after_all_complete() {
        let fabric = LocalFabric::new(3);
        let mut sender = fabric.endpoint(0);
        let mut r1 = fabric.endpoint(1);
        let mut r2 = fabric.endpoint(2);
        let fired = Rc::new(Cell::new(0));
        let f = Rc::clone(&fired);

        let mut ring = SendRing::new(1);
        let reqs = vec![
            sender.isend(1, Box::new([7])).unwrap(),
            sender.isend(2, Box::new([7])).unwrap(),
        ];
        let idx = ring
            .occupy(reqs, 1, Some(Box::new(move || f.set(f.get() + 1))))
            .ok()
            .unwrap();
        assert_eq!(ring.slots[idx].reference_count(), 2);

        r1.post_recv(vec![0u8; 8].into_boxed_slice()).unwrap();
        assert_eq!(ring.garbage_collect(&mut sender).unwrap(), 0);
        assert_eq!(ring.slots[idx].reference_count(), 1);
        assert_eq!(fired.get(), 0);

        r2.post_recv(vec![0u8; 8].into_boxed_slice()).unwrap();
        assert_eq!(ring.garbage_collect(&mut sender).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(ring.garbage_collect(&mut sender).unwrap(), 0);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn recv_ring_stays_armed() {
        let fabric = LocalFabric::new(2);
        let mut rx = fabric.endpoint(1);
        let mut tx = fabric.endpoint(0);
        let mut ring = RecvRing::new(2, 32);
        ring.arm(&mut rx).unwrap();
        assert_eq!(ring.armed(), 4);

        for i in 0..10u8 {
            tx.isend(1, Box::new([i])).unwrap();
            let got = ring.poll_head(&mut rx).unwrap().unwrap();
            assert_eq!(got.bytes(), &[i]);
            ring.rearm(&mut rx, got.buf).unwrap();
            assert_eq!(ring.armed(), 4);
        }
        assert!(ring.poll_head(&mut rx).unwrap().is_none());
        assert_eq!(ring.cancel_all(&mut rx).unwrap(), 4);
        assert_eq!(ring.armed(), 0);
    }
}
