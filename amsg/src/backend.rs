//! The message-passing library seen by the communicator.
//!
//! Non-blocking calls move owned buffers into the request they create; the
//! buffer comes back out when the request completes (receives) or is simply
//! released (sends). Every `test_*` call consumes the request and hands it
//! back if it is still pending, so a request can never be tested after it
//! completed.

use crate::error::BackendError;
use crate::geometry::Core;

/// Outcome of testing a request.
#[derive(Debug)]
pub enum Test<T, R> {
    /// The request finished with this output.
    Complete(T),
    /// Still in flight; the request is handed back.
    Pending(R),
}

impl<T, R> Test<T, R> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Test::Complete(_))
    }
}

/// A completed receive.
#[derive(Debug)]
pub struct Received {
    pub source: Core,
    /// Bytes actually written into `buf`.
    pub len: usize,
    pub buf: Box<[u8]>,
}

impl Received {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Point-to-point and collective operations over a fixed set of ranks.
///
/// Collectives must be entered by every rank in the same order.
pub trait Backend {
    type Send;
    type Recv;
    type Barrier;

    fn rank(&self) -> Core;
    fn size(&self) -> usize;

    /// Starts sending `buf` to `dest`.
    fn isend(&mut self, dest: Core, buf: Box<[u8]>) -> Result<Self::Send, BackendError>;
    fn test_send(&mut self, req: Self::Send) -> Result<Test<(), Self::Send>, BackendError>;
    fn cancel_send(&mut self, req: Self::Send) -> Result<(), BackendError>;

    /// Posts `buf` to receive one message from any source.
    fn post_recv(&mut self, buf: Box<[u8]>) -> Result<Self::Recv, BackendError>;
    fn test_recv(&mut self, req: Self::Recv) -> Result<Test<Received, Self::Recv>, BackendError>;
    /// Withdraws a posted receive and returns its buffer.
    fn cancel_recv(&mut self, req: Self::Recv) -> Result<Box<[u8]>, BackendError>;

    fn barrier(&mut self) -> Result<(), BackendError>;
    /// Enters a barrier without waiting for the others.
    fn barrier_notify(&mut self) -> Result<Self::Barrier, BackendError>;
    fn barrier_try(&mut self, req: Self::Barrier) -> Result<Test<(), Self::Barrier>, BackendError>;

    /// Gathers one byte string from every rank, indexed by rank.
    fn all_gather(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>, BackendError>;
    /// Sends `outgoing[j]` to rank `j`; returns what every rank sent here.
    fn all_to_all(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, BackendError>;
    fn all_reduce_max(&mut self, value: u64) -> Result<u64, BackendError>;
    fn all_reduce_min(&mut self, value: u64) -> Result<u64, BackendError>;
}
