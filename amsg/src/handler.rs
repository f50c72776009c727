//! Handler registry.
//!
//! Handlers are registered in the same order on every core, so the dense
//! ids handed out here name the same handler everywhere in the job.

use std::fmt;
use std::marker::PhantomData;

use crate::backend::Backend;
use crate::codec::{Wire, from_bytes};
use crate::communicator::Outbox;
use crate::error::{Error, Result};
use crate::geometry::Core;

/// Dense handler index, identical on every core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) u16);

impl HandlerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn raw(self) -> u16 {
        self.0
    }
}

/// Handler id tied to the message type its handler decodes.
pub struct MessageId<M> {
    id: HandlerId,
    _marker: PhantomData<fn(M)>,
}

impl<M> MessageId<M> {
    pub fn handler(self) -> HandlerId {
        self.id
    }
}

impl<M> Clone for MessageId<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for MessageId<M> {}

impl<M> fmt::Debug for MessageId<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageId").field(&self.id.0).finish()
    }
}

/// Raw handler: `(outbox, source core, payload, trailing bytes)`.
pub type Handler<B> = Box<dyn FnMut(&mut Outbox<'_, B>, Core, &[u8], &[u8]) -> Result<()>>;

/// Table of registered handlers.
pub struct Registry<B: Backend> {
    handlers: Vec<Handler<B>>,
}

impl<B: Backend> Default for Registry<B> {
    fn default() -> Self {
        Self { handlers: Vec::new() }
    }
}

impl<B: Backend> Registry<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn register<F>(&mut self, f: F) -> Result<HandlerId>
    where
        F: FnMut(&mut Outbox<'_, B>, Core, &[u8], &[u8]) -> Result<()> + 'static,
    {
        let id = u16::try_from(self.handlers.len())
            .map_err(|_| Error::Config(format!("more than {} handlers", u16::MAX)))?;
        self.handlers.push(Box::new(f));
        Ok(HandlerId(id))
    }

    /// Registers a handler whose payload decodes as `M`.
    pub fn register_message<M, F>(&mut self, mut f: F) -> Result<MessageId<M>>
    where
        M: Wire + 'static,
        F: FnMut(&mut Outbox<'_, B>, Core, M) -> Result<()> + 'static,
    {
        let id = self.register(move |out, source, payload, _trailing| {
            let msg = from_bytes::<M>(payload)?;
            f(out, source, msg)
        })?;
        Ok(MessageId {
            id,
            _marker: PhantomData,
        })
    }

    /// Runs handler `id` on one received message.
    pub fn dispatch(
        &mut self,
        id: HandlerId,
        out: &mut Outbox<'_, B>,
        source: Core,
        payload: &[u8],
        trailing: &[u8],
    ) -> Result<()> {
        let handler = self.handlers.get_mut(id.index()).ok_or(Error::UnknownHandler(id))?;
        handler(out, source, payload, trailing)
    }
}
