use std::convert::Infallible;
use std::ptr::NonNull;

use tracing::{trace, warn};

use crate::arena::Arena;
use crate::envelope::{Envelope, EnvelopeTable};
use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::receipt::Receipt;

/// Default number of locators a queue created by an endpoint can hold.
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct SenderOptions {
    capacity: usize,
}

impl SenderOptions {
    /// Capacity used if the queue does not exist yet.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn open<'a>(self, arena: &'a Arena, queue: &str) -> Result<Sender<'a>> {
        Ok(Sender {
            arena,
            table: EnvelopeTable::attach(arena)?,
            queue: MessageQueue::open_or_create(queue, self.capacity)?,
        })
    }
}

/// Places payloads in the arena and publishes their locators.
pub struct Sender<'a> {
    arena: &'a Arena,
    table: EnvelopeTable<'a>,
    queue: MessageQueue<u64>,
}

impl<'a> Sender<'a> {
    pub fn options() -> SenderOptions {
        SenderOptions {
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn open(arena: &'a Arena, queue: &str) -> Result<Self> {
        Sender::options().open(arena, queue)
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Moves `value` into the arena and publishes it. Blocks only while the
    /// queue is full.
    pub fn send<T: Message>(&self, value: T) -> Result<Receipt<'a, T>> {
        self.send_with(|_| Ok::<_, Infallible>(value))
    }

    /// Builds the payload with `ctor` and publishes it. `ctor` gets the arena
    /// so it can allocate shared fields. If it fails, the payload storage is
    /// released and nothing is published.
    pub fn send_with<T, E, F>(&self, ctor: F) -> Result<Receipt<'a, T>>
    where
        T: Message,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: FnOnce(&'a Arena) -> std::result::Result<T, E>,
    {
        let alloc = self.arena.allocator::<T>();
        let ptr = alloc.allocate(1)?;
        let value = match ctor(self.arena) {
            Ok(value) => value,
            Err(err) => {
                alloc.deallocate(ptr)?;
                return Err(Error::new(ErrorKind::ConstructionFailure(err.into())));
            }
        };
        unsafe { ptr.as_ptr().write(value) };

        let offset = self.arena.offset_of(ptr)?;
        let envelope = Envelope {
            tag: T::tag(),
            payload: offset,
        };
        let index = match self.table.insert(envelope) {
            Ok(index) => index,
            Err(err) => {
                self.discard(ptr);
                return Err(err);
            }
        };
        if let Err(err) = self.queue.send(index) {
            if let Err(release_err) = self.table.release(index) {
                warn!(index, %release_err, "failed to release unpublished envelope");
            }
            self.discard(ptr);
            return Err(err);
        }
        trace!(name = T::NAME, index, offset, "sent message");
        Ok(Receipt::new(ptr, offset))
    }

    fn discard<T: Message>(&self, ptr: NonNull<T>) {
        if let Err(err) = unsafe { crate::message::reclaim(self.arena, ptr) } {
            warn!(name = T::NAME, %err, "failed to reclaim unpublished payload");
        }
    }
}
