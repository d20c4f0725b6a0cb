//! Receiving side of the bus.
//!
//! A receive call takes one locator off the queue, resolves its envelope and
//! hands the payload to the first handler registered for the envelope's tag.
//! The handler decides whether the message is consumed ([`Disposition::Accept`])
//! or put back at the tail of the queue ([`Disposition::Reschedule`]).

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::arena::Arena;
use crate::envelope::{Envelope, EnvelopeTable};
use crate::error::{Error, ErrorKind, Result};
use crate::message::{self, Message, Tag};
use crate::queue::MessageQueue;
use crate::sender::DEFAULT_CAPACITY;

/// How long a single [`Receiver::receive`] call waits for a message.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// What a handler decided to do with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Destroy the payload and free it.
    Accept,
    /// Publish the message again at the tail of the queue.
    Reschedule,
}

/// Handler return values. `()` accepts, `bool` maps `true` to accept.
pub trait IntoDisposition {
    fn into_disposition(self) -> Disposition;
}

impl IntoDisposition for Disposition {
    fn into_disposition(self) -> Disposition {
        self
    }
}

impl IntoDisposition for () {
    fn into_disposition(self) -> Disposition {
        Disposition::Accept
    }
}

impl IntoDisposition for bool {
    fn into_disposition(self) -> Disposition {
        if self {
            Disposition::Accept
        } else {
            Disposition::Reschedule
        }
    }
}

/// Type-erased view of a message, given to the catch-all handler.
pub struct Delivery<'d> {
    envelope: Envelope,
    payload: NonNull<u8>,
    _payload: PhantomData<&'d ()>,
}

impl<'d> Delivery<'d> {
    pub fn tag(&self) -> Tag {
        self.envelope.tag
    }

    /// Segment-relative location of the payload.
    pub fn offset(&self) -> usize {
        self.envelope.payload
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    pub fn is<T: Message>(&self) -> bool {
        self.envelope.tag == T::tag()
    }

    /// Views the payload as `T` if the tags match.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        if self.is::<T>() {
            Some(unsafe { self.payload.cast::<T>().as_ref() })
        } else {
            None
        }
    }
}

impl fmt::Debug for Delivery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.envelope.tag)
            .field("offset", &self.envelope.payload)
            .finish()
    }
}

type Reclaim = unsafe fn(&Arena, NonNull<u8>) -> Result<()>;

unsafe fn reclaim_erased<T: Message>(arena: &Arena, payload: NonNull<u8>) -> Result<()> {
    message::reclaim(arena, payload.cast::<T>())
}

struct TypedHandler<'h> {
    tag: Tag,
    name: &'static str,
    call: Box<dyn FnMut(NonNull<u8>) -> Disposition + 'h>,
    reclaim: Reclaim,
}

type CatchAll<'h> = Box<dyn FnMut(&Delivery<'_>) -> Disposition + 'h>;

/// The set of message types one receive call understands.
///
/// Typed handlers are matched in registration order; the first one whose tag
/// equals the message's wins. The optional catch-all sees everything else.
///
/// ```ignore
/// let mut handlers = Handlers::new()
///     .on(|ping: &mut Ping| println!("{}", ping.seq))
///     .on(|_: &mut Stop| Disposition::Accept)
///     .otherwise(|delivery: &Delivery| delivery.tag() != busy_tag);
/// receiver.receive(&mut handlers)?;
/// ```
#[derive(Default)]
pub struct Handlers<'h> {
    typed: Vec<TypedHandler<'h>>,
    catch_all: Option<CatchAll<'h>>,
    reclaimers: Vec<(Tag, Reclaim)>,
}

impl<'h> Handlers<'h> {
    pub fn new() -> Self {
        Handlers::default()
    }

    /// Handles messages of type `T`.
    pub fn on<T, R, F>(mut self, mut handler: F) -> Self
    where
        T: Message,
        R: IntoDisposition,
        F: FnMut(&mut T) -> R + 'h,
    {
        self.typed.push(TypedHandler {
            tag: T::tag(),
            name: T::NAME,
            call: Box::new(move |payload: NonNull<u8>| {
                let payload = unsafe { payload.cast::<T>().as_mut() };
                handler(payload).into_disposition()
            }),
            reclaim: reclaim_erased::<T>,
        });
        self
    }

    /// Lets the catch-all dispose of `T` properly: when it accepts a `T`, the
    /// payload's `release` and destructor run before its storage is freed.
    pub fn reclaims<T: Message>(mut self) -> Self {
        self.reclaimers
            .push((T::tag(), reclaim_erased::<T> as Reclaim));
        self
    }

    /// Handles any message no typed handler matched. Accepting through the
    /// catch-all frees the payload's storage without running its destructor,
    /// unless the type was registered with [`reclaims`](Self::reclaims).
    pub fn otherwise<R, F>(mut self, mut handler: F) -> Self
    where
        R: IntoDisposition,
        F: FnMut(&Delivery<'_>) -> R + 'h,
    {
        self.catch_all = Some(Box::new(move |delivery: &Delivery<'_>| {
            handler(delivery).into_disposition()
        }));
        self
    }

    /// Names of the typed handlers, in matching order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.typed.iter().map(|handler| handler.name)
    }
}

pub struct ReceiverOptions {
    capacity: usize,
    timeout: Duration,
}

impl ReceiverOptions {
    /// Capacity used if the queue does not exist yet.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// How long each receive call waits for a message.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn open<'a>(self, arena: &'a Arena, queue: &str) -> Result<Receiver<'a>> {
        Ok(Receiver {
            arena,
            table: EnvelopeTable::attach(arena)?,
            queue: MessageQueue::open_or_create(queue, self.capacity)?,
            timeout: self.timeout,
        })
    }
}

/// Takes messages off a queue and dispatches them to [`Handlers`].
pub struct Receiver<'a> {
    arena: &'a Arena,
    table: EnvelopeTable<'a>,
    queue: MessageQueue<u64>,
    timeout: Duration,
}

impl<'a> Receiver<'a> {
    pub fn options() -> ReceiverOptions {
        ReceiverOptions {
            capacity: DEFAULT_CAPACITY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn open(arena: &'a Arena, queue: &str) -> Result<Self> {
        Receiver::options().open(arena, queue)
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for one message and dispatches it.
    ///
    /// Returns `Ok(true)` if a handler accepted the message and `Ok(false)` if
    /// the wait timed out or the handler rescheduled it. A message no handler
    /// understands is put back on the queue and reported as
    /// [`ErrorKind::UnknownMessage`].
    ///
    /// If a handler panics, the message goes back to the tail of the queue as
    /// if it had been rescheduled. An envelope whose payload does not resolve
    /// inside the arena is released and its error returned.
    pub fn receive(&self, handlers: &mut Handlers<'_>) -> Result<bool> {
        let Some(index) = self.queue.recv_timeout(self.timeout)? else {
            return Ok(false);
        };
        let envelope = self.table.lookup(index)?;
        let payload = match self.arena.resolve::<u8>(envelope.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    index,
                    offset = envelope.payload,
                    "envelope points outside the arena, dropping it"
                );
                self.table.release(index)?;
                return Err(err);
            }
        };

        let requeue = RequeueOnUnwind {
            queue: &self.queue,
            index,
        };
        let (disposition, reclaim) = if let Some(handler) = handlers
            .typed
            .iter_mut()
            .find(|handler| handler.tag == envelope.tag)
        {
            trace!(name = handler.name, index, "dispatching message");
            ((handler.call)(payload), Some(handler.reclaim))
        } else if let Some(catch_all) = handlers.catch_all.as_mut() {
            let delivery = Delivery {
                envelope,
                payload,
                _payload: PhantomData,
            };
            trace!(tag = %envelope.tag, index, "dispatching message to catch-all");
            let reclaim = handlers
                .reclaimers
                .iter()
                .find(|(tag, _)| *tag == envelope.tag)
                .map(|(_, reclaim)| *reclaim);
            (catch_all(&delivery), reclaim)
        } else {
            mem::forget(requeue);
            warn!(tag = %envelope.tag, index, "no handler for message, requeueing");
            self.queue.send(index)?;
            return Err(Error::new(ErrorKind::UnknownMessage(envelope.tag)));
        };
        mem::forget(requeue);

        let accepted = match disposition {
            Disposition::Accept => {
                self.accept(index, envelope, payload, reclaim)?;
                true
            }
            Disposition::Reschedule => {
                trace!(index, "rescheduling message");
                self.queue.send(index)?;
                false
            }
        };

        if self.queue.is_empty()? && self.table.compact()? {
            debug!(queue = self.queue.name(), "queue drained, envelope table compacted");
        }
        Ok(accepted)
    }

    fn accept(
        &self,
        index: u64,
        envelope: Envelope,
        payload: NonNull<u8>,
        reclaim: Option<Reclaim>,
    ) -> Result<()> {
        // Consuming the entry first means no other call can resolve it again.
        self.table.release(index)?;
        match reclaim {
            Some(reclaim) => unsafe { reclaim(self.arena, payload) },
            None => {
                debug!(
                    tag = %envelope.tag,
                    index,
                    "freeing payload without running its destructor"
                );
                self.arena.deallocate_raw(envelope.payload)
            }
        }
    }
}

/// Puts a popped index back on the queue if dispatch unwinds.
struct RequeueOnUnwind<'q> {
    queue: &'q MessageQueue<u64>,
    index: u64,
}

impl Drop for RequeueOnUnwind<'_> {
    fn drop(&mut self) {
        warn!(index = self.index, "handler panicked, requeueing message");
        if let Err(err) = self.queue.send(self.index) {
            warn!(index = self.index, %err, "failed to requeue message");
        }
    }
}
