//! Shared bookkeeping of in-flight messages.
//!
//! The queue only carries an index; the index resolves to an [`Envelope`] in
//! a growable array stored in the arena. Entries are appended under the
//! exclusive lock and never move or get reused until the table is compacted.

use std::cell::UnsafeCell;
use std::io;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::arena::Arena;
use crate::error::{Error, ErrorKind, Result};
use crate::message::Tag;
use crate::sync::PosixRwLock;

const TABLE_NAME: &str = "__shmbus_envelopes";
const INITIAL_CAPACITY: usize = 16;

const SLOT_LIVE: u32 = 1;
const SLOT_CONSUMED: u32 = 2;

/// Type tag plus segment-relative location of one payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub tag: Tag,
    pub payload: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Slot {
    envelope: Envelope,
    state: u32,
}

#[repr(C)]
#[derive(Default)]
struct TableState {
    entries: usize,
    len: usize,
    cap: usize,
    live: usize,
}

#[repr(C)]
struct TableHeader {
    lock: PosixRwLock,
    state: UnsafeCell<TableState>,
}

unsafe impl Sync for TableHeader {}

impl TableHeader {
    fn new() -> io::Result<Self> {
        Ok(TableHeader {
            lock: PosixRwLock::new()?,
            state: UnsafeCell::new(TableState::default()),
        })
    }
}

/// Handle to the arena's envelope table.
#[derive(Clone, Copy)]
pub struct EnvelopeTable<'a> {
    arena: &'a Arena,
    header: &'a TableHeader,
}

impl<'a> EnvelopeTable<'a> {
    /// Finds the arena's table, creating an empty one on first use.
    pub fn attach(arena: &'a Arena) -> Result<Self> {
        let header = arena.find_or_try_construct(TABLE_NAME, TableHeader::new)?;
        Ok(EnvelopeTable { arena, header })
    }

    /// Appends `envelope` and returns its index.
    pub fn insert(&self, envelope: Envelope) -> Result<u64> {
        let _guard = self.header.lock.write()?;
        let state = unsafe { &mut *self.header.state.get() };
        if state.len == state.cap {
            self.grow(state)?;
        }
        let slots = self.slots(state)?;
        unsafe {
            slots.as_ptr().add(state.len).write(Slot {
                envelope,
                state: SLOT_LIVE,
            });
        }
        let index = state.len as u64;
        state.len += 1;
        state.live += 1;
        Ok(index)
    }

    /// Resolves a live entry.
    pub fn lookup(&self, index: u64) -> Result<Envelope> {
        let _guard = self.header.lock.read()?;
        let state = unsafe { &*self.header.state.get() };
        let slot = self.live_slot(state, index)?;
        Ok(unsafe { (*slot.as_ptr()).envelope })
    }

    /// Marks an entry consumed; it can no longer be resolved.
    pub fn release(&self, index: u64) -> Result<Envelope> {
        let _guard = self.header.lock.write()?;
        let state = unsafe { &mut *self.header.state.get() };
        let slot = self.live_slot(state, index)?;
        let envelope = unsafe {
            (*slot.as_ptr()).state = SLOT_CONSUMED;
            (*slot.as_ptr()).envelope
        };
        state.live -= 1;
        Ok(envelope)
    }

    /// Clears the table and returns its storage to the arena, but only when no
    /// entry is live. Returns whether anything was cleared.
    pub fn compact(&self) -> Result<bool> {
        let _guard = self.header.lock.write()?;
        let state = unsafe { &mut *self.header.state.get() };
        if state.live != 0 || (state.len == 0 && state.entries == 0) {
            return Ok(false);
        }
        let cleared = state.len;
        if state.entries != 0 {
            let slots = self.slots(state)?;
            self.arena.allocator::<Slot>().deallocate(slots)?;
        }
        *state = TableState::default();
        debug!(arena = self.arena.name(), cleared, "compacted envelope table");
        Ok(true)
    }

    /// Entries appended since the last compaction, consumed ones included.
    pub fn len(&self) -> Result<usize> {
        let _guard = self.header.lock.read()?;
        Ok(unsafe { (*self.header.state.get()).len })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entries not yet consumed.
    pub fn live(&self) -> Result<usize> {
        let _guard = self.header.lock.read()?;
        Ok(unsafe { (*self.header.state.get()).live })
    }

    fn grow(&self, state: &mut TableState) -> Result<()> {
        let cap = (state.cap * 2).max(INITIAL_CAPACITY);
        let alloc = self.arena.allocator::<Slot>();
        let fresh = alloc.allocate(cap)?;
        if state.entries != 0 {
            let old = self.slots(state)?;
            unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), state.len) };
            alloc.deallocate(old)?;
        }
        state.entries = self.arena.offset_of(fresh)?;
        state.cap = cap;
        Ok(())
    }

    fn live_slot(&self, state: &TableState, index: u64) -> Result<NonNull<Slot>> {
        let stale = || {
            Error::new(ErrorKind::StaleEnvelope {
                index,
                len: state.len,
            })
        };
        if index >= state.len as u64 {
            return Err(stale());
        }
        let slot = unsafe { self.slots(state)?.add(index as usize) };
        if unsafe { (*slot.as_ptr()).state } != SLOT_LIVE {
            return Err(stale());
        }
        Ok(slot)
    }

    fn slots(&self, state: &TableState) -> Result<NonNull<Slot>> {
        self.arena.resolve::<Slot>(state.entries)
    }
}
