//! A bounded FIFO of fixed-size datums in its own named segment.
//!
//! The ring lives right after a [`Header`] holding a process-shared mutex and
//! two condition variables, so senders block while the ring is full and
//! receivers can wait for a datum with a deadline.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::heap::BLOCK_ALIGN;
use crate::segment::Segment;
use crate::sync::{Deadline, MutexGuard, PosixCondition, PosixMutex};

const QUEUE_MAGIC: u64 = 0x7368_6d71_7565_0001;

#[repr(C)]
struct Header {
    magic: AtomicU64,
    cap: usize,
    datum_size: usize,
    lock: PosixMutex,
    not_empty: PosixCondition,
    not_full: PosixCondition,
    cursor: UnsafeCell<Cursor>,
}

#[repr(C)]
#[derive(Default)]
struct Cursor {
    len: usize,
    rdp: usize,
    wrp: usize,
}

pub struct MessageQueue<T: Copy> {
    shm: Segment,
    data: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for MessageQueue<T> {}
unsafe impl<T: Copy + Send> Sync for MessageQueue<T> {}

impl<T: Copy> MessageQueue<T> {
    /// Opens the queue `name`, creating it with room for `cap` datums if it
    /// does not exist. An existing queue keeps its own capacity.
    pub fn open_or_create(name: &str, cap: usize) -> Result<Self> {
        if cap == 0 {
            return Err(Error::new(ErrorKind::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "capacity must be greater than zero",
            ))));
        }
        Self::check_align()?;
        let size = Self::ring_size(cap).ok_or_else(|| {
            Error::new(ErrorKind::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "capacity is too large",
            )))
        })?;
        let shm = Segment::open_or_create(name, size)?;
        if shm.created() {
            let hdr = shm.base().as_ptr() as *mut Header;
            unsafe {
                hdr.write(Header {
                    magic: AtomicU64::new(0),
                    cap,
                    datum_size: size_of::<T>(),
                    lock: PosixMutex::new()?,
                    not_empty: PosixCondition::new()?,
                    not_full: PosixCondition::new()?,
                    cursor: UnsafeCell::new(Cursor::default()),
                });
                (*hdr).magic.store(QUEUE_MAGIC, Ordering::Release);
            }
            debug!(name = shm.name(), cap, "created message queue");
        }
        Self::attach(shm)
    }

    /// Attaches to an existing queue.
    pub fn open(name: &str) -> Result<Self> {
        Self::check_align()?;
        Self::attach(Segment::options().create(false).open(name, 0)?)
    }

    pub fn remove(name: &str) -> Result<bool> {
        Segment::remove(name)
    }

    fn attach(shm: Segment) -> Result<Self> {
        let hdr = unsafe { &*(shm.base().as_ptr() as *const Header) };
        shm.wait_ready(&hdr.magic, QUEUE_MAGIC)?;
        if hdr.datum_size != size_of::<T>() {
            return Err(Error::new(ErrorKind::QueueMismatch {
                expected: size_of::<T>(),
                found: hdr.datum_size,
            }));
        }
        if Self::ring_size(hdr.cap).map_or(true, |size| size > shm.len()) {
            return Err(Error::new(ErrorKind::InvalidOffset(shm.len())));
        }
        let data = unsafe { shm.base().add(Self::data_offset()).cast() };
        Ok(MessageQueue {
            shm,
            data,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn capacity(&self) -> usize {
        self.header().cap
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.header().lock.lock()?;
        Ok(self.cursor(&guard).len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.len()? == self.capacity())
    }

    /// Appends `val` unless the queue is full. Returns whether it was queued.
    pub fn try_send(&self, val: T) -> Result<bool> {
        let hdr = self.header();
        let guard = hdr.lock.lock()?;
        if self.cursor(&guard).len == hdr.cap {
            return Ok(false);
        }
        self.push(&guard, val);
        hdr.not_empty.notify_one()?;
        Ok(true)
    }

    /// Appends `val`, waiting for room while the queue is full.
    pub fn send(&self, val: T) -> Result<()> {
        let hdr = self.header();
        let guard = hdr.lock.lock()?;
        while self.cursor(&guard).len == hdr.cap {
            hdr.not_full.wait(&guard)?;
        }
        self.push(&guard, val);
        hdr.not_empty.notify_one()?;
        Ok(())
    }

    pub fn try_recv(&self) -> Result<Option<T>> {
        let hdr = self.header();
        let guard = hdr.lock.lock()?;
        if self.cursor(&guard).len == 0 {
            return Ok(None);
        }
        let val = self.pop(&guard);
        hdr.not_full.notify_one()?;
        Ok(Some(val))
    }

    /// Takes the oldest datum, waiting up to `timeout` for one to arrive.
    /// Returns `None` on timeout without touching the queue.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let hdr = self.header();
        let deadline = Deadline::after(timeout)?;
        let guard = hdr.lock.lock()?;
        while self.cursor(&guard).len == 0 {
            if !hdr.not_empty.wait_until(&guard, &deadline)? && self.cursor(&guard).len == 0 {
                return Ok(None);
            }
        }
        let val = self.pop(&guard);
        hdr.not_full.notify_one()?;
        Ok(Some(val))
    }

    /// Takes the oldest datum, waiting as long as it takes.
    pub fn recv(&self) -> Result<T> {
        let hdr = self.header();
        let guard = hdr.lock.lock()?;
        while self.cursor(&guard).len == 0 {
            hdr.not_empty.wait(&guard)?;
        }
        let val = self.pop(&guard);
        hdr.not_full.notify_one()?;
        Ok(val)
    }

    fn push(&self, guard: &MutexGuard<'_>, val: T) {
        let cap = self.header().cap;
        let cursor = self.cursor_mut(guard);
        unsafe { self.data.as_ptr().add(cursor.wrp).write(val) };
        cursor.wrp = (cursor.wrp + 1) % cap;
        cursor.len += 1;
    }

    fn pop(&self, guard: &MutexGuard<'_>) -> T {
        let cap = self.header().cap;
        let cursor = self.cursor_mut(guard);
        let val = unsafe { self.data.as_ptr().add(cursor.rdp).read() };
        cursor.rdp = (cursor.rdp + 1) % cap;
        cursor.len -= 1;
        val
    }

    // Both cursor accessors require the queue lock to be held.
    fn cursor(&self, _guard: &MutexGuard<'_>) -> &Cursor {
        unsafe { &*self.header().cursor.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn cursor_mut(&self, _guard: &MutexGuard<'_>) -> &mut Cursor {
        unsafe { &mut *self.header().cursor.get() }
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.shm.base().as_ptr() as *const Header) }
    }

    fn data_offset() -> usize {
        size_of::<Header>().next_multiple_of(BLOCK_ALIGN)
    }

    fn ring_size(cap: usize) -> Option<usize> {
        cap.checked_mul(size_of::<T>())?
            .checked_add(Self::data_offset())
    }

    fn check_align() -> Result<()> {
        if align_of::<T>() > BLOCK_ALIGN {
            return Err(Error::new(ErrorKind::Alignment(align_of::<T>())));
        }
        Ok(())
    }
}

impl<T: Copy> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    struct Scratch(String);

    impl Scratch {
        fn new(tag: &str) -> Self {
            Scratch(format!("/shmbus-queue-{}-{}", tag, std::process::id()))
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = MessageQueue::<u64>::remove(&self.0);
        }
    }

    #[test]
    fn fifo_and_capacity() {
        let scratch = Scratch::new("fifo");
        let queue = MessageQueue::<u64>::open_or_create(&scratch.0, 3).unwrap();
        assert!(queue.is_empty().unwrap());
        for i in 0..3 {
            assert!(queue.try_send(i).unwrap());
        }
        assert!(queue.is_full().unwrap());
        assert!(!queue.try_send(99).unwrap());

        let drained: Vec<_> = std::iter::from_fn(|| queue.try_recv().unwrap()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
    }

    #[test]
    fn wraps_around() {
        let scratch = Scratch::new("wrap");
        let queue = MessageQueue::<u64>::open_or_create(&scratch.0, 2).unwrap();
        for i in 0..10 {
            queue.send(i).unwrap();
            assert_eq!(queue.recv().unwrap(), i);
        }
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn timed_receive_on_empty_queue_returns_none() {
        let scratch = Scratch::new("timeout");
        let queue = MessageQueue::<u64>::open_or_create(&scratch.0, 4).unwrap();
        let start = Instant::now();
        assert_eq!(queue.recv_timeout(Duration::from_millis(30)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn second_handle_shares_the_ring() {
        let scratch = Scratch::new("attach");
        let tx = MessageQueue::<u64>::open_or_create(&scratch.0, 4).unwrap();
        let rx = MessageQueue::<u64>::open(&scratch.0).unwrap();
        assert_eq!(rx.capacity(), 4);

        let handle = std::thread::spawn(move || rx.recv_timeout(Duration::from_secs(5)).unwrap());
        tx.send(7).unwrap();
        assert_eq!(handle.join().unwrap(), Some(7));
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let scratch = Scratch::new("huge");
        let err = MessageQueue::<u64>::open_or_create(&scratch.0, usize::MAX / 4).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }

    #[test]
    fn corrupt_capacity_is_rejected_on_attach() {
        let scratch = Scratch::new("corrupt");
        let queue = MessageQueue::<u64>::open_or_create(&scratch.0, 4).unwrap();
        unsafe { (*(queue.shm.base().as_ptr() as *mut Header)).cap = usize::MAX / 2 };
        let err = MessageQueue::<u64>::open(&scratch.0).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidOffset(_)));
    }

    #[test]
    fn datum_size_mismatch_is_rejected() {
        let scratch = Scratch::new("mismatch");
        let _queue = MessageQueue::<u64>::open_or_create(&scratch.0, 4).unwrap();
        let err = MessageQueue::<u32>::open(&scratch.0).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::QueueMismatch {
                expected: 4,
                found: 8
            }
        ));
    }
}
