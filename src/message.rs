use std::fmt::{self, Display};
use std::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::error::Result;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable identifier of a message type, derived from its declared name.
///
/// The hash is 64-bit FNV-1a over the UTF-8 bytes of the name, so it is the
/// same in every process and every build.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    pub const fn of(name: &str) -> Tag {
        let bytes = name.as_bytes();
        let mut hash = FNV_OFFSET;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
            i += 1;
        }
        Tag(hash)
    }

    pub const fn from_raw(raw: u64) -> Tag {
        Tag(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A payload type that can travel over the bus.
///
/// # Safety
///
/// Values are written into shared memory and read back in other processes.
/// Implementors must be `repr(C)` and must not hold pointers or references
/// into process-local memory; use arena offsets (for example
/// [`SharedStr`](crate::SharedStr)) instead.
///
/// `NAME` must be unique among all message types sharing one bus. Collisions
/// are not detected.
pub unsafe trait Message: Sized + Send + 'static {
    const NAME: &'static str;

    fn name() -> &'static str {
        Self::NAME
    }

    fn tag() -> Tag {
        Tag::of(Self::NAME)
    }

    /// Returns arena storage owned by this value. Called once, right before
    /// the value is dropped in place on accept.
    fn release(&mut self, _arena: &Arena) -> Result<()> {
        Ok(())
    }
}

/// Runs `release` and the destructor of the payload at `ptr`, then returns its
/// storage to the arena.
///
/// # Safety
///
/// `ptr` must point to a live `T` allocated from `arena` that nobody else will
/// touch again.
pub(crate) unsafe fn reclaim<T: Message>(arena: &Arena, ptr: NonNull<T>) -> Result<()> {
    let released = (*ptr.as_ptr()).release(arena);
    ptr::drop_in_place(ptr.as_ptr());
    arena.allocator::<T>().deallocate(ptr)?;
    released
}
