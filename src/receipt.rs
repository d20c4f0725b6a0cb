use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::message::{Message, Tag};

/// A caller-local handle to a payload that was just sent.
///
/// A receipt does not own the payload. The bus frees it when a receiver
/// accepts the message, possibly in another process and possibly before the
/// sender looks at the receipt; nothing tracks whether that has happened.
/// Reading through a receipt is therefore `unsafe`.
pub struct Receipt<'a, T> {
    ptr: NonNull<T>,
    offset: usize,
    _arena: PhantomData<&'a Arena>,
}

impl<T> Clone for Receipt<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Receipt<'_, T> {}

impl<'a, T: Message> Receipt<'a, T> {
    pub(crate) fn new(ptr: NonNull<T>, offset: usize) -> Self {
        Receipt {
            ptr,
            offset,
            _arena: PhantomData,
        }
    }

    pub fn tag(&self) -> Tag {
        T::tag()
    }

    /// Segment-relative location of the payload.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Borrows the payload in place.
    ///
    /// # Safety
    ///
    /// No receiver may have accepted the message yet, and none may accept it
    /// while the returned reference is alive.
    pub unsafe fn as_ref(&self) -> &'a T {
        self.ptr.as_ref()
    }

    /// Copies the payload out.
    ///
    /// # Safety
    ///
    /// Same contract as [`as_ref`](Self::as_ref), for the duration of the copy.
    pub unsafe fn read(&self) -> T
    where
        T: Copy,
    {
        self.ptr.as_ptr().read()
    }
}

impl<T: Message> fmt::Debug for Receipt<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receipt")
            .field("name", &T::NAME)
            .field("tag", &self.tag())
            .field("offset", &self.offset)
            .finish()
    }
}
