use std::io;
use std::ptr;

use crate::arena::Arena;
use crate::error::{Error, ErrorKind, Result};

/// A UTF-8 string stored in an arena, usable as a message field.
///
/// The string is addressed by offset, so reading it needs the arena it was
/// allocated from. Its storage is not freed on drop; call
/// [`free`](Self::free), typically from [`Message::release`](crate::Message::release).
#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SharedStr {
    offset: usize,
    len: usize,
}

impl SharedStr {
    pub fn new(arena: &Arena, s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(SharedStr::default());
        }
        let alloc = arena.allocator::<u8>();
        let buf = alloc.allocate(s.len())?;
        unsafe { ptr::copy_nonoverlapping(s.as_ptr(), buf.as_ptr(), s.len()) };
        Ok(SharedStr {
            offset: arena.offset_of(buf)?,
            len: s.len(),
        })
    }

    pub fn as_str<'a>(&self, arena: &'a Arena) -> Result<&'a str> {
        if self.len == 0 {
            return Ok("");
        }
        if self.offset + self.len > arena.size() {
            return Err(Error::new(ErrorKind::InvalidOffset(self.offset)));
        }
        let buf = arena.resolve::<u8>(self.offset)?;
        let bytes = unsafe { std::slice::from_raw_parts(buf.as_ptr(), self.len) };
        std::str::from_utf8(bytes)
            .map_err(|err| Error::new(ErrorKind::Io(io::Error::new(io::ErrorKind::InvalidData, err))))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the storage to the arena. Calling it again is a no-op.
    pub fn free(&mut self, arena: &Arena) -> Result<()> {
        if self.offset != 0 {
            let buf = arena.resolve::<u8>(self.offset)?;
            arena.allocator::<u8>().deallocate(buf)?;
        }
        *self = SharedStr::default();
        Ok(())
    }
}
