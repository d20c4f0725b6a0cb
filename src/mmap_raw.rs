use std::io::Result;
use std::num::NonZero;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::libc::c_void;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::warn;

/// A read-write shared mapping of a whole file descriptor.
#[derive(Debug)]
pub(crate) struct MmapRaw {
    ptr: NonNull<c_void>,
    len: usize,
}

impl MmapRaw {
    pub fn new<F: AsFd>(file: &F, len: NonZero<usize>) -> Result<Self> {
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )?
        };
        Ok(MmapRaw {
            ptr,
            len: len.get(),
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapRaw {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            warn!(%err, len = self.len, "munmap failed");
        }
    }
}
