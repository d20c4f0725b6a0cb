use std::num::NonZero;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::unistd::ftruncate;
use nix::{
    fcntl::OFlag,
    libc::off_t,
    sys::stat::{fstat, Mode},
};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::mmap_raw::MmapRaw;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);
const READY_POLL_ATTEMPTS: u32 = 2000;

pub struct OpenOptions {
    mode: Mode,
    create: bool,
}

impl OpenOptions {
    /// Opens the segment `name`, creating it with `len` bytes if allowed and
    /// absent. An existing segment keeps its own size.
    pub fn open(self, name: &str, len: usize) -> Result<Segment> {
        let name = prepend_slash(name);
        if self.create {
            let len = NonZero::new(len).ok_or(Error::new(ErrorKind::Io(
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "segment size cannot be zero"),
            )))?;
            let oflg = OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL;
            match shm_open(name.as_str(), oflg, self.mode) {
                Ok(fd) => return Self::create_new(fd, name, len),
                Err(Errno::EEXIST) => (),
                Err(err) => return Err(err.into()),
            }
        }
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, self.mode)?;
        let len = wait_for_size(&fd, &name)?;
        let map = MmapRaw::new(&fd, len)?;
        debug!(name = %name, len = map.len(), "attached to shared memory segment");
        Ok(Segment {
            name,
            map,
            created: false,
        })
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Mode::from_bits_truncate(mode);
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    fn create_new(fd: OwnedFd, name: String, len: NonZero<usize>) -> Result<Segment> {
        let mapped = ftruncate(&fd, len.get() as off_t)
            .map_err(Error::from)
            .and_then(|_| Ok(MmapRaw::new(&fd, len)?));
        match mapped {
            Ok(map) => {
                debug!(name = %name, len = map.len(), "created shared memory segment");
                Ok(Segment {
                    name,
                    map,
                    created: true,
                })
            }
            Err(err) => {
                // Leave no half-sized segment behind for the next opener.
                let _ = shm_unlink(name.as_str());
                Err(err)
            }
        }
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            mode: Mode::from_bits_truncate(0o600),
            create: true,
        }
    }
}

/// A named POSIX shared memory mapping.
///
/// Dropping a segment only unmaps it; the name stays visible to other
/// processes until [`Segment::remove`] is called.
pub struct Segment {
    name: String,
    map: MmapRaw,
    created: bool,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn options() -> OpenOptions {
        OpenOptions::default()
    }

    pub fn open_or_create(name: &str, len: usize) -> Result<Self> {
        Segment::options().open(name, len)
    }

    /// Unlinks `name`. Returns `false` if no such segment existed.
    pub fn remove(name: &str) -> Result<bool> {
        match shm_unlink(prepend_slash(name).as_str()) {
            Ok(()) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> NonNull<u8> {
        self.map.base()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether this handle created the segment and is responsible for
    /// initializing it.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Waits until the creator has published `magic` in `word`.
    pub(crate) fn wait_ready(&self, word: &AtomicU64, magic: u64) -> Result<()> {
        for _ in 0..READY_POLL_ATTEMPTS {
            if word.load(Ordering::Acquire) == magic {
                return Ok(());
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
        Err(Error::new(ErrorKind::NotInitialized(self.name.clone())))
    }
}

fn wait_for_size(fd: &OwnedFd, name: &str) -> Result<NonZero<usize>> {
    // The creator truncates right after the exclusive open; a zero size means
    // we got in between.
    for _ in 0..READY_POLL_ATTEMPTS {
        let statbuf = fstat(fd.as_raw_fd())?;
        if let Some(len) = NonZero::new(statbuf.st_size as usize) {
            return Ok(len);
        }
        thread::sleep(READY_POLL_INTERVAL);
    }
    Err(Error::new(ErrorKind::NotInitialized(name.to_string())))
}

fn prepend_slash(name: &str) -> String {
    if !name.starts_with('/') {
        String::from("/") + name
    } else {
        String::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_open_attaches() {
        let name = format!("/shmbus-segment-{}", std::process::id());
        let first = Segment::open_or_create(&name, 4096).unwrap();
        let second = Segment::open_or_create(&name, 8192).unwrap();
        assert!(first.created());
        assert!(!second.created());
        assert_eq!(second.len(), 4096);

        unsafe { first.base().as_ptr().write(42) };
        assert_eq!(unsafe { second.base().as_ptr().read() }, 42);

        assert!(Segment::remove(&name).unwrap());
        assert!(!Segment::remove(&name).unwrap());
    }

    #[test]
    fn open_without_create_fails_when_missing() {
        let name = format!("/shmbus-missing-{}", std::process::id());
        let err = Segment::options().create(false).open(&name, 0).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }
}
