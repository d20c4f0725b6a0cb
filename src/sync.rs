//! Process-shared pthread primitives.
//!
//! Every primitive here is `repr(C)` and meant to live inside a mapped
//! segment. They are built by value and written into place before any other
//! process can see them; once a primitive has been locked it must not move.

use std::cell::UnsafeCell;
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::time::Duration;

use nix::libc::{
    c_int, c_long, clock_gettime, pthread_cond_init, pthread_cond_signal,
    pthread_cond_t, pthread_cond_timedwait, pthread_cond_wait, pthread_condattr_destroy,
    pthread_condattr_init, pthread_condattr_setclock, pthread_condattr_setpshared,
    pthread_condattr_t, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
    pthread_mutex_unlock, pthread_mutexattr_destroy, pthread_mutexattr_init,
    pthread_mutexattr_setpshared, pthread_mutexattr_settype, pthread_mutexattr_t,
    pthread_rwlock_init, pthread_rwlock_rdlock, pthread_rwlock_t, pthread_rwlock_unlock,
    pthread_rwlock_wrlock, pthread_rwlockattr_destroy, pthread_rwlockattr_init,
    pthread_rwlockattr_setpshared, pthread_rwlockattr_t, time_t, timespec, CLOCK_MONOTONIC,
    ETIMEDOUT, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, PTHREAD_PROCESS_SHARED,
};
use tracing::warn;

macro_rules! check_err {
    ($call:expr) => {
        let err = $call;
        if err != 0 {
            return Err(Error::from_raw_os_error(err));
        }
    };
}

const NANOS_PER_SEC: c_long = 1_000_000_000;

#[repr(C)]
pub struct PosixMutex {
    mtx: UnsafeCell<pthread_mutex_t>,
}

unsafe impl Send for PosixMutex {}
unsafe impl Sync for PosixMutex {}

impl PosixMutex {
    pub fn new() -> Result<Self> {
        Self::with_type(PTHREAD_MUTEX_NORMAL)
    }

    /// A mutex the owning thread may lock again without deadlocking.
    pub fn recursive() -> Result<Self> {
        Self::with_type(PTHREAD_MUTEX_RECURSIVE)
    }

    fn with_type(kind: c_int) -> Result<Self> {
        let mut attr = MaybeUninit::<pthread_mutexattr_t>::uninit();
        let mut mtx = MaybeUninit::<pthread_mutex_t>::uninit();
        unsafe {
            check_err!(pthread_mutexattr_init(attr.as_mut_ptr()));
            check_err!(pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                PTHREAD_PROCESS_SHARED
            ));
            check_err!(pthread_mutexattr_settype(attr.as_mut_ptr(), kind));
            check_err!(pthread_mutex_init(mtx.as_mut_ptr(), attr.as_ptr()));
            pthread_mutexattr_destroy(attr.as_mut_ptr());
            Ok(PosixMutex {
                mtx: UnsafeCell::new(mtx.assume_init()),
            })
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_>> {
        unsafe {
            check_err!(pthread_mutex_lock(self.mtx.get()));
        }
        Ok(MutexGuard { mutex: self })
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a PosixMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let err = unsafe { pthread_mutex_unlock(self.mutex.mtx.get()) };
        if err != 0 {
            warn!(errno = err, "failed to unlock process-shared mutex");
        }
    }
}

#[repr(C)]
pub struct PosixCondition {
    cond: UnsafeCell<pthread_cond_t>,
}

unsafe impl Send for PosixCondition {}
unsafe impl Sync for PosixCondition {}

impl PosixCondition {
    /// Waits on this condition are measured against `CLOCK_MONOTONIC`.
    pub fn new() -> Result<Self> {
        let mut attr = MaybeUninit::<pthread_condattr_t>::uninit();
        let mut cond = MaybeUninit::<pthread_cond_t>::uninit();
        unsafe {
            check_err!(pthread_condattr_init(attr.as_mut_ptr()));
            check_err!(pthread_condattr_setpshared(
                attr.as_mut_ptr(),
                PTHREAD_PROCESS_SHARED
            ));
            check_err!(pthread_condattr_setclock(attr.as_mut_ptr(), CLOCK_MONOTONIC));
            check_err!(pthread_cond_init(cond.as_mut_ptr(), attr.as_ptr()));
            pthread_condattr_destroy(attr.as_mut_ptr());
            Ok(PosixCondition {
                cond: UnsafeCell::new(cond.assume_init()),
            })
        }
    }

    pub fn wait(&self, guard: &MutexGuard<'_>) -> Result<()> {
        unsafe {
            check_err!(pthread_cond_wait(self.cond.get(), guard.mutex.mtx.get()));
        }
        Ok(())
    }

    /// Returns `false` once `deadline` has passed without a notification.
    pub fn wait_until(&self, guard: &MutexGuard<'_>, deadline: &Deadline) -> Result<bool> {
        let err =
            unsafe { pthread_cond_timedwait(self.cond.get(), guard.mutex.mtx.get(), &deadline.0) };
        match err {
            0 => Ok(true),
            ETIMEDOUT => Ok(false),
            err => Err(Error::from_raw_os_error(err)),
        }
    }

    pub fn notify_one(&self) -> Result<()> {
        unsafe {
            check_err!(pthread_cond_signal(self.cond.get()));
        }
        Ok(())
    }
}

/// An absolute point on the monotonic clock.
#[derive(Clone, Copy)]
pub struct Deadline(timespec);

impl Deadline {
    pub fn after(timeout: Duration) -> Result<Self> {
        let mut now = MaybeUninit::<timespec>::uninit();
        let now = unsafe {
            if clock_gettime(CLOCK_MONOTONIC, now.as_mut_ptr()) != 0 {
                return Err(Error::last_os_error());
            }
            now.assume_init()
        };
        let mut tv_sec = now
            .tv_sec
            .saturating_add(timeout.as_secs().min(time_t::MAX as u64) as time_t);
        let mut tv_nsec = now.tv_nsec + timeout.subsec_nanos() as c_long;
        if tv_nsec >= NANOS_PER_SEC {
            tv_sec = tv_sec.saturating_add(1);
            tv_nsec -= NANOS_PER_SEC;
        }
        Ok(Deadline(timespec { tv_sec, tv_nsec }))
    }
}

#[repr(C)]
pub struct PosixRwLock {
    lock: UnsafeCell<pthread_rwlock_t>,
}

unsafe impl Send for PosixRwLock {}
unsafe impl Sync for PosixRwLock {}

impl PosixRwLock {
    pub fn new() -> Result<Self> {
        let mut attr = MaybeUninit::<pthread_rwlockattr_t>::uninit();
        let mut lock = MaybeUninit::<pthread_rwlock_t>::uninit();
        unsafe {
            check_err!(pthread_rwlockattr_init(attr.as_mut_ptr()));
            check_err!(pthread_rwlockattr_setpshared(
                attr.as_mut_ptr(),
                PTHREAD_PROCESS_SHARED
            ));
            check_err!(pthread_rwlock_init(lock.as_mut_ptr(), attr.as_ptr()));
            pthread_rwlockattr_destroy(attr.as_mut_ptr());
            Ok(PosixRwLock {
                lock: UnsafeCell::new(lock.assume_init()),
            })
        }
    }

    pub fn read(&self) -> Result<RwLockGuard<'_>> {
        unsafe {
            check_err!(pthread_rwlock_rdlock(self.lock.get()));
        }
        Ok(RwLockGuard { lock: self })
    }

    pub fn write(&self) -> Result<RwLockGuard<'_>> {
        unsafe {
            check_err!(pthread_rwlock_wrlock(self.lock.get()));
        }
        Ok(RwLockGuard { lock: self })
    }
}

/// Held for either shared or exclusive access; both release the same way.
pub struct RwLockGuard<'a> {
    lock: &'a PosixRwLock,
}

impl Drop for RwLockGuard<'_> {
    fn drop(&mut self) {
        let err = unsafe { pthread_rwlock_unlock(self.lock.lock.get()) };
        if err != 0 {
            warn!(errno = err, "failed to unlock process-shared rwlock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn recursive_mutex_relocks() {
        let mtx = PosixMutex::recursive().unwrap();
        let outer = mtx.lock().unwrap();
        let inner = mtx.lock().unwrap();
        drop(inner);
        drop(outer);
        drop(mtx.lock().unwrap());
    }

    #[test]
    fn timed_wait_expires() {
        let mtx = PosixMutex::new().unwrap();
        let cond = PosixCondition::new().unwrap();
        let guard = mtx.lock().unwrap();
        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_millis(20)).unwrap();
        while cond.wait_until(&guard, &deadline).unwrap() {}
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn rwlock_serializes_writers() {
        let lock = Arc::new(PosixRwLock::new().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.write().unwrap();
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let _guard = lock.read().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }
}
