//! The shared heap: a named segment, its allocator and a registry of named
//! objects.
//!
//! Segment layout:
//!
//! ```text
//! +--------------+----------------------------------------------+
//! | ArenaHeader  | heap blocks ...                              |
//! +--------------+----------------------------------------------+
//! 0              HEAP_START                                      len
//! ```
//!
//! The header carries one recursive process-shared mutex that guards both the
//! allocator state and the registry. It is recursive so that a constructor run
//! by [`Arena::find_or_construct`] can allocate from the same arena.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::heap::{Heap, HeapState, BLOCK_ALIGN, MIN_BLOCK};
use crate::segment::{self, Segment};
use crate::sync::PosixMutex;

const ARENA_MAGIC: u64 = 0x7368_6d62_7573_0001;
const MAX_NAMES: usize = 64;

/// Longest name accepted by the named-object registry.
pub const MAX_NAME_LEN: usize = 48;

const HEAP_START: usize = size_of::<ArenaHeader>().next_multiple_of(BLOCK_ALIGN);

/// Smallest segment that holds the header and one heap block.
pub const MIN_ARENA_SIZE: usize = HEAP_START + MIN_BLOCK;

#[repr(C)]
struct ArenaHeader {
    magic: AtomicU64,
    lock: PosixMutex,
    heap: UnsafeCell<HeapState>,
    registry: UnsafeCell<Registry>,
}

/// Fixed table of named objects. A zero `name_len` marks a free slot; a fresh
/// segment is zero-filled, so the table starts out empty.
#[repr(C)]
struct Registry {
    entries: [NamedEntry; MAX_NAMES],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NamedEntry {
    name_len: usize,
    name: [u8; MAX_NAME_LEN],
    offset: usize,
    size: usize,
    align: usize,
}

impl NamedEntry {
    fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }

    fn matches(&self, layout: Layout) -> bool {
        self.size == layout.size() && self.align == layout.align()
    }
}

impl Registry {
    fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name_len != 0 && entry.name() == name.as_bytes())
    }

    fn insert(&mut self, name: &str, offset: usize, layout: Layout) -> Result<()> {
        let slot = self
            .entries
            .iter()
            .position(|entry| entry.name_len == 0)
            .ok_or(Error::new(ErrorKind::RegistryFull))?;
        let entry = &mut self.entries[slot];
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.name_len = name.len();
        entry.offset = offset;
        entry.size = layout.size();
        entry.align = layout.align();
        Ok(())
    }
}

pub struct OpenOptions {
    inner: segment::OpenOptions,
}

impl OpenOptions {
    /// Permission bits used when the segment is created.
    pub fn mode(mut self, mode: u32) -> Self {
        self.inner = self.inner.mode(mode);
        self
    }

    pub fn open_or_create(self, name: &str, size: usize) -> Result<Arena> {
        if size < MIN_ARENA_SIZE {
            return Err(Error::new(ErrorKind::TooSmall {
                len: size,
                required: MIN_ARENA_SIZE,
            }));
        }
        Arena::from_segment(self.inner.create(true).open(name, size)?)
    }

    /// Attaches to an existing arena without creating one.
    pub fn open(self, name: &str) -> Result<Arena> {
        Arena::from_segment(self.inner.create(false).open(name, 0)?)
    }
}

/// A handle to a shared heap. Every process (or thread) that opens the same
/// name sees the same heap; none of them owns it.
pub struct Arena {
    segment: Segment,
}

impl Arena {
    pub fn options() -> OpenOptions {
        OpenOptions {
            inner: Segment::options(),
        }
    }

    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        Arena::options().open_or_create(name, size)
    }

    pub fn open(name: &str) -> Result<Self> {
        Arena::options().open(name)
    }

    /// Unlinks the arena's name. Processes already attached keep their mapping.
    pub fn remove(name: &str) -> Result<bool> {
        Segment::remove(name)
    }

    fn from_segment(segment: Segment) -> Result<Self> {
        if segment.len() < MIN_ARENA_SIZE {
            if segment.created() {
                Segment::remove(segment.name())?;
            }
            return Err(Error::new(ErrorKind::TooSmall {
                len: segment.len(),
                required: MIN_ARENA_SIZE,
            }));
        }
        let arena = Arena { segment };
        let header = arena.header_ptr();
        if arena.segment.created() {
            unsafe {
                ptr::addr_of_mut!((*header).lock).write(PosixMutex::recursive()?);
                ptr::addr_of_mut!((*header).heap).write(UnsafeCell::new(HeapState::default()));
                let state = &mut *(*header).heap.get();
                Heap::new(arena.segment.base(), state).init(HEAP_START, arena.segment.len());
                (*header).magic.store(ARENA_MAGIC, Ordering::Release);
            }
            debug!(
                name = arena.name(),
                size = arena.size(),
                "initialized arena"
            );
        } else {
            arena
                .segment
                .wait_ready(unsafe { &(*header).magic }, ARENA_MAGIC)?;
        }
        Ok(arena)
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Total size of the mapped segment in bytes.
    pub fn size(&self) -> usize {
        self.segment.len()
    }

    /// Bytes currently free in the shared heap, block headers included.
    pub fn free_memory(&self) -> Result<usize> {
        self.with_heap(|heap| Ok(heap.free_bytes()))
    }

    pub fn allocator<T>(&self) -> ArenaAllocator<'_, T> {
        ArenaAllocator {
            arena: self,
            _marker: PhantomData,
        }
    }

    /// Looks up `name` without constructing anything.
    pub fn find<T: Sync>(&self, name: &str) -> Result<Option<&T>> {
        check_name(name)?;
        let _guard = self.header().lock.lock()?;
        let found = self.lookup_locked(name, Layout::new::<T>())?;
        Ok(found.map(|offset| unsafe { self.at::<T>(offset).as_ref() }))
    }

    /// Returns the object registered under `name`, constructing it with `ctor`
    /// first if it does not exist yet. `ctor` is not called when the object
    /// already exists.
    pub fn find_or_construct<T, F>(&self, name: &str, ctor: F) -> Result<&T>
    where
        T: Sync,
        F: FnOnce() -> T,
    {
        self.find_or_try_construct(name, || Ok::<_, std::convert::Infallible>(ctor()))
    }

    /// Like [`find_or_construct`](Self::find_or_construct) with a fallible
    /// constructor. On failure the storage is released and nothing is
    /// registered.
    pub fn find_or_try_construct<T, E, F>(&self, name: &str, ctor: F) -> Result<&T>
    where
        T: Sync,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        check_name(name)?;
        let layout = Layout::new::<T>();
        let _guard = self.header().lock.lock()?;
        if let Some(offset) = self.lookup_locked(name, layout)? {
            return Ok(unsafe { self.at::<T>(offset).as_ref() });
        }

        let offset = self.allocate_raw(layout.size(), layout.align())?;
        let ptr = self.at::<T>(offset);
        match ctor() {
            Ok(value) => unsafe { ptr.as_ptr().write(value) },
            Err(err) => {
                self.deallocate_raw(offset)?;
                return Err(Error::new(ErrorKind::ConstructionFailure(err.into())));
            }
        }

        let registered = unsafe { (*self.header().registry.get()).insert(name, offset, layout) };
        if let Err(err) = registered {
            unsafe { ptr::drop_in_place(ptr.as_ptr()) };
            self.deallocate_raw(offset)?;
            return Err(err);
        }
        debug!(arena = self.name(), name, offset, "constructed named object");
        Ok(unsafe { ptr.as_ref() })
    }

    /// Drops the object registered under `name` in place and frees it.
    /// Returns `false` if there was no such object.
    ///
    /// References previously handed out for `name` dangle afterwards.
    pub fn destroy<T>(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let layout = Layout::new::<T>();
        let _guard = self.header().lock.lock()?;
        let Some(offset) = self.lookup_locked(name, layout)? else {
            return Ok(false);
        };
        unsafe {
            let registry = &mut *self.header().registry.get();
            if let Some(slot) = registry.find(name) {
                registry.entries[slot].name_len = 0;
            }
            ptr::drop_in_place(self.at::<T>(offset).as_ptr());
        }
        self.deallocate_raw(offset)?;
        debug!(arena = self.name(), name, "destroyed named object");
        Ok(true)
    }

    /// Translates a pointer into this arena into a segment-relative offset.
    pub fn offset_of<T>(&self, ptr: NonNull<T>) -> Result<usize> {
        let base = self.segment.base().as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.size() {
            return Err(Error::new(ErrorKind::InvalidOffset(addr)));
        }
        Ok(addr - base)
    }

    /// Translates a segment-relative offset back into a pointer, checking that
    /// a `T` at `offset` lies inside the segment and is aligned.
    pub fn resolve<T>(&self, offset: usize) -> Result<NonNull<T>> {
        let in_bounds = offset
            .checked_add(size_of::<T>())
            .is_some_and(|end| end <= self.size());
        if offset == 0 || !in_bounds || offset % align_of::<T>() != 0 {
            return Err(Error::new(ErrorKind::InvalidOffset(offset)));
        }
        Ok(self.at(offset))
    }

    pub(crate) fn allocate_raw(&self, size: usize, align: usize) -> Result<usize> {
        self.with_heap(|heap| heap.allocate(size, align))
    }

    pub(crate) fn deallocate_raw(&self, offset: usize) -> Result<()> {
        self.with_heap(|heap| heap.deallocate(offset))
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<'_>) -> Result<R>) -> Result<R> {
        let _guard = self.header().lock.lock()?;
        // The guard is held and no other view of the state is alive; nested
        // calls from constructors only happen between two of these scopes.
        let mut heap = unsafe { Heap::new(self.segment.base(), &mut *self.header().heap.get()) };
        f(&mut heap)
    }

    fn lookup_locked(&self, name: &str, layout: Layout) -> Result<Option<usize>> {
        let registry = unsafe { &*self.header().registry.get() };
        match registry.find(name) {
            Some(slot) if registry.entries[slot].matches(layout) => {
                Ok(Some(registry.entries[slot].offset))
            }
            Some(_) => Err(Error::new(ErrorKind::LayoutMismatch {
                name: name.to_string(),
            })),
            None => Ok(None),
        }
    }

    fn at<T>(&self, offset: usize) -> NonNull<T> {
        unsafe { self.segment.base().add(offset).cast() }
    }

    fn header_ptr(&self) -> *mut ArenaHeader {
        self.segment.base().as_ptr() as *mut ArenaHeader
    }

    fn header(&self) -> &ArenaHeader {
        unsafe { &*self.header_ptr() }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::new(ErrorKind::NameTooLong(MAX_NAME_LEN)));
    }
    Ok(())
}

/// Allocates raw, uninitialized `T` storage from an [`Arena`].
pub struct ArenaAllocator<'a, T> {
    arena: &'a Arena,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ArenaAllocator<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaAllocator<'_, T> {}

impl<'a, T> ArenaAllocator<'a, T> {
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Storage for `n` contiguous values of `T`.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>> {
        let Some(size) = size_of::<T>().checked_mul(n) else {
            return Err(Error::new(ErrorKind::AllocationFailure {
                requested: usize::MAX,
                available: self.arena.free_memory()?,
            }));
        };
        let offset = self.arena.allocate_raw(size, align_of::<T>())?;
        Ok(self.arena.at(offset))
    }

    /// Returns storage obtained from [`allocate`](Self::allocate). Values in
    /// it are not dropped.
    pub fn deallocate(&self, ptr: NonNull<T>) -> Result<()> {
        let offset = self.arena.offset_of(ptr)?;
        self.arena.deallocate_raw(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    struct Scratch(String);

    impl Scratch {
        fn new(tag: &str) -> Self {
            Scratch(format!("/shmbus-arena-{}-{}", tag, std::process::id()))
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = Arena::remove(&self.0);
        }
    }

    #[test]
    fn registry_rejects_bad_names() {
        let scratch = Scratch::new("names");
        let arena = Arena::open_or_create(&scratch.0, 65536).unwrap();
        assert!(matches!(
            arena.find::<u32>("").unwrap_err().kind(),
            ErrorKind::NameTooLong(MAX_NAME_LEN)
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(arena.find_or_construct(&long, || 1u32).is_err());
    }

    #[test]
    fn layout_mismatch_is_reported() {
        let scratch = Scratch::new("layout");
        let arena = Arena::open_or_create(&scratch.0, 65536).unwrap();
        arena.find_or_construct("counter", || AtomicU32::new(1)).unwrap();
        assert!(matches!(
            arena.find::<u64>("counter").unwrap_err().kind(),
            ErrorKind::LayoutMismatch { .. }
        ));
    }

    #[test]
    fn failed_construction_leaves_nothing_behind() {
        let scratch = Scratch::new("ctor");
        let arena = Arena::open_or_create(&scratch.0, 65536).unwrap();
        let before = arena.free_memory().unwrap();
        let err = arena
            .find_or_try_construct("broken", || Err::<u64, _>("no"))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConstructionFailure(_)));
        assert_eq!(arena.free_memory().unwrap(), before);
        assert!(arena.find::<u64>("broken").unwrap().is_none());
    }

    #[test]
    fn constructors_may_allocate() {
        let scratch = Scratch::new("nested");
        let arena = Arena::open_or_create(&scratch.0, 65536).unwrap();
        let outer = arena
            .find_or_construct("outer", || {
                let inner = arena.find_or_construct("inner", || AtomicU32::new(7)).unwrap();
                AtomicU32::new(inner.load(Ordering::Relaxed) + 1)
            })
            .unwrap();
        assert_eq!(outer.load(Ordering::Relaxed), 8);
        assert!(arena.find::<AtomicU32>("inner").unwrap().is_some());
    }

    #[test]
    fn offsets_round_trip() {
        let scratch = Scratch::new("offsets");
        let arena = Arena::open_or_create(&scratch.0, 65536).unwrap();
        let alloc = arena.allocator::<u64>();
        let ptr = alloc.allocate(4).unwrap();
        let offset = arena.offset_of(ptr).unwrap();
        assert_eq!(arena.resolve::<u64>(offset).unwrap(), ptr);
        assert!(arena.resolve::<u64>(arena.size()).is_err());
        alloc.deallocate(ptr).unwrap();
    }
}
