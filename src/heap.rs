//! First-fit free-list allocator over a byte range of a segment.
//!
//! Blocks are addressed by their offset from the segment base so every
//! process can walk the list no matter where it mapped the segment. Each block
//! starts with a [`BlockHeader`]; allocated blocks mark `next` with
//! [`ALLOCATED`], free blocks are kept sorted by offset and coalesced on free.

use std::ptr::NonNull;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const BLOCK_ALIGN: usize = 16;
const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub(crate) const MIN_BLOCK: usize = 2 * HEADER_SIZE;
const ALLOCATED: usize = usize::MAX;

#[repr(C, align(16))]
struct BlockHeader {
    size: usize,
    next: usize,
}

/// Allocator bookkeeping stored in the segment header. Offset zero is never a
/// valid block, so it doubles as the list terminator.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct HeapState {
    start: usize,
    end: usize,
    free_head: usize,
    free_bytes: usize,
}

/// A view of the heap that is only valid while the caller holds the lock
/// guarding `state`.
pub(crate) struct Heap<'a> {
    base: NonNull<u8>,
    state: &'a mut HeapState,
}

impl<'a> Heap<'a> {
    /// # Safety
    ///
    /// `base` must be valid for the whole `[0, state.end)` range and no other
    /// view of `state` may exist while this one is alive.
    pub unsafe fn new(base: NonNull<u8>, state: &'a mut HeapState) -> Self {
        Heap { base, state }
    }

    /// Formats `[start, end)` as a single free block.
    pub fn init(&mut self, start: usize, end: usize) {
        let start = round_up(start, BLOCK_ALIGN).unwrap_or(usize::MAX);
        let end = end & !(BLOCK_ALIGN - 1);
        self.state.start = start;
        self.state.end = end;
        if start >= end || end - start < MIN_BLOCK {
            self.state.free_head = 0;
            self.state.free_bytes = 0;
            return;
        }
        self.write_header(start, end - start, 0);
        self.state.free_head = start;
        self.state.free_bytes = end - start;
    }

    pub fn free_bytes(&self) -> usize {
        self.state.free_bytes
    }

    /// Returns the offset of `size` usable bytes aligned to `align`.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<usize> {
        if align > BLOCK_ALIGN {
            return Err(Error::new(ErrorKind::Alignment(align)));
        }
        let need = round_up(size.max(1), BLOCK_ALIGN)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or_else(|| self.exhausted(size))?
            .max(MIN_BLOCK);

        let mut prev = 0;
        let mut cur = self.state.free_head;
        while cur != 0 {
            let (block_size, next) = self.read_header(cur);
            if block_size >= need {
                let taken = if block_size - need >= MIN_BLOCK {
                    let rest = cur + need;
                    self.write_header(rest, block_size - need, next);
                    self.link(prev, rest);
                    need
                } else {
                    self.link(prev, next);
                    block_size
                };
                self.write_header(cur, taken, ALLOCATED);
                self.state.free_bytes -= taken;
                return Ok(cur + HEADER_SIZE);
            }
            prev = cur;
            cur = next;
        }
        Err(self.exhausted(size))
    }

    pub fn deallocate(&mut self, offset: usize) -> Result<()> {
        if offset < self.state.start + HEADER_SIZE
            || offset >= self.state.end
            || offset % BLOCK_ALIGN != 0
        {
            return Err(Error::new(ErrorKind::InvalidOffset(offset)));
        }
        let block = offset - HEADER_SIZE;
        let (size, marker) = self.read_header(block);
        if marker != ALLOCATED {
            return Err(Error::new(ErrorKind::DoubleFree(offset)));
        }
        self.state.free_bytes += size;

        let mut prev = 0;
        let mut cur = self.state.free_head;
        while cur != 0 && cur < block {
            prev = cur;
            cur = self.read_header(cur).1;
        }
        self.write_header(block, size, cur);
        self.link(prev, block);

        if cur != 0 && block + size == cur {
            let (next_size, next_next) = self.read_header(cur);
            self.write_header(block, size + next_size, next_next);
        }
        if prev != 0 {
            let (prev_size, _) = self.read_header(prev);
            if prev + prev_size == block {
                let (merged, next) = self.read_header(block);
                self.write_header(prev, prev_size + merged, next);
            }
        }
        Ok(())
    }

    fn exhausted(&self, requested: usize) -> Error {
        Error::new(ErrorKind::AllocationFailure {
            requested,
            available: self.state.free_bytes,
        })
    }

    fn link(&mut self, prev: usize, next: usize) {
        if prev == 0 {
            self.state.free_head = next;
        } else {
            let (size, _) = self.read_header(prev);
            self.write_header(prev, size, next);
        }
    }

    fn header(&self, offset: usize) -> *mut BlockHeader {
        debug_assert!(offset >= self.state.start && offset < self.state.end);
        unsafe { self.base.as_ptr().add(offset) as *mut BlockHeader }
    }

    fn read_header(&self, offset: usize) -> (usize, usize) {
        let hdr = self.header(offset);
        unsafe { ((*hdr).size, (*hdr).next) }
    }

    fn write_header(&mut self, offset: usize, size: usize, next: usize) {
        unsafe { self.header(offset).write(BlockHeader { size, next }) }
    }
}

/// `None` if rounding up would overflow.
fn round_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Region {
        buf: Vec<u128>,
        state: HeapState,
    }

    impl Region {
        fn new(bytes: usize) -> Self {
            let mut region = Region {
                buf: vec![0; bytes / 16],
                state: HeapState::default(),
            };
            region.heap().init(64, bytes);
            region
        }

        fn heap(&mut self) -> Heap<'_> {
            let base = NonNull::new(self.buf.as_mut_ptr() as *mut u8).unwrap();
            unsafe { Heap::new(base, &mut self.state) }
        }
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut region = Region::new(4096);
        let mut heap = region.heap();
        let a = heap.allocate(1, 1).unwrap();
        let b = heap.allocate(40, 8).unwrap();
        let c = heap.allocate(16, 16).unwrap();
        for off in [a, b, c] {
            assert_eq!(off % BLOCK_ALIGN, 0);
        }
        assert!(a + 16 <= b);
        assert!(b + 48 <= c);
    }

    #[test]
    fn free_restores_accounting_after_coalescing() {
        let mut region = Region::new(4096);
        let mut heap = region.heap();
        let initial = heap.free_bytes();

        let blocks: Vec<_> = (0..6).map(|i| heap.allocate(24 * (i + 1), 8).unwrap()).collect();
        assert!(heap.free_bytes() < initial);

        // Free out of order so both neighbours get merged.
        for i in [1, 3, 0, 5, 2, 4] {
            heap.deallocate(blocks[i]).unwrap();
        }
        assert_eq!(heap.free_bytes(), initial);

        // Everything merged back into one block, so a near-full request fits.
        let big = heap.allocate(initial - 2 * HEADER_SIZE, 16).unwrap();
        heap.deallocate(big).unwrap();
        assert_eq!(heap.free_bytes(), initial);
    }

    #[test]
    fn exhaustion_reports_available_bytes() {
        let mut region = Region::new(1024);
        let mut heap = region.heap();
        let free = heap.free_bytes();
        let err = heap.allocate(4096, 8).unwrap_err();
        match err.kind() {
            ErrorKind::AllocationFailure {
                requested,
                available,
            } => {
                assert_eq!(*requested, 4096);
                assert_eq!(*available, free);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(heap.free_bytes(), free);
    }

    #[test]
    fn huge_requests_fail_instead_of_wrapping() {
        let mut region = Region::new(1024);
        let mut heap = region.heap();
        let free = heap.free_bytes();
        for size in [usize::MAX - 4, usize::MAX - HEADER_SIZE, usize::MAX] {
            assert!(matches!(
                heap.allocate(size, 1).unwrap_err().kind(),
                ErrorKind::AllocationFailure { requested, .. } if *requested == size
            ));
        }
        assert_eq!(heap.free_bytes(), free);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut region = Region::new(1024);
        let mut heap = region.heap();
        let a = heap.allocate(32, 8).unwrap();
        let _b = heap.allocate(32, 8).unwrap();
        heap.deallocate(a).unwrap();
        assert!(matches!(
            heap.deallocate(a).unwrap_err().kind(),
            ErrorKind::DoubleFree(off) if *off == a
        ));
    }

    #[test]
    fn oversized_alignment_is_rejected() {
        let mut region = Region::new(1024);
        let mut heap = region.heap();
        assert!(matches!(
            heap.allocate(8, 64).unwrap_err().kind(),
            ErrorKind::Alignment(64)
        ));
        assert!(matches!(
            heap.deallocate(8).unwrap_err().kind(),
            ErrorKind::InvalidOffset(8)
        ));
    }
}
