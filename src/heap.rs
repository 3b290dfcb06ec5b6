use std::ptr::{self, NonNull};

use crate::{
    arena::Arena,
    block::{self, ALIGNMENT, HEADER_SIZE, Header, Link},
    error::{AllocError, Corruption, CorruptionKind},
    freelist::{Search, find_free_block},
    kernel::{DefaultBreak, ProgramBreak},
    list::{Blocks, Iter},
    trace::{Event, LogTrace, Trace},
    utils::{align, align4},
};

#[cfg(unix)]
use crate::kernel::Sbrk;

/// Largest request whose block, header included, can still be asked from the
/// program break in a single increment.
const MAX_REQUEST: usize = isize::MAX as usize - HEADER_SIZE - ALIGNMENT;

/// A heap managed as a single list of blocks laid out back to back, from the
/// first block up to the program break.
///
/// ```text
///  head                                                         break
///   |                                                             |
///   v                                                             v
///   +--------+------+--------+-------------+--------+-------------+
///   | Header | Used | Header |    Free     | Header |    Used     |
///   +--------+------+--------+-------------+--------+-------------+
///       |                ^  |                  ^
///       +----------------+  +------------------+
/// ```
///
/// Requests are served first-fit from the free blocks. When nothing fits the
/// break is moved forward and the new block appended, and when the last block
/// is released the break is moved back.
///
/// All state lives in this value: several heaps can coexist as long as each
/// one owns its [`ProgramBreak`]. The process break has a single owner, see
/// [`Heap::process`]. A heap is not thread safe, every operation takes
/// `&mut self`.
#[derive(Debug)]
pub struct Heap<B: ProgramBreak = DefaultBreak, T: Trace = LogTrace> {
    /// First block, at the lowest address. `None` until the first allocation
    /// and again once everything has been handed back.
    head: Link,
    brk: B,
    tracer: T,
}

impl<B: ProgramBreak + Default, T: Trace + Default> Default for Heap<B, T> {
    fn default() -> Self {
        Self::new(B::default(), T::default())
    }
}

impl Heap<Arena, LogTrace> {
    /// Heap confined to a fresh [`Arena`] of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arena::new(capacity), LogTrace)
    }
}

#[cfg(unix)]
impl Heap<Sbrk, LogTrace> {
    /// Heap over the process break, or `None` while another heap owns it.
    pub fn process() -> Option<Self> {
        Sbrk::acquire().map(|brk| Self::new(brk, LogTrace))
    }
}

impl<B: ProgramBreak, T: Trace> Heap<B, T> {
    pub const fn new(brk: B, tracer: T) -> Self {
        Self {
            head: None,
            brk,
            tracer,
        }
    }

    /// The program break this heap grows.
    pub fn backend(&self) -> &B {
        &self.brk
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut T {
        &mut self.tracer
    }

    /// Whether the heap currently owns no block at all.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Current position of the program break.
    pub fn current_break(&mut self) -> Option<NonNull<u8>> {
        unsafe { self.brk.sbrk(0) }
    }

    /// Iterates over every block, free or not, in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(unsafe { Iter::new(self.head) })
    }

    /// Allocates at least `size` bytes and returns the start of the content.
    ///
    /// The size is rounded up to a multiple of 4 (zero becomes 4). Free blocks
    /// are reused first-fit and split when they are big enough to leave a
    /// useful remainder, otherwise the break is moved forward.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = request_size(size)?;

        let mut block = match self.head {
            None => {
                let block = self.extend_heap(None, size)?;
                self.head = Some(block);
                block
            }
            Some(head) => match unsafe { find_free_block(head, size) } {
                Search::Found(block) => {
                    self.tracer.event(Event::BlockFound {
                        block: block.as_ptr().cast::<u8>(),
                        size: unsafe { block.as_ref().size() },
                    });
                    self.split_residue(block, size);
                    block
                }
                Search::Missing { last } => self.extend_heap(Some(last), size)?,
            },
        };

        unsafe {
            let payload = Header::payload(block);
            let header = block.as_mut();

            header.is_free = false;
            header.self_ref = payload.as_ptr();

            Ok(payload)
        }
    }

    /// Allocates room for `count` elements of `size` bytes each, all set to zero.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
        let ptr = self.allocate(total)?;

        // The block holds at least the aligned size.
        unsafe { ptr.as_ptr().write_bytes(0, align4(total)) };

        Ok(ptr)
    }

    /// Changes the size of the allocation at `ptr`, keeping its content up to
    /// the smaller of both sizes.
    ///
    /// The block is kept in place whenever it is already big enough or can
    /// absorb a free successor. Otherwise a new block is allocated, the content
    /// copied over and the old block released. A `None` pointer behaves like
    /// [`Heap::allocate`].
    pub fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };

        let block = self.valid_addr(ptr).ok_or(AllocError::InvalidPointer)?;
        let size = request_size(size)?;

        unsafe {
            let current = block.as_ref().size();

            if current >= size {
                self.split_residue(block, size);
                return Ok(ptr);
            }

            if let Some(next) = Header::free_successor(block) {
                if current + HEADER_SIZE + next.as_ref().size() >= size {
                    self.fuse(block);
                    self.split_residue(block, size);
                    return Ok(ptr);
                }
            }

            let new = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), current.min(size));
            self.release(Some(ptr));

            Ok(new)
        }
    }

    /// Hands the allocation at `ptr` back to the heap.
    ///
    /// The block is merged with free neighbours on both sides, and if it ends
    /// up last in the list the break is moved back to its header. Pointers
    /// this heap doesn't recognise, including already released ones, are
    /// ignored.
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };

        let Some(mut block) = self.valid_addr(ptr) else {
            return;
        };

        unsafe {
            let header = block.as_mut();
            header.is_free = true;
            header.self_ref = ptr::null_mut();

            // The earlier block always absorbs the later one.
            while let Some(prev) = self.predecessor(block) {
                if !prev.as_ref().is_free || Header::free_successor(prev) != Some(block) {
                    break;
                }
                block = self.fuse(prev);
            }

            while Header::free_successor(block).is_some() {
                block = self.fuse(block);
            }

            if block.as_ref().next().is_none() {
                self.retract(block);
            }
        }
    }

    /// Whether `ptr` looks like the content of a block currently allocated
    /// from this heap.
    ///
    /// This is a heuristic: a pointer into the heap is accepted when the word
    /// where its header would be holds the pointer itself. Content crafted to
    /// look like a header fools it, it only catches honest mistakes.
    ///
    /// Takes `&mut self` because validation reads the break and is traced.
    pub fn is_valid(&mut self, ptr: NonNull<u8>) -> bool {
        self.valid_addr(ptr).is_some()
    }

    /// Number of bytes usable at `ptr`, if it is a valid allocation. Needs
    /// `&mut self` for the same reason as [`Heap::is_valid`].
    pub fn usable_size(&mut self, ptr: NonNull<u8>) -> Option<usize> {
        let block = self.valid_addr(ptr)?;

        Some(unsafe { block.as_ref().size() })
    }

    /// Walks the whole block list and verifies its invariants, reporting the
    /// first violation found.
    pub fn check(&mut self) -> Result<(), Corruption> {
        let brk = self.current_break().map(|brk| brk.as_ptr().addr());
        let mut prev: Link = None;

        for block in unsafe { Iter::new(self.head) } {
            let header = unsafe { block.as_ref() };
            let address = block.as_ptr().addr();
            let payload = block.as_ptr().cast::<u8>().wrapping_add(HEADER_SIZE);
            let end = payload.addr().wrapping_add(header.size());

            let fail = |kind| Err(Corruption { address, kind });

            if address % ALIGNMENT != 0 {
                return fail(CorruptionKind::Misaligned);
            }
            if header.size() % ALIGNMENT != 0 {
                return fail(CorruptionKind::UnalignedSize);
            }
            if header.prev() != prev {
                return fail(CorruptionKind::BrokenBackLink);
            }

            match (header.is_free, header.self_ref() == payload) {
                (true, true) => return fail(CorruptionKind::StaleSelfRef),
                (false, false) => return fail(CorruptionKind::MissingSelfRef),
                _ => {}
            }

            if let Some(prev) = prev {
                let before = unsafe { prev.as_ref() };
                let prev_end = prev.as_ptr().addr() + HEADER_SIZE + before.size();

                if address <= prev.as_ptr().addr() {
                    return fail(CorruptionKind::OutOfOrder);
                }
                if address < prev_end {
                    return fail(CorruptionKind::Overlap);
                }
                if address == prev_end && before.is_free && header.is_free {
                    return fail(CorruptionKind::AdjacentFree);
                }
            }

            if brk.is_some_and(|brk| end > brk) {
                return fail(CorruptionKind::PastBreak);
            }

            prev = Some(block);
        }

        Ok(())
    }

    /// Moves the break forward to fit a new block of `size` bytes and links it
    /// after `last`.
    fn extend_heap(&mut self, last: Link, size: usize) -> Result<NonNull<Header>, AllocError> {
        unsafe {
            let padding = self.align_break()?;

            let Some(addr) = self.brk.sbrk((HEADER_SIZE + size) as isize) else {
                self.brk.sbrk(-(padding as isize));
                return Err(AllocError::OutOfMemory);
            };

            let block = addr.cast::<Header>();
            block.as_ptr().write(Header {
                size,
                next: None,
                prev: last,
                is_free: false,
                self_ref: ptr::null_mut(),
            });

            if let Some(mut last) = last {
                last.as_mut().next = Some(block);
            }

            self.tracer.event(Event::HeapExtended {
                block: addr.as_ptr(),
                size,
            });

            Ok(block)
        }
    }

    /// Pads the break up to [`ALIGNMENT`] so the next header lands aligned,
    /// returning the padding. Only needed when something else left the break
    /// unaligned.
    unsafe fn align_break(&mut self) -> Result<usize, AllocError> {
        unsafe {
            let current = self.brk.sbrk(0).ok_or(AllocError::OutOfMemory)?;
            let addr = current.as_ptr().addr();
            let padding = align(addr, ALIGNMENT) - addr;

            if padding != 0 {
                self.brk
                    .sbrk(padding as isize)
                    .ok_or(AllocError::OutOfMemory)?;
            }

            Ok(padding)
        }
    }

    /// Returns the header of `ptr` if it passes validation.
    fn valid_addr(&mut self, ptr: NonNull<u8>) -> Option<NonNull<Header>> {
        let valid = unsafe { self.check_addr(ptr) };

        self.tracer.event(Event::PointerValidated {
            ptr: ptr.as_ptr(),
            valid,
        });

        valid.then(|| unsafe { Header::from_payload(ptr) })
    }

    unsafe fn check_addr(&mut self, ptr: NonNull<u8>) -> bool {
        let Some(head) = self.head else {
            return false;
        };

        let Some(brk) = (unsafe { self.brk.sbrk(0) }) else {
            return false;
        };

        let addr = ptr.as_ptr().addr();

        // Our payloads are aligned and always preceded by a header inside the heap.
        if addr % ALIGNMENT != 0
            || addr < head.as_ptr().addr() + HEADER_SIZE
            || addr >= brk.as_ptr().addr()
        {
            return false;
        }

        let block = unsafe { Header::from_payload(ptr) };

        if unsafe { block.as_ref().self_ref() } != ptr.as_ptr() {
            return false;
        }

        // Blocks of another heap growing the same break look just like ours.
        unsafe { self.owns(block) }
    }

    /// Whether `block` is linked in this heap's list.
    unsafe fn owns(&self, block: NonNull<Header>) -> bool {
        self.head == Some(block) || unsafe { self.predecessor(block) }.is_some()
    }

    /// Splits `block` down to `size` bytes if the remainder is worth keeping.
    fn split_residue(&mut self, block: NonNull<Header>, size: usize) {
        unsafe {
            if !block.as_ref().can_split(size) {
                return;
            }

            let rest = block::split(block, size);

            self.tracer.event(Event::BlockSplit {
                block: block.as_ptr().cast::<u8>(),
                size,
                remainder: rest.as_ptr().cast::<u8>(),
                remainder_size: rest.as_ref().size(),
            });

            // A block shrinking in place may leave its remainder right before
            // another free block.
            self.fuse(rest);
        }
    }

    fn fuse(&mut self, block: NonNull<Header>) -> NonNull<Header> {
        unsafe {
            if let Some(next) = Header::free_successor(block) {
                block::fuse(block);

                self.tracer.event(Event::BlocksFused {
                    block: block.as_ptr().cast::<u8>(),
                    absorbed: next.as_ptr().cast::<u8>(),
                    size: block.as_ref().size(),
                });
            }

            block
        }
    }

    /// Block right before `block` in the list.
    ///
    /// Back links are trusted only when the forward link agrees with them,
    /// otherwise the list is walked from the head.
    unsafe fn predecessor(&self, block: NonNull<Header>) -> Link {
        unsafe {
            match block.as_ref().prev() {
                Some(prev) if prev.as_ref().next() == Some(block) => return Some(prev),
                None if self.head == Some(block) => return None,
                _ => {}
            }

            Iter::new(self.head).find(|candidate| candidate.as_ref().next() == Some(block))
        }
    }

    /// Gives the free tail `block` back to the program break.
    unsafe fn retract(&mut self, block: NonNull<Header>) {
        unsafe {
            // Something else moved the break past our last block; it stays
            // around as a free block.
            if self.brk.sbrk(0) != NonNull::new(Header::end(block)) {
                return;
            }

            let prev = self.predecessor(block);
            if prev.is_none() && self.head != Some(block) {
                return;
            }

            let released = HEADER_SIZE + block.as_ref().size();

            if self.brk.sbrk(-(released as isize)).is_none() {
                return;
            }

            match prev {
                Some(mut prev) => prev.as_mut().next = None,
                None => self.head = None,
            }

            self.tracer.event(Event::HeapRetracted {
                block: block.as_ptr().cast::<u8>(),
                released,
            });
        }
    }
}

/// Rounds a requested size, refusing sizes the break could never provide.
fn request_size(size: usize) -> Result<usize, AllocError> {
    if size > MAX_REQUEST {
        return Err(AllocError::SizeOverflow);
    }

    Ok(align4(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{NoTrace, Recorder};
    use std::{cell::RefCell, rc::Rc, slice};

    use test_log::test;

    const CAPACITY: usize = 64 * 1024;

    fn heap() -> Heap<Arena, Recorder> {
        Heap::new(Arena::new(CAPACITY), Recorder::default())
    }

    fn used(heap: &Heap<Arena, Recorder>) -> usize {
        heap.backend().used()
    }

    fn header_of(ptr: NonNull<u8>) -> *const u8 {
        ptr.as_ptr().wrapping_sub(HEADER_SIZE)
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr.as_ptr().write_bytes(byte, len) };
    }

    fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
        unsafe { slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    #[test]
    fn allocate_returns_valid_pointer() {
        let mut heap = heap();

        let a = heap.allocate(10).unwrap();

        assert!(heap.is_valid(a));
        assert_eq!(a.as_ptr().addr() % ALIGNMENT, 0);
        assert_eq!(heap.usable_size(a), Some(12));
        assert_eq!(used(&heap), HEADER_SIZE + 12);
        heap.check().unwrap();
    }

    #[test]
    fn first_allocation_extends_heap() {
        let mut heap = heap();
        let base = heap.backend().base();

        let a = heap.allocate(0).unwrap();

        assert_eq!(header_of(a), base.as_ptr().cast_const());
        assert_eq!(
            heap.tracer_mut().take(),
            vec![Event::HeapExtended {
                block: base.as_ptr(),
                size: 4,
            }]
        );
    }

    #[test]
    fn allocations_are_contiguous() {
        let mut heap = heap();

        let a = heap.allocate(20).unwrap();
        let b = heap.allocate(8).unwrap();

        assert_eq!(header_of(b), a.as_ptr().wrapping_add(20).cast_const());
        assert_eq!(used(&heap), 2 * HEADER_SIZE + 28);
        heap.check().unwrap();
    }

    #[test]
    fn reuse_after_release() {
        let mut heap = heap();

        let a = heap.allocate(256).unwrap();
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(a));

        let brk = used(&heap);
        heap.tracer_mut().take();

        let b = heap.allocate(32).unwrap();

        assert_eq!(b, a);
        assert_eq!(used(&heap), brk);

        let events = heap.tracer_mut().take();
        assert!(events.contains(&Event::BlockFound {
            block: header_of(a),
            size: 256,
        }));
        assert!(events.contains(&Event::BlockSplit {
            block: header_of(a),
            size: 32,
            remainder: a.as_ptr().wrapping_add(32),
            remainder_size: 256 - 32 - HEADER_SIZE,
        }));
        heap.check().unwrap();
    }

    #[test]
    fn small_remainder_is_not_split() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(a));

        let b = heap.allocate(60).unwrap();

        assert_eq!(b, a);
        assert_eq!(heap.usable_size(b), Some(64));
        assert_eq!(heap.blocks().count(), 2);
    }

    #[test]
    fn adjacent_releases_coalesce_in_any_order() {
        for order in [[0, 1], [1, 0]] {
            let mut heap = heap();

            let blocks = [heap.allocate(40).unwrap(), heap.allocate(48).unwrap()];
            let _guard = heap.allocate(4).unwrap();

            for i in order {
                heap.release(Some(blocks[i]));
            }
            heap.check().unwrap();

            let free: Vec<_> = heap.blocks().filter(|block| block.is_free).collect();
            assert_eq!(free.len(), 1);
            assert_eq!(free[0].payload, blocks[0]);
            assert_eq!(free[0].size, 40 + HEADER_SIZE + 48);

            let brk = used(&heap);
            let merged = heap.allocate(40 + HEADER_SIZE + 48).unwrap();

            assert_eq!(merged, blocks[0]);
            assert_eq!(used(&heap), brk);
        }
    }

    #[test]
    fn middle_release_merges_both_sides() {
        let mut heap = heap();

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(24).unwrap();
        let c = heap.allocate(32).unwrap();
        let _guard = heap.allocate(4).unwrap();

        heap.release(Some(a));
        heap.release(Some(c));
        heap.release(Some(b));
        heap.check().unwrap();

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_free);
        assert_eq!(blocks[0].size, 16 + 24 + 32 + 2 * HEADER_SIZE);
    }

    #[test]
    fn releasing_tail_retracts_break() {
        let mut heap = heap();

        let a = heap.allocate(16).unwrap();
        let after_a = used(&heap);
        let b = heap.allocate(32).unwrap();

        heap.release(Some(b));
        assert_eq!(used(&heap), after_a);
        assert_eq!(heap.blocks().count(), 1);
        assert!(heap.is_valid(a));

        heap.release(Some(a));
        assert_eq!(used(&heap), 0);
        assert!(heap.is_empty());
        heap.check().unwrap();
    }

    #[test]
    fn zero_allocate_clears_reused_memory() {
        let mut heap = heap();

        let dirty = heap.allocate(320).unwrap();
        fill(dirty, 320, 0xAB);
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(dirty));

        let zeroed = heap.zero_allocate(80, 4).unwrap();

        assert_eq!(zeroed, dirty);
        assert!(bytes(zeroed, 320).iter().all(|&byte| byte == 0));
    }

    #[test]
    fn zero_allocate_clears_aligned_tail() {
        let mut heap = heap();

        let dirty = heap.allocate(12).unwrap();
        fill(dirty, 12, 0xFF);
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(dirty));

        let zeroed = heap.zero_allocate(3, 3).unwrap();

        assert_eq!(zeroed, dirty);
        assert_eq!(bytes(zeroed, 12), &[0; 12]);
    }

    #[test]
    fn zero_allocate_overflow_fails() {
        let mut heap = heap();

        assert_eq!(
            heap.zero_allocate(usize::MAX, 2),
            Err(AllocError::SizeOverflow)
        );
        assert!(heap.is_empty());
        assert_eq!(used(&heap), 0);
    }

    #[test]
    fn exhaustion_is_reported_and_recoverable() {
        let mut heap = heap();

        assert_eq!(heap.allocate(usize::MAX), Err(AllocError::SizeOverflow));
        assert_eq!(heap.allocate(CAPACITY), Err(AllocError::OutOfMemory));
        assert!(heap.is_empty());

        let a = heap.allocate(16).unwrap();
        assert!(heap.is_valid(a));

        assert_eq!(heap.allocate(CAPACITY), Err(AllocError::OutOfMemory));
        assert_eq!(heap.blocks().count(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn small_arena_runs_out() {
        let mut heap = Heap::with_capacity(128);

        let a = heap.allocate(64).unwrap();
        assert_eq!(heap.allocate(64), Err(AllocError::OutOfMemory));
        assert!(heap.is_valid(a));

        heap.release(Some(a));
        assert!(heap.is_empty());
        assert!(heap.allocate(64).is_ok());
    }

    #[test]
    fn failed_extension_gives_padding_back() {
        let mut heap = heap();

        // Leave the break unaligned, as foreign code could.
        unsafe { heap.brk.sbrk(2).unwrap() };

        assert_eq!(heap.allocate(CAPACITY), Err(AllocError::OutOfMemory));
        assert_eq!(used(&heap), 2);

        let a = heap.allocate(16).unwrap();
        let base = heap.backend().base().as_ptr();

        assert_eq!(header_of(a), base.wrapping_add(ALIGNMENT).cast_const());
        assert_eq!(used(&heap), ALIGNMENT + HEADER_SIZE + 16);
        heap.check().unwrap();
    }

    #[test]
    fn resize_shrinks_in_place() {
        let mut heap = heap();

        let a = heap.allocate(256).unwrap();
        fill(a, 256, 0x5A);

        let b = heap.resize(Some(a), 32).unwrap();

        assert_eq!(b, a);
        assert_eq!(heap.usable_size(a), Some(32));
        assert!(bytes(a, 32).iter().all(|&byte| byte == 0x5A));

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].is_free);
        assert_eq!(blocks[1].size, 256 - 32 - HEADER_SIZE);
        heap.check().unwrap();
    }

    #[test]
    fn shrink_remainder_joins_free_neighbour() {
        let mut heap = heap();

        let a = heap.allocate(256).unwrap();
        let b = heap.allocate(64).unwrap();
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(b));

        heap.resize(Some(a), 32).unwrap();
        heap.check().unwrap();

        let free: Vec<_> = heap.blocks().filter(|block| block.is_free).collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, 256 - 32 + 64);
    }

    #[test]
    fn resize_grows_into_free_neighbour() {
        let mut heap = heap();

        let a = heap.allocate(32).unwrap();
        fill(a, 32, 0x11);
        let b = heap.allocate(256).unwrap();
        let _guard = heap.allocate(4).unwrap();
        heap.release(Some(b));

        let brk = used(&heap);
        let grown = heap.resize(Some(a), 128).unwrap();

        assert_eq!(grown, a);
        assert_eq!(used(&heap), brk);
        assert_eq!(heap.usable_size(a), Some(128));
        assert!(bytes(a, 32).iter().all(|&byte| byte == 0x11));

        let free: Vec<_> = heap.blocks().filter(|block| block.is_free).collect();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, 32 + 256 - 128);
        heap.check().unwrap();
    }

    #[test]
    fn resize_moves_when_neighbour_is_used() {
        let mut heap = heap();

        let a = heap.allocate(10).unwrap();
        bytes_mut(a, 10).copy_from_slice(b"0123456789");
        let b = heap.allocate(16).unwrap();

        let moved = heap.resize(Some(a), 80).unwrap();

        assert_ne!(moved, a);
        assert_eq!(bytes(moved, 10), b"0123456789");
        assert!(!heap.is_valid(a));
        assert!(heap.is_valid(moved));
        assert!(heap.is_valid(b));
        heap.check().unwrap();
    }

    #[test]
    fn resize_without_pointer_allocates() {
        let mut heap = heap();

        let a = heap.resize(None, 24).unwrap();

        assert!(heap.is_valid(a));
        assert_eq!(heap.usable_size(a), Some(24));
    }

    #[test]
    fn resize_rejects_foreign_pointer() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        let before: Vec<_> = heap.blocks().collect();

        let mut local = [0u32; 8];
        let foreign = NonNull::new(local.as_mut_ptr().cast::<u8>());

        assert_eq!(heap.resize(foreign, 8), Err(AllocError::InvalidPointer));
        assert_eq!(
            heap.resize(Some(unsafe { a.add(4) }), 8),
            Err(AllocError::InvalidPointer)
        );
        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
    }

    #[test]
    fn release_ignores_unknown_pointers() {
        let mut heap = heap();

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        let before: Vec<_> = heap.blocks().collect();

        let mut local = [0u32; 8];
        heap.release(NonNull::new(local.as_mut_ptr().cast::<u8>()));
        heap.release(Some(unsafe { a.add(4) }));
        heap.release(None);

        assert_eq!(heap.blocks().collect::<Vec<_>>(), before);

        // A second release of the same pointer is rejected as well.
        heap.release(Some(a));
        assert!(!heap.is_valid(a));
        let after_first: Vec<_> = heap.blocks().collect();
        heap.release(Some(a));
        assert_eq!(heap.blocks().collect::<Vec<_>>(), after_first);

        let c = heap.allocate(8).unwrap();
        assert!(heap.is_valid(c));
        assert!(heap.is_valid(b));
        heap.check().unwrap();
    }

    #[test]
    fn rejected_pointers_are_traced() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        heap.tracer_mut().take();

        let mut local = 0u32;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        heap.release(Some(foreign));
        assert!(heap.is_valid(a));

        assert_eq!(
            heap.tracer_mut().take(),
            vec![
                Event::PointerValidated {
                    ptr: foreign.as_ptr(),
                    valid: false,
                },
                Event::PointerValidated {
                    ptr: a.as_ptr(),
                    valid: true,
                },
            ]
        );
        assert!(heap.tracer().events.is_empty());
    }

    #[test]
    fn stale_back_link_is_recomputed() {
        let mut heap = heap();

        let _a = heap.allocate(16).unwrap();
        let after_a = used(&heap);
        let b = heap.allocate(16).unwrap();

        unsafe { Header::from_payload(b).as_mut().prev = None };
        assert_eq!(
            heap.check().map_err(|corruption| corruption.kind),
            Err(CorruptionKind::BrokenBackLink)
        );

        heap.release(Some(b));

        assert_eq!(used(&heap), after_a);
        assert_eq!(heap.blocks().count(), 1);
        heap.check().unwrap();
    }

    #[test]
    fn check_reports_adjacent_free_blocks() {
        let mut heap = heap();

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        let _guard = heap.allocate(4).unwrap();

        for ptr in [a, b] {
            unsafe {
                let header = Header::from_payload(ptr).as_mut();
                header.is_free = true;
                header.self_ref = ptr::null_mut();
            }
        }

        assert_eq!(
            heap.check(),
            Err(Corruption {
                address: header_of(b).addr(),
                kind: CorruptionKind::AdjacentFree,
            })
        );
    }

    #[test]
    fn heaps_are_independent() {
        let mut first = heap();
        let mut second = heap();

        let a = first.allocate(16).unwrap();
        let b = second.allocate(16).unwrap();

        assert!(!second.is_valid(a));
        assert!(!first.is_valid(b));

        second.release(Some(a));
        assert!(first.is_valid(a));
    }

    /// One arena grown by several heaps, like the process break.
    #[derive(Debug, Clone)]
    struct SharedArena(Rc<RefCell<Arena>>);

    impl ProgramBreak for SharedArena {
        unsafe fn sbrk(&mut self, increment: isize) -> Option<NonNull<u8>> {
            unsafe { self.0.borrow_mut().sbrk(increment) }
        }
    }

    #[test]
    fn heaps_sharing_a_break_reject_each_others_blocks() {
        let arena = SharedArena(Rc::new(RefCell::new(Arena::new(CAPACITY))));
        let mut first = Heap::new(arena.clone(), NoTrace);
        let mut second = Heap::new(arena.clone(), NoTrace);

        let a = first.allocate(16).unwrap();
        let b = second.allocate(16).unwrap();
        let brk = arena.0.borrow().used();

        assert!(!first.is_valid(b));
        first.release(Some(b));
        assert_eq!(first.resize(Some(b), 64), Err(AllocError::InvalidPointer));

        assert_eq!(arena.0.borrow().used(), brk);
        assert!(!first.is_empty());
        assert!(first.is_valid(a));
        assert!(second.is_valid(b));
        first.check().unwrap();
        second.check().unwrap();

        // `a` is last in its list but not below the break, it stays.
        first.release(Some(a));
        assert_eq!(arena.0.borrow().used(), brk);
        assert!(second.is_valid(b));

        second.release(Some(b));
        assert!(second.is_empty());
        assert_eq!(arena.0.borrow().used(), HEADER_SIZE + 16);
    }

    #[cfg(unix)]
    #[test]
    fn process_break_grows_and_retracts() {
        let mut heap = Heap::new(crate::kernel::exclusive_break(), Recorder::default());
        let start = heap.current_break().unwrap();

        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(32).unwrap();

        assert!(heap.is_valid(a));
        assert!(heap.is_valid(b));
        assert!(a >= start);
        assert!(heap.current_break().unwrap() > b);
        heap.check().unwrap();

        heap.release(Some(b));
        assert_eq!(heap.current_break().unwrap().as_ptr().cast_const(), header_of(b));
        assert_eq!(heap.blocks().count(), 1);

        // Something else grows the break past our last block.
        let foreign = unsafe { libc::sbrk(64) };
        assert_ne!(foreign.addr(), usize::MAX);

        heap.release(Some(a));
        assert!(!heap.is_empty());
        assert!(heap.blocks().all(|block| block.is_free));
        heap.check().unwrap();

        unsafe { libc::sbrk(-64) };

        let again = heap.allocate(16).unwrap();
        assert_eq!(again, a);

        heap.release(Some(again));
        assert!(heap.is_empty());
        assert_eq!(heap.current_break().unwrap().as_ptr().cast_const(), header_of(a));
    }

    #[test]
    fn end_to_end_scenario() {
        let mut heap = heap();

        let a = heap.allocate(10).unwrap();
        assert!(heap.is_valid(a));
        bytes_mut(a, 10).copy_from_slice(b"allocator!");
        let after_a = used(&heap);

        let b = heap.zero_allocate(80, 4).unwrap();
        assert!(bytes(b, 320).iter().all(|&byte| byte == 0));
        assert!(used(&heap) > after_a);
        assert!(b > a);

        let a2 = heap.resize(Some(a), 80).unwrap();
        assert_ne!(a2, a);
        assert_eq!(bytes(a2, 10), b"allocator!");

        heap.release(Some(a2));
        assert!(heap.is_valid(b));
        heap.check().unwrap();

        heap.release(Some(b));
        assert!(used(&heap) <= header_of(b).addr() - heap.backend().base().as_ptr().addr());
        assert!(heap.is_empty());
        assert_eq!(used(&heap), 0);
    }

    fn bytes_mut<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }
}
