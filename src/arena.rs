use std::{fmt, ptr::NonNull};

use crate::kernel::ProgramBreak;

/// A fixed amount of memory with a program break of its own.
///
/// Heaps built over an [`Arena`] never touch the process break, so any number
/// of them can live side by side. The break starts at the beginning of the
/// buffer and refuses to move past `capacity` bytes, which makes running out
/// of memory deterministic.
///
/// ```text
/// base                      break                  base + capacity
///  |                          |                           |
///  +--------------------------+---------------------------+
///  |         heap             |          unused           |
///  +--------------------------+---------------------------+
/// ```
pub struct Arena {
    /// Start of the buffer. Word aligned, owned by the arena.
    base: NonNull<u64>,
    /// Length of the buffer in words.
    words: usize,
    /// Offset of the break from `base` in bytes.
    brk: usize,
}

impl Arena {
    /// Creates an arena of at least `capacity` bytes (rounded up to a whole word).
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(8);
        let memory: &mut [u64] = Box::leak(vec![0u64; words].into_boxed_slice());

        Self {
            base: NonNull::from(memory).cast::<u64>(),
            words,
            brk: 0,
        }
    }

    /// Total number of bytes the break can grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words * 8
    }

    /// Number of bytes currently below the break.
    #[inline]
    pub fn used(&self) -> usize {
        self.brk
    }

    /// First byte of the arena.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base.cast()
    }
}

impl ProgramBreak for Arena {
    unsafe fn sbrk(&mut self, increment: isize) -> Option<NonNull<u8>> {
        let old = self.brk;
        let new = old.checked_add_signed(increment)?;

        if new > self.capacity() {
            return None;
        }

        self.brk = new;

        Some(unsafe { self.base().add(old) })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let memory = NonNull::slice_from_raw_parts(self.base, self.words);
            drop(Box::from_raw(memory.as_ptr()));
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("used", &self.brk)
            .finish()
    }
}
