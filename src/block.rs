use std::{
    mem,
    ptr::{self, NonNull},
};

/// Every payload size handed out by the allocator is a multiple of this.
pub(crate) const ALIGNMENT: usize = 4;

/// A located block is only split when the leftover payload would be at least
/// this many bytes once the new header has been carved out of it.
pub(crate) const MIN_RESIDUE: usize = 8;

/// Header size of a block.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Non-null pointer to a block [`Header`].
pub(crate) type Link = Option<NonNull<Header>>;

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |        size         |        |
/// +---------------------+        |
/// |        next         |        |
/// +---------------------+        |
/// |        prev         |        | -> Header
/// +---------------------+        |
/// |    is_free (1b)     |        |
/// +---------------------+        |
/// |      self_ref       | ---+   |
/// +---------------------+ <--+---+
/// |       Content       |        |
/// |         ...         |        | -> Addressable content (`size` bytes)
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// Payloads are only aligned to [`ALIGNMENT`], so a header may start at any
/// 4 byte boundary. The struct is packed to that alignment: fields are always
/// read by value and never borrowed.
#[repr(C, packed(4))]
pub(crate) struct Header {
    /// Size of the payload, header excluded.
    pub size: usize,
    /// Next block in address order.
    pub next: Link,
    /// Previous block in address order.
    pub prev: Link,
    /// Flag to tell whether the block is free or not.
    pub is_free: bool,
    /// Address of the payload while the block is handed out to a user,
    /// null otherwise. Only used to recognise pointers we returned.
    pub self_ref: *mut u8,
}

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);

impl Header {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn next(&self) -> Link {
        self.next
    }

    #[inline]
    pub fn prev(&self) -> Link {
        self.prev
    }

    #[inline]
    pub fn self_ref(&self) -> *mut u8 {
        self.self_ref
    }

    /// Whether splitting this block down to `size` would leave a usable remainder.
    #[inline]
    pub fn can_split(&self, size: usize) -> bool {
        self.size >= size + HEADER_SIZE + MIN_RESIDUE
    }

    /// Address of the content that follows the header of `block`.
    #[inline]
    pub unsafe fn payload(block: NonNull<Self>) -> NonNull<u8> {
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Recovers the header that would precede `ptr` if it was one of our payloads.
    ///
    /// **SAFETY**: the result is only meaningful for pointers that passed validation.
    #[inline]
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<Self> {
        unsafe { ptr.sub(HEADER_SIZE).cast() }
    }

    /// First byte past the payload of `block`.
    #[inline]
    pub unsafe fn end(block: NonNull<Self>) -> *mut u8 {
        unsafe { Self::payload(block).as_ptr().add(block.as_ref().size) }
    }

    /// Returns the successor of `block` if it is free and starts exactly where
    /// `block` ends. Blocks separated by memory we don't own can't be merged.
    pub unsafe fn free_successor(block: NonNull<Self>) -> Link {
        unsafe {
            let next = block.as_ref().next()?;

            (next.as_ref().is_free && Self::end(block) == next.as_ptr().cast::<u8>())
                .then_some(next)
        }
    }
}

/// Splits `block` so that its payload is exactly `size` bytes and returns the
/// new free block written over the remainder.
///
/// ```text
/// +--------+---------------------------------+
/// | Header |            Content              |
/// +--------+---------------------------------+
///
///                      |
///                      v
///
/// +--------+----------+--------+-------------+
/// | Header | `size` B | Header |  Remainder  |
/// +--------+----------+--------+-------------+
///                      (free)
/// ```
///
/// **SAFETY**: caller must guarantee `(*block).can_split(size)` and that `size`
/// is a multiple of [`ALIGNMENT`].
pub(crate) unsafe fn split(mut block: NonNull<Header>, size: usize) -> NonNull<Header> {
    unsafe {
        let header = block.as_mut();
        let next = header.next();

        let rest = Header::payload(block).add(size).cast::<Header>();

        rest.as_ptr().write(Header {
            size: header.size - size - HEADER_SIZE,
            next,
            prev: Some(block),
            is_free: true,
            self_ref: ptr::null_mut(),
        });

        if let Some(mut next) = next {
            next.as_mut().prev = Some(rest);
        }

        header.size = size;
        header.next = Some(rest);

        rest
    }
}

/// Merges `block` with its successor when the successor is free, and returns
/// `block` so callers can keep fusing.
///
/// The absorbed header becomes part of the content of `block`:
///
/// ```text
/// +--------+---------+--------+--------+        +--------+----------------------------+
/// | Header | Content | Header | (free) |  --->  | Header |          Content           |
/// +--------+---------+--------+--------+        +--------+----------------------------+
/// ```
pub(crate) unsafe fn fuse(mut block: NonNull<Header>) -> NonNull<Header> {
    unsafe {
        if let Some(next) = Header::free_successor(block) {
            let absorbed = next.as_ref();
            let after = absorbed.next();

            let header = block.as_mut();
            header.size = header.size + HEADER_SIZE + absorbed.size;
            header.next = after;

            if let Some(mut after) = after {
                after.as_mut().prev = Some(block);
            }
        }

        block
    }
}
