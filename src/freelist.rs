use std::ptr::NonNull;

use crate::{block::Header, list::Iter};

/// Outcome of a free block search.
///
/// The free list is not a structure of its own: free blocks are the ones in
/// the block list with [`Header::is_free`] set, so finding one means walking
/// the whole list.
///
/// ```text
///          Found
///            |
/// +------+ +-v----+ +------+ +------+
/// | Used |>| Free |>| Used |>| Free |
/// +------+ +------+ +------+ +------+
/// ```
///
/// When nothing fits, the last visited block is kept so the heap can append
/// a new block right after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Search {
    Found(NonNull<Header>),
    Missing { last: NonNull<Header> },
}

/// Returns the first free block, starting at `head`, whose content can hold
/// `size` bytes.
///
/// This implementation uses the first-fit algorithm. It is O(n) in the number
/// of blocks, which coalescing keeps small enough.
///
/// **SAFETY**: `head` must be the head of a well formed block list.
pub(crate) unsafe fn find_free_block(head: NonNull<Header>, size: usize) -> Search {
    let mut last = head;

    for block in unsafe { Iter::new(Some(head)) } {
        let header = unsafe { block.as_ref() };

        if header.is_free && header.size() >= size {
            return Search::Found(block);
        }

        last = block;
    }

    Search::Missing { last }
}
