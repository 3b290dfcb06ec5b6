use std::{marker::PhantomData, ptr::NonNull};

use crate::block::{Header, Link};

/// Walks the block list forward, in address order, starting at some block.
///
/// The list itself lives inside the heap: every [`Header`] points to the next
/// one, so there is no separate list structure to own.
pub(crate) struct Iter<'a> {
    current: Link,
    marker: PhantomData<&'a Header>,
}

impl Iter<'_> {
    /// **SAFETY**: every block reachable from `head` must be a valid header
    /// for as long as the iterator lives.
    pub unsafe fn new(head: Link) -> Self {
        Self {
            current: head,
            marker: PhantomData,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        unsafe {
            self.current = block.as_ref().next();
        }

        Some(block)
    }
}

/// Snapshot of one block, as seen by [`crate::Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Start of the block header.
    pub header: NonNull<u8>,
    /// Start of the content, what users get back from allocation.
    pub payload: NonNull<u8>,
    /// Size of the content in bytes.
    pub size: usize,
    pub is_free: bool,
}

/// Iterator over the blocks of a heap. See [`crate::Heap::blocks`].
pub struct Blocks<'a> {
    iter: Iter<'a>,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(iter: Iter<'a>) -> Self {
        Self { iter }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.iter.next()?;

        unsafe {
            let header = block.as_ref();

            Some(BlockInfo {
                header: block.cast(),
                payload: Header::payload(block),
                size: header.size(),
                is_free: header.is_free,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{self, HEADER_SIZE};
    use std::ptr;

    #[test]
    fn empty_list_yields_nothing() {
        let mut iter = unsafe { Iter::new(None) };

        assert!(iter.next().is_none());
    }

    #[test]
    fn walks_in_address_order() {
        let mut memory = [0u32; 128];
        let head = NonNull::new(memory.as_mut_ptr().cast::<Header>()).unwrap();

        let blocks: Vec<_> = unsafe {
            head.as_ptr().write(Header {
                size: 256,
                next: None,
                prev: None,
                is_free: false,
                self_ref: ptr::null_mut(),
            });
            let rest = block::split(head, 16);
            block::split(rest, 32);

            Blocks::new(Iter::new(Some(head))).collect()
        };

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].header, head.cast());
        assert_eq!(blocks[0].size, 16);
        assert!(!blocks[0].is_free);
        assert_eq!(blocks[1].size, 32);
        assert!(blocks[1].is_free);
        assert_eq!(blocks[2].size, 256 - 16 - 32 - 2 * HEADER_SIZE);

        for pair in blocks.windows(2) {
            assert_eq!(pair[0].payload, unsafe { pair[0].header.add(HEADER_SIZE) });
            assert!(pair[0].header < pair[1].header);
        }
    }
}
