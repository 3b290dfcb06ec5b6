//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

use crate::block::ALIGNMENT;

/// It aligns `to_be_aligned` using `aligment`.
///
/// `aligment` must be a power of two. This is used to round payload sizes up to
/// [`ALIGNMENT`] and, on Windows, to round the emulated program break up to a
/// page boundary.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Rounds a requested payload size up to the next multiple of [`ALIGNMENT`].
///
/// A zero sized request still gets a 4 byte payload, so every block can hold
/// at least one word of user data.
#[inline]
pub fn align4(size: usize) -> usize {
    align(size.max(1), ALIGNMENT)
}
