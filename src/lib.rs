//! # brkalloc
//!
//! A `malloc` style allocator that manages memory directly on top of the
//! program break, the end of the process heap that `sbrk(2)` moves forward and
//! back.
//!
//! Every allocation is a block: a small header followed by the content handed
//! to the user. Blocks sit back to back, in address order, from the first one
//! up to the break.
//!
//! ```text
//! +-------------------------------+
//! | Header   | Actual memory block|
//! +-------------------------------+
//!            ^
//!            +-- pointer returned to the user
//! ```
//!
//! The four operations mirror the C API:
//!
//! | C         | [`Heap`]                   |
//! |-----------|----------------------------|
//! | `malloc`  | [`Heap::allocate`]         |
//! | `calloc`  | [`Heap::zero_allocate`]    |
//! | `realloc` | [`Heap::resize`]           |
//! | `free`    | [`Heap::release`]          |
//!
//! ```rust,ignore
//! use brkalloc::Heap;
//!
//! let mut heap = Heap::process().expect("nobody else owns the break");
//!
//! let ptr = heap.allocate(10)?;
//! let ptr = heap.resize(Some(ptr), 80)?;
//! heap.release(Some(ptr));
//! ```
//!
//! The allocator is single threaded. A [`Heap`] owns all its state, so tests
//! and embedders can run any number of them over an [`Arena`] instead of the
//! real process break, which only one heap at a time can own.

mod arena;
mod block;
mod error;
mod freelist;
mod heap;
mod kernel;
mod list;
pub mod trace;
mod utils;

pub use arena::Arena;
pub use error::{AllocError, Corruption, CorruptionKind};
pub use heap::Heap;
pub use kernel::{DefaultBreak, ProgramBreak};
pub use list::{BlockInfo, Blocks};
pub use trace::{Event, LogTrace, NoTrace, Recorder, Trace};

#[cfg(unix)]
pub use kernel::Sbrk;

#[cfg(windows)]
pub use kernel::VirtualBreak;
