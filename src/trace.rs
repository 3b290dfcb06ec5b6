//! Observation points of the heap.
//!
//! The heap never prints anything. Every interesting step is reported as an
//! [`Event`] to the [`Trace`] the heap was built with, which decides what to do
//! with it.

use log::{debug, trace};

/// Something that happened to the block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The locator found a free block of `size` bytes for a request.
    BlockFound { block: *const u8, size: usize },
    /// The break moved forward and a new block of `size` bytes was appended.
    HeapExtended { block: *const u8, size: usize },
    /// `block` was cut down to `size` bytes, leaving a free `remainder`.
    BlockSplit {
        block: *const u8,
        size: usize,
        remainder: *const u8,
        remainder_size: usize,
    },
    /// `block` absorbed its free successor and now holds `size` bytes.
    BlocksFused {
        block: *const u8,
        absorbed: *const u8,
        size: usize,
    },
    /// A user pointer went through validation.
    PointerValidated { ptr: *const u8, valid: bool },
    /// The free tail `block` was handed back, moving the break down by `released` bytes.
    HeapRetracted { block: *const u8, released: usize },
}

/// Receives the [`Event`]s emitted by a heap.
pub trait Trace {
    fn event(&mut self, event: Event);
}

/// Forwards events to the [`log`] crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTrace;

impl Trace for LogTrace {
    fn event(&mut self, event: Event) {
        match event {
            Event::BlockFound { block, size } => {
                trace!("found free block {block:p} ({size} bytes)");
            }
            Event::HeapExtended { block, size } => {
                debug!("extended heap with block {block:p} ({size} bytes)");
            }
            Event::BlockSplit {
                block,
                size,
                remainder,
                remainder_size,
            } => {
                trace!(
                    "split block {block:p} to {size} bytes, remainder {remainder:p} ({remainder_size} bytes)"
                );
            }
            Event::BlocksFused {
                block,
                absorbed,
                size,
            } => {
                trace!("fused {absorbed:p} into {block:p} ({size} bytes)");
            }
            Event::PointerValidated { ptr, valid: true } => {
                trace!("valid address {ptr:p}");
            }
            Event::PointerValidated { ptr, valid: false } => {
                debug!("rejected address {ptr:p}");
            }
            Event::HeapRetracted { block, released } => {
                debug!("retracted heap to {block:p} ({released} bytes released)");
            }
        }
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrace;

impl Trace for NoTrace {
    #[inline]
    fn event(&mut self, _event: Event) {}
}

/// Keeps every event in order of arrival.
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl Recorder {
    /// Removes and returns everything recorded so far.
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl Trace for Recorder {
    fn event(&mut self, event: Event) {
        self.events.push(event);
    }
}
