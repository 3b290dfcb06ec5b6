use derive_more::{Display, Error};

/// Reasons an allocation request can't be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum AllocError {
    /// The program break refused to grow.
    #[display("heap boundary cannot grow")]
    OutOfMemory,
    /// The pointer was not handed out by this heap, or was already released.
    #[display("pointer was not allocated by this heap")]
    InvalidPointer,
    /// The requested size doesn't fit in the address space.
    #[display("requested size overflows")]
    SizeOverflow,
}

/// A broken invariant found while walking the block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("{kind} at block {address:#x}")]
pub struct Corruption {
    /// Address of the offending block header.
    pub address: usize,
    pub kind: CorruptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CorruptionKind {
    #[display("header is not aligned")]
    Misaligned,
    #[display("payload size is not aligned")]
    UnalignedSize,
    #[display("blocks are out of address order")]
    OutOfOrder,
    #[display("block overlaps its successor")]
    Overlap,
    #[display("back link does not match the forward list")]
    BrokenBackLink,
    #[display("two adjacent blocks are free")]
    AdjacentFree,
    #[display("free block still carries a self reference")]
    StaleSelfRef,
    #[display("allocated block lost its self reference")]
    MissingSelfRef,
    #[display("block extends past the program break")]
    PastBreak,
}
