use std::ptr::NonNull;

/// This trait provides an abstraction over the program break, the end of the
/// contiguous heap region a process grows with `sbrk(2)`. As the allocator, our
/// top level view of this has nothing to do with the concrete syscall, so the
/// heap is generic over it.
pub trait ProgramBreak {
    /// Moves the break by `increment` bytes and returns the break as it was
    /// before the call, or `None` if the break cannot move that far.
    ///
    /// An `increment` of zero just reads the current break.
    ///
    /// **SAFETY**: shrinking hands memory back. The caller must not touch
    /// anything past the new break afterwards.
    unsafe fn sbrk(&mut self, increment: isize) -> Option<NonNull<u8>>;
}

#[cfg(unix)]
pub use self::unix::Sbrk;

#[cfg(windows)]
pub use self::windows::VirtualBreak;

/// Program break of the running platform.
#[cfg(unix)]
pub type DefaultBreak = Sbrk;

/// Program break of the running platform.
#[cfg(windows)]
pub type DefaultBreak = VirtualBreak;

#[cfg(unix)]
mod unix {
    use super::ProgramBreak;

    use libc::{c_void, intptr_t};

    use std::{
        ptr::NonNull,
        sync::atomic::{AtomicBool, Ordering},
    };

    static OWNED: AtomicBool = AtomicBool::new(false);

    /// The process break, moved with [`libc::sbrk`].
    ///
    /// There is a single break per process, so at most one [`Sbrk`] exists at
    /// a time. Anything else calling `sbrk` (including the libc allocator)
    /// still moves it.
    #[derive(Debug)]
    pub struct Sbrk {
        _owned: (),
    }

    impl Sbrk {
        /// Takes ownership of the process break, or returns `None` while
        /// another [`Sbrk`] is alive.
        pub fn acquire() -> Option<Self> {
            OWNED
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .ok()?;

            Some(Self { _owned: () })
        }
    }

    impl Drop for Sbrk {
        fn drop(&mut self) {
            OWNED.store(false, Ordering::Release);
        }
    }

    impl ProgramBreak for Sbrk {
        unsafe fn sbrk(&mut self, increment: isize) -> Option<NonNull<u8>> {
            unsafe {
                let addr = libc::sbrk(increment as intptr_t);

                // sbrk signals failure with `(void *) -1`.
                if addr == usize::MAX as *mut c_void {
                    return None;
                }

                NonNull::new(addr.cast::<u8>())
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::ProgramBreak;
    use crate::utils::align;

    use std::{mem::MaybeUninit, os::raw::c_void, ptr::{self, NonNull}};

    use windows::Win32::System::{Memory, SystemInformation};

    /// Windows has no program break, so we emulate one: a range of address
    /// space is reserved up front and pages are committed or decommitted as
    /// the break moves.
    ///
    /// ```text
    /// base            break        committed                 base + reserve
    ///  |                |              |                             |
    ///  +----------------+--------------+-----------------------------+
    ///  |      heap      |  read/write  |          reserved           |
    ///  +----------------+--------------+-----------------------------+
    /// ```
    #[derive(Debug)]
    pub struct VirtualBreak {
        base: *mut u8,
        reserve: usize,
        committed: usize,
        brk: usize,
        page_size: usize,
    }

    impl VirtualBreak {
        /// Address space reserved by [`VirtualBreak::new`], 1 GiB.
        pub const DEFAULT_RESERVE: usize = 1 << 30;

        pub const fn new() -> Self {
            Self::with_reserve(Self::DEFAULT_RESERVE)
        }

        /// Emulated break that can never grow past `reserve` bytes.
        /// Nothing is reserved until the break is first used.
        pub const fn with_reserve(reserve: usize) -> Self {
            Self {
                base: ptr::null_mut(),
                reserve,
                committed: 0,
                brk: 0,
                page_size: 0,
            }
        }

        unsafe fn reserve_range(&mut self) -> Option<()> {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                self.page_size = system_info.assume_init().dwPageSize as usize;

                let addr = Memory::VirtualAlloc(
                    None,
                    self.reserve,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_NOACCESS,
                );

                self.base = NonNull::new(addr.cast::<u8>())?.as_ptr();
                Some(())
            }
        }
    }

    impl Default for VirtualBreak {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProgramBreak for VirtualBreak {
        unsafe fn sbrk(&mut self, increment: isize) -> Option<NonNull<u8>> {
            unsafe {
                if self.base.is_null() {
                    self.reserve_range()?;
                }

                let old = self.brk;
                let new = old.checked_add_signed(increment)?;
                if new > self.reserve {
                    return None;
                }

                let needed = align(new, self.page_size);

                if needed > self.committed {
                    let addr = Memory::VirtualAlloc(
                        Some(self.base.add(self.committed) as *const c_void),
                        needed - self.committed,
                        Memory::MEM_COMMIT,
                        Memory::PAGE_READWRITE,
                    );

                    if addr.is_null() {
                        return None;
                    }
                } else if needed < self.committed {
                    Memory::VirtualFree(
                        self.base.add(needed) as *mut c_void,
                        self.committed - needed,
                        Memory::MEM_DECOMMIT,
                    )
                    .ok()?;
                }

                self.committed = needed;
                self.brk = new;

                NonNull::new(self.base.add(old))
            }
        }
    }
}

/// Blocks until the process break is free and takes it. Tests that drive
/// the real break go through here so they never run concurrently.
#[cfg(all(test, unix))]
pub(crate) fn exclusive_break() -> Sbrk {
    loop {
        if let Some(brk) = Sbrk::acquire() {
            return brk;
        }
        std::thread::yield_now();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn process_break_can_be_read() {
        let mut brk = exclusive_break();

        // Reading is harmless even with other threads allocating through libc.
        let current = unsafe { brk.sbrk(0) };

        assert!(current.is_some());
    }

    #[test]
    fn process_break_has_a_single_owner() {
        let brk = exclusive_break();

        assert!(Sbrk::acquire().is_none());
        assert!(Sbrk::acquire().is_none());

        drop(brk);
        let mut again = exclusive_break();
        assert!(unsafe { again.sbrk(0) }.is_some());
    }
}
