//! Platform-dependant acquisition and release of raw memory mappings.
//!
//! Everything above this file treats the OS as a supplier of
//! zero-initialized, writable byte regions. One mapping backs one
//! [`Region`](crate::region::Region), and a mapping is released exactly
//! once, when its region drains completely.

use std::ptr::NonNull;

pub(crate) trait PlatformMemory {
    /// Asks the OS for a fresh mapping of `len` bytes.
    ///
    /// Returns `None` when the OS refuses; the allocator surfaces that as
    /// a failed allocation rather than an error value.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Hands a mapping back to the OS and reports whether the OS accepted
    /// it. A refused release of a region we believe to be empty leaves the
    /// registry slot unusable, so the caller treats `false` as fatal.
    unsafe fn return_memory(addr: *mut u8, len: usize) -> bool;
}

/// The allocator's single gateway to the operating system. The actual
/// system calls live in the platform modules below.
pub(crate) struct Kernel;

/// Wrapper to use [`Kernel::request_memory`]
#[inline]
pub(crate) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::request_memory(len) }
}

/// Wrapper to use [`Kernel::return_memory`]
#[inline]
pub(crate) unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
    unsafe { Kernel::return_memory(addr, len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    None
                } else {
                    Some(NonNull::new_unchecked(addr).cast::<u8>())
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) -> bool {
            unsafe { munmap(addr as *mut c_void, len as size_t) == 0 }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::os::raw::c_void;
    use std::ptr::NonNull;

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::Memory;

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) -> bool {
            unsafe { Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE).is_ok() }
        }
    }
}
