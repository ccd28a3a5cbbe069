//! Helper functions shared by the rest of the allocator.
//!
//! Nothing in this file may allocate. Fatal reporting in particular runs
//! while our own bookkeeping is suspect, so it writes to the error stream
//! with one raw OS call and then exits through the lowest-level primitive
//! available, without unwinding.

use std::ffi::CStr;

/// It aligns `to_be_aligned` using `alignment`, rounding up.
///
/// `alignment` must be a power of two. Chunk sizes are kept multiples of
/// the machine word this way, so every payload pointer we hand out is
/// suitably aligned for any scalar type.
pub(crate) fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Terminates the process when `condition` does not hold.
///
/// This backs the linkage and ordering checks of the free-block list. A
/// failed check means the in-band metadata is corrupted and no further
/// operation on it is sound.
pub(crate) fn die_unless(condition: bool, msg: &'static CStr) {
    if !condition {
        die(msg);
    }
}

/// Writes `msg` to the error stream and exits immediately.
pub(crate) fn die(msg: &'static CStr) -> ! {
    raw_stderr(msg);

    #[cfg(unix)]
    unsafe {
        libc::_exit(1)
    }

    #[cfg(not(unix))]
    std::process::abort()
}

/// Best-effort diagnostic that bypasses `std::io`.
///
/// The standard stream handles are lazily set up on the heap. When this
/// crate is the allocator behind that heap, touching them from inside an
/// allocation path can recurse, so the message goes straight to the OS.
pub(crate) fn raw_stderr(msg: &'static CStr) {
    #[cfg(unix)]
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr().cast(),
            msg.to_bytes().len(),
        );
    }

    #[cfg(windows)]
    unsafe {
        use windows::Win32::System::Diagnostics::Debug::OutputDebugStringA;
        use windows::core::PCSTR;

        OutputDebugStringA(PCSTR::from_raw(msg.as_ptr().cast()));
    }
}
