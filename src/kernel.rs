use std::ptr::NonNull;

/// Abstraction over the virtual memory operations the allocator needs
/// from the operating system. The allocator itself has nothing to do with
/// the concrete APIs offered by each kernel, it only ever asks for three
/// things: a fresh range of pages, returning a range of pages, and a hint
/// that the physical pages behind a range are currently unused.
///
/// Keeping this as a trait lets tests plug in a fake backend that
/// simulates memory exhaustion, which is otherwise very hard to trigger
/// on purpose.
pub trait PlatformMemory {
    /// Requests a memory region where `len` bytes can be written safely.
    /// Returns `None` only when the system is out of memory; any other
    /// failure aborts the process, because it means we handed the kernel
    /// garbage.
    unsafe fn reserve(len: usize) -> Option<NonNull<u8>>;

    /// Returns the `len` bytes starting at `addr` back to the kernel.
    /// `addr`/`len` must describe exactly one region previously obtained
    /// from [`PlatformMemory::reserve`].
    unsafe fn release(addr: NonNull<u8>, len: usize);

    /// Tells the kernel that the pages in `addr..addr + len` hold no data
    /// we care about, so it may reclaim the physical frames. The virtual
    /// range stays mapped and readable. Both `addr` and `len` must be
    /// page-aligned.
    unsafe fn advise_unused(addr: NonNull<u8>, len: usize);

    /// Virtual memory page size in bytes. 4096 on most computers, but we
    /// only know the real value at runtime.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformMemory`] for each OS.
pub struct Platform;

/// A failed release or advise means the heap metadata no longer matches
/// what the kernel thinks is mapped. Continuing would corrupt user data,
/// so we stop right here.
pub(crate) fn backend_failure(operation: &str) -> ! {
    log::error!("memory backend failure: {operation}");
    eprintln!("fitalloc: memory backend failure: {operation}");
    std::process::abort();
}

/// Poison a range that is about to be advised out. Freed payloads keep
/// their old bytes until the kernel reclaims the frames, which hides
/// use-after-free bugs in clients; the pattern makes them loud. Debug
/// builds only.
#[inline]
fn poison_unused(addr: NonNull<u8>, len: usize) {
    if cfg!(debug_assertions) {
        unsafe { addr.as_ptr().write_bytes(0x7e, len) };
    }
}

#[cfg(unix)]
mod unix {
    use std::os::raw::{c_int, c_void};
    use std::ptr::NonNull;

    use libc::{madvise, mmap, munmap, off_t, size_t};

    use super::{Platform, PlatformMemory, backend_failure, poison_unused};

    impl PlatformMemory for Platform {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => {
                        // Running out of memory is the caller's problem,
                        // anything else (bad length, fd, flags) is ours.
                        match std::io::Error::last_os_error().raw_os_error() {
                            Some(libc::ENOMEM) => None,
                            _ => backend_failure("mmap"),
                        }
                    }
                    addr => Some(NonNull::new_unchecked(addr).cast::<u8>()),
                }
            }
        }

        unsafe fn release(addr: NonNull<u8>, len: usize) {
            unsafe {
                if munmap(addr.as_ptr() as *mut c_void, len as size_t) < 0 {
                    backend_failure("munmap");
                }
            }
        }

        unsafe fn advise_unused(addr: NonNull<u8>, len: usize) {
            poison_unused(addr, len);
            unsafe {
                if madvise(addr.as_ptr() as *mut c_void, len as size_t, libc::MADV_DONTNEED) < 0 {
                    backend_failure("madvise");
                }
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformMemory, backend_failure, poison_unused};

    impl PlatformMemory for Platform {
        unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // Memory has to be reserved first and then committed in order
            // to become usable. We can do both with one single call.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn release(addr: NonNull<u8>, _len: usize) {
            unsafe {
                if Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE)
                    .is_err()
                {
                    backend_failure("VirtualFree");
                }
            }
        }

        unsafe fn advise_unused(addr: NonNull<u8>, len: usize) {
            poison_unused(addr, len);

            // MEM_RESET is the VirtualAlloc counterpart of MADV_DONTNEED:
            // the range stays committed but its contents may be dropped.
            unsafe {
                let addr = Memory::VirtualAlloc(
                    Some(addr.as_ptr() as *const c_void),
                    len,
                    Memory::MEM_RESET,
                    Memory::PAGE_READWRITE,
                );

                if addr.is_null() {
                    backend_failure("VirtualAlloc(MEM_RESET)");
                }
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = unsafe { Platform::page_size() };

        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn reserve_release_roundtrip() {
        unsafe {
            let len = Platform::page_size() * 2;
            let addr = Platform::reserve(len).unwrap();

            // Fresh pages must be writable end to end.
            addr.as_ptr().write_bytes(0xaa, len);
            assert_eq!(*addr.as_ptr().add(len - 1), 0xaa);

            Platform::release(addr, len);
        }
    }

    #[test]
    fn advise_unused_keeps_range_mapped() {
        unsafe {
            let len = Platform::page_size() * 4;
            let addr = Platform::reserve(len).unwrap();

            addr.as_ptr().write_bytes(0xff, len);
            Platform::advise_unused(addr, len);

            // The virtual range is still valid, contents are unspecified.
            let _ = std::ptr::read_volatile(addr.as_ptr());

            Platform::release(addr, len);
        }
    }
}
