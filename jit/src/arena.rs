// arena.rs - Executable memory for translated blocks
//
// One read/write/execute mapping, carved up by a bump offset. Blocks are never
// freed individually; the whole arena goes away with the cache that owns it.

use crate::error::CacheError;
use std::ptr::NonNull;

/// Entry point of a block of host code inside an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(NonNull<u8>);

impl CodePtr {
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr()
    }
}

pub struct ExecArena {
    base: NonNull<u8>,
    capacity: usize,
    /// First free byte; only ever grows
    offset: usize,
}

impl ExecArena {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CacheError::ArenaMap {
                size: capacity,
                source: std::io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| CacheError::ArenaMap {
            size: capacity,
            source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
        })?;
        Ok(Self {
            base,
            capacity,
            offset: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far, alignment padding included.
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Copy `code` to the next `align`-aligned offset and make it executable.
    /// Returns the offset it was placed at.
    pub fn push(&mut self, code: &[u8], align: usize) -> Result<usize, CacheError> {
        let start = align_to(self.offset, align);
        let end = start.checked_add(code.len());
        match end {
            Some(end) if end <= self.capacity => {}
            _ => {
                return Err(CacheError::ArenaExhausted {
                    needed: code.len(),
                    offset: start,
                    capacity: self.capacity,
                })
            }
        }

        // SAFETY: [start, start + len) is inside the mapping and not yet handed out.
        unsafe {
            let dst = self.base.as_ptr().add(start);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            flush_icache(dst, code.len());
        }
        self.offset = start + code.len();
        Ok(start)
    }

    pub fn code_ptr(&self, offset: usize) -> CodePtr {
        debug_assert!(offset <= self.capacity);
        // SAFETY: offset is within the mapping, so the pointer is non-null.
        CodePtr(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Offset of `ptr` from the arena base.
    pub fn offset_of(&self, ptr: CodePtr) -> usize {
        ptr.as_ptr() as usize - self.base.as_ptr() as usize
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

fn align_to(val: usize, align: usize) -> usize {
    debug_assert!(align == 0 || align.is_power_of_two(), "alignment {align} is not a power of two");
    if align == 0 {
        return val;
    }
    (val + align - 1) & !(align - 1)
}

/// Make freshly written code visible to instruction fetch.
#[cfg(any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64"))]
unsafe fn flush_icache(start: *mut u8, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    __clear_cache(start as *mut libc::c_char, start.add(len) as *mut libc::c_char);
}

/// x86 keeps instruction and data caches coherent; only order the stores.
#[cfg(not(any(target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")))]
unsafe fn flush_icache(_start: *mut u8, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
