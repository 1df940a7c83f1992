// addr.rs - Guest/host address translation
//
// Guest memory lives at a fixed offset inside the host address space, so a
// guest address becomes a host pointer with a single add. Generated code bakes
// the same constant in, which is why it cannot be configured at runtime.

use std::fmt;

/// Distance between a guest address and the host address backing it.
pub const GUEST_MEMORY_OFFSET: u64 = 0x0888_0000_0000;

/// An address in the emulated program's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GuestAddr(pub u64);

/// An address in the emulator process's own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HostAddr(pub u64);

impl GuestAddr {
    pub const fn to_host(self) -> HostAddr {
        HostAddr(self.0.wrapping_add(GUEST_MEMORY_OFFSET))
    }

    pub const fn offset(self, delta: i64) -> GuestAddr {
        GuestAddr(self.0.wrapping_add(delta as u64))
    }
}

impl HostAddr {
    pub const fn to_guest(self) -> GuestAddr {
        GuestAddr(self.0.wrapping_sub(GUEST_MEMORY_OFFSET))
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

pub const fn to_host(addr: u64) -> u64 {
    GuestAddr(addr).to_host().0
}

pub const fn to_guest(addr: u64) -> u64 {
    HostAddr(addr).to_guest().0
}

/// Round `val` up to a multiple of `align` (a power of two). Zero means no alignment.
pub const fn round_up(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    (val.wrapping_add(align - 1)) & !(align - 1)
}

/// Round `val` down to a multiple of `align` (a power of two).
pub const fn round_down(val: u64, align: u64) -> u64 {
    if align == 0 {
        return val;
    }
    val & !(align - 1)
}

/// Host page size.
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

/// Read a value from guest memory.
///
/// # Safety
///
/// The translated range must be mapped and readable.
pub unsafe fn read<T: Copy>(addr: GuestAddr) -> T {
    std::ptr::read_unaligned(addr.to_host().as_ptr::<T>())
}

/// Write a value to guest memory.
///
/// # Safety
///
/// The translated range must be mapped and writable.
pub unsafe fn write<T: Copy>(addr: GuestAddr, val: T) {
    std::ptr::write_unaligned(addr.to_host().as_mut_ptr::<T>(), val)
}
