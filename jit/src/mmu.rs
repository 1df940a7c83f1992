// mmu.rs - Guest memory: ELF image loading and the bump allocator
//
// Layout of the guest address space once a program is loaded:
//
//                     | host_alloc (page aligned)
//   [   ELF image     |  heap / stack / argv  ...  ]
//                     | base           | alloc
//
// Everything is mapped at `GUEST_MEMORY_OFFSET` above the guest address, so
// translated and interpreted code can reach guest memory without a lookup.

use crate::addr::{self, GuestAddr, HostAddr};
use crate::elf::{self, ElfInfo, Segment};
use crate::error::{Error, Result};
use std::ops::Range;
use tracing::{debug, info};

#[cfg(target_os = "linux")]
const MAP_FIXED_HERE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_FIXED_HERE: libc::c_int = libc::MAP_FIXED;

/// A host range mapped for one loadable segment.
#[derive(Debug, Clone)]
struct Mapping {
    range: Range<u64>,
    prot: libc::c_int,
}

/// Guest memory manager.
#[derive(Debug)]
pub struct Mmu {
    /// Program entry point
    entry: GuestAddr,
    /// Lowest address the allocator may hand out (first page after the image)
    base: GuestAddr,
    /// Allocation cursor
    alloc: GuestAddr,
    /// End of the host mapping backing the allocator
    host_alloc: HostAddr,
    /// Image segments, in load order
    segments: Vec<Mapping>,
    page: u64,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    /// An empty address space. Load a program before allocating.
    pub fn new() -> Self {
        Self {
            entry: GuestAddr(0),
            base: GuestAddr(0),
            alloc: GuestAddr(0),
            host_alloc: GuestAddr(0).to_host(),
            segments: Vec::new(),
            page: addr::page_size(),
        }
    }

    /// An address space without an image whose allocator starts at `base`
    /// (rounded up to a page).
    pub fn at(base: GuestAddr) -> Self {
        let page = addr::page_size();
        let base = GuestAddr(addr::round_up(base.0, page));
        Self {
            entry: base,
            base,
            alloc: base,
            host_alloc: base.to_host(),
            segments: Vec::new(),
            page,
        }
    }

    pub fn entry(&self) -> GuestAddr {
        self.entry
    }

    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// Current allocation cursor (the guest "program break").
    pub fn cursor(&self) -> GuestAddr {
        self.alloc
    }

    pub fn host_alloc(&self) -> HostAddr {
        self.host_alloc
    }

    pub fn page_size(&self) -> u64 {
        self.page
    }

    /// Validate an ELF image and map its `PT_LOAD` segments.
    pub fn load_elf(&mut self, data: &[u8]) -> Result<ElfInfo> {
        if self.alloc != self.base {
            return Err(Error::Invariant(
                "cannot load an image after the allocator has been used".into(),
            ));
        }
        let info = elf::parse(data)?;

        for seg in &info.segments {
            self.load_segment(seg, data)?;
        }
        self.entry = GuestAddr(info.entry);

        info!(
            entry = %self.entry,
            segments = info.segments.len(),
            pie = info.is_pie,
            base = %self.base,
            "loaded elf image"
        );
        Ok(info)
    }

    fn load_segment(&mut self, seg: &Segment, data: &[u8]) -> Result<()> {
        let page = self.page;
        let vaddr = addr::to_host(seg.vaddr);
        let aligned = addr::round_down(vaddr, page);
        let end = addr::round_up(vaddr + seg.memsz, page);
        let prot = seg.prot();

        // Segments may share their boundary page with the previous one.
        let shared = self
            .segments
            .iter()
            .find(|m| m.range.contains(&aligned))
            .map(|m| (m.range.end, m.prot));
        let map_start = shared.map_or(aligned, |(e, _)| e.max(aligned));

        if map_start < end {
            map_anonymous(map_start, end - map_start, libc::PROT_READ | libc::PROT_WRITE)?;
        }
        protect(aligned, end - aligned, libc::PROT_READ | libc::PROT_WRITE)?;

        // The anonymous mapping is already zero, which covers the bss tail.
        let file = &data[seg.offset as usize..(seg.offset + seg.filesz) as usize];
        // SAFETY: [vaddr, vaddr + filesz) lies inside the writable mapping above.
        unsafe {
            std::ptr::copy_nonoverlapping(file.as_ptr(), vaddr as usize as *mut u8, file.len());
        }

        protect(aligned, end - aligned, prot)?;
        if let Some((shared_end, shared_prot)) = shared {
            let len = shared_end.min(end) - aligned;
            protect(aligned, len, prot | shared_prot)?;
        }

        debug!(
            vaddr = format_args!("0x{:x}", seg.vaddr),
            filesz = seg.filesz,
            memsz = seg.memsz,
            flags = seg.flags,
            "mapped segment"
        );

        self.segments.push(Mapping {
            range: aligned..end,
            prot,
        });
        self.host_alloc = HostAddr(self.host_alloc.0.max(end));
        self.base = self.host_alloc.to_guest();
        self.alloc = self.base;
        Ok(())
    }

    /// Move the allocation cursor by `size` bytes and return its previous value.
    ///
    /// Growing maps fresh zeroed pages at the high-water mark when the cursor
    /// passes it; shrinking unmaps the pages no longer covering the cursor.
    pub fn alloc(&mut self, size: i64) -> Result<GuestAddr> {
        let prev = self.alloc;
        let next = match prev.0.checked_add_signed(size) {
            Some(next) if next >= self.base.0 => GuestAddr(next),
            _ => {
                return Err(Error::Invariant(format!(
                    "alloc({size}) moves cursor {prev} below base {}",
                    self.base
                )))
            }
        };

        let wanted = addr::round_up(next.to_host().0, self.page);
        if size > 0 && next.to_host() > self.host_alloc {
            let len = wanted - self.host_alloc.0;
            map_anonymous(self.host_alloc.0, len, libc::PROT_READ | libc::PROT_WRITE)?;
            self.host_alloc = HostAddr(wanted);
        } else if size < 0 && wanted < self.host_alloc.0 {
            let len = self.host_alloc.0 - wanted;
            unmap(wanted, len)?;
            self.host_alloc = HostAddr(wanted);
        }

        self.alloc = next;
        Ok(prev)
    }

    /// Copy `data` into guest memory at `addr`.
    pub fn write(&self, addr: GuestAddr, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len() as u64, true)?;
        // SAFETY: check_range verified the whole range is mapped writable by us.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr.to_host().as_mut_ptr(), data.len());
        }
        Ok(())
    }

    /// Copy guest memory at `addr` into `buf`.
    pub fn read(&self, addr: GuestAddr, buf: &mut [u8]) -> Result<()> {
        self.check_range(addr, buf.len() as u64, false)?;
        // SAFETY: check_range verified the whole range is mapped readable by us.
        unsafe {
            std::ptr::copy_nonoverlapping(addr.to_host().as_ptr(), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn write_u64(&self, addr: GuestAddr, val: u64) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }

    pub fn read_u64(&self, addr: GuestAddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Is `[addr, addr + len)` backed by memory this MMU mapped?
    pub fn contains(&self, addr: GuestAddr, len: u64) -> bool {
        self.check_range(addr, len, false).is_ok()
    }

    fn check_range(&self, addr: GuestAddr, len: u64, write: bool) -> Result<()> {
        let unmapped = Error::Unmapped { addr: addr.0, len };
        let start = addr.to_host().0;
        let Some(end) = start.checked_add(len) else {
            return Err(unmapped);
        };

        let heap = self.base.to_host().0..self.host_alloc.0;
        if start >= heap.start && end <= heap.end {
            return Ok(());
        }
        let need = if write { libc::PROT_WRITE } else { libc::PROT_READ };
        let in_segment = self
            .segments
            .iter()
            .any(|m| start >= m.range.start && end <= m.range.end && m.prot & need != 0);
        if in_segment {
            Ok(())
        } else {
            Err(unmapped)
        }
    }
}

impl Drop for Mmu {
    fn drop(&mut self) {
        let heap_start = self.base.to_host().0;
        if self.host_alloc.0 > heap_start {
            let _ = unmap(heap_start, self.host_alloc.0 - heap_start);
        }
        for m in &self.segments {
            let _ = unmap(m.range.start, m.range.end - m.range.start);
        }
    }
}

fn map_anonymous(host: u64, len: u64, prot: libc::c_int) -> Result<()> {
    // SAFETY: maps fresh anonymous pages; MAP_FIXED_HERE refuses to replace
    // existing mappings on Linux, and the result is checked below everywhere.
    let ptr = unsafe {
        libc::mmap(
            host as usize as *mut libc::c_void,
            len as usize,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_FIXED_HERE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::map("mmap", host, len));
    }
    if ptr as u64 != host {
        // Old kernels treat MAP_FIXED_NOREPLACE as a hint.
        // SAFETY: unmapping the region we just received.
        unsafe { libc::munmap(ptr, len as usize) };
        return Err(Error::Map {
            op: "mmap",
            addr: host,
            len,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        });
    }
    Ok(())
}

fn unmap(host: u64, len: u64) -> Result<()> {
    // SAFETY: callers only unmap ranges this module mapped.
    if unsafe { libc::munmap(host as usize as *mut libc::c_void, len as usize) } != 0 {
        return Err(Error::map("munmap", host, len));
    }
    Ok(())
}

fn protect(host: u64, len: u64, prot: libc::c_int) -> Result<()> {
    // SAFETY: callers only change protection on ranges this module mapped.
    if unsafe { libc::mprotect(host as usize as *mut libc::c_void, len as usize, prot) } != 0 {
        return Err(Error::map("mprotect", host, len));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn is_mapped(host: u64) -> bool {
    let page = addr::page_size();
    let aligned = addr::round_down(host, page);
    // SAFETY: msync only inspects the mapping; ENOMEM means unmapped.
    unsafe { libc::msync(aligned as usize as *mut libc::c_void, page as usize, libc::MS_ASYNC) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testutil::ElfBuilder;
    use goblin::elf::program_header::{PF_R, PF_W, PF_X};

    // Each test owns a distinct guest window so parallel tests never overlap.
    const WINDOW: u64 = 0x1000_0000;

    #[test]
    fn test_load_segment_and_bss() {
        let vaddr = WINDOW + 0x10_0000;
        let code = [0x13u8, 0x05, 0xa0, 0x02, 0x73, 0, 0, 0];
        let image = ElfBuilder::riscv(vaddr)
            .segment(vaddr, &code, 0x2000, PF_R | PF_W | PF_X)
            .build();

        let mut mmu = Mmu::new();
        let info = mmu.load_elf(&image).unwrap();
        assert_eq!(info.entry, vaddr);
        assert_eq!(mmu.entry(), GuestAddr(vaddr));

        let mut buf = [0xffu8; 16];
        mmu.read(GuestAddr(vaddr), &mut buf).unwrap();
        assert_eq!(&buf[..8], &code);
        assert_eq!(&buf[8..], &[0u8; 8]);
        assert_eq!(mmu.read_u64(GuestAddr(vaddr + 0x1ff8)).unwrap(), 0);

        let end = vaddr + 0x2000;
        assert_eq!(mmu.base(), GuestAddr(addr::round_up(end, mmu.page_size())));
        assert_eq!(mmu.cursor(), mmu.base());
    }

    #[test]
    fn test_unaligned_segment_start() {
        let vaddr = WINDOW + 0x20_0123;
        let image = ElfBuilder::riscv(vaddr)
            .segment(vaddr, b"hello", 0x40, PF_R)
            .build();
        let mut mmu = Mmu::new();
        mmu.load_elf(&image).unwrap();

        let mut buf = [0u8; 6];
        mmu.read(GuestAddr(vaddr), &mut buf).unwrap();
        assert_eq!(&buf, b"hello\0");
        // Read-only segment refuses writes through the MMU.
        assert!(mmu.write(GuestAddr(vaddr), b"x").is_err());
    }

    #[test]
    fn test_invalid_elf_maps_nothing() {
        let vaddr = WINDOW + 0x30_0000;
        let mut bad_machine = ElfBuilder::riscv(vaddr).segment(vaddr, &[1, 2, 3, 4], 4, PF_R);
        bad_machine.machine = crate::elf::testutil::EM_X86_64;
        let mut bad_class = ElfBuilder::riscv(vaddr).segment(vaddr, &[1, 2, 3, 4], 4, PF_R);
        bad_class.class = 1;
        let mut bad_magic = ElfBuilder::riscv(vaddr)
            .segment(vaddr, &[1, 2, 3, 4], 4, PF_R)
            .build();
        bad_magic[1] = b'X';

        for image in [bad_machine.build(), bad_class.build(), bad_magic] {
            let mut mmu = Mmu::new();
            assert!(mmu.load_elf(&image).is_err());
            assert!(!is_mapped(addr::to_host(vaddr)));
            assert_eq!(mmu.base(), GuestAddr(0));
        }
    }

    #[test]
    fn test_segments_sharing_a_page() {
        let vaddr = WINDOW + 0x90_0000;
        let text: Vec<u8> = (0..0x1100u32).map(|i| (i % 251) as u8).collect();
        let data_at = vaddr + 0x1100;
        let image = ElfBuilder::riscv(vaddr)
            .segment(vaddr, &text, text.len() as u64, PF_R | PF_X)
            .segment(data_at, &[0xab; 0x10], 0x200, PF_R | PF_W)
            .build();

        let mut mmu = Mmu::new();
        let info = mmu.load_elf(&image).unwrap();
        assert_eq!(info.segments.len(), 2);

        // The tail of the text survives the data segment being mapped over it.
        let mut tail = [0u8; 0x10];
        mmu.read(GuestAddr(vaddr + 0x10f0), &mut tail).unwrap();
        assert_eq!(&tail, &text[0x10f0..]);

        let mut data = [0u8; 0x10];
        mmu.read(GuestAddr(data_at), &mut data).unwrap();
        assert_eq!(data, [0xab; 0x10]);
        mmu.write_u64(GuestAddr(data_at), 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mmu.read_u64(GuestAddr(data_at)).unwrap(), 0x1122_3344_5566_7788);

        // bss after the file bytes is zero and writable
        let bss = GuestAddr(data_at + 0x1f8);
        assert_eq!(mmu.read_u64(bss).unwrap(), 0);
        mmu.write_u64(bss, 7).unwrap();
        assert_eq!(mmu.read_u64(bss).unwrap(), 7);
    }

    #[test]
    fn test_oversized_segment_maps_nothing() {
        let vaddr = WINDOW + 0xa0_0000;
        let image = ElfBuilder::riscv(vaddr)
            .segment(vaddr, &[0x13, 0, 0, 0], 4, PF_R | PF_X)
            .segment(vaddr + 0x1000, &[], u64::MAX - 0x10, PF_R | PF_W)
            .build();

        let mut mmu = Mmu::new();
        assert!(matches!(
            mmu.load_elf(&image),
            Err(Error::SegmentTooLarge { .. })
        ));
        assert!(!is_mapped(addr::to_host(vaddr)));
    }

    #[test]
    fn test_alloc_grows_and_returns_previous_cursor() {
        let mut mmu = Mmu::at(GuestAddr(WINDOW + 0x40_0000));
        let base = mmu.base();
        let page = mmu.page_size();

        let a = mmu.alloc(100).unwrap();
        assert_eq!(a, base);
        assert_eq!(mmu.cursor(), GuestAddr(base.0 + 100));
        assert_eq!(mmu.host_alloc(), HostAddr(base.to_host().0 + page));

        // Fits in the already mapped page: no growth.
        let b = mmu.alloc(200).unwrap();
        assert_eq!(b, GuestAddr(base.0 + 100));
        assert_eq!(mmu.host_alloc(), HostAddr(base.to_host().0 + page));

        let c = mmu.alloc(3 * page as i64).unwrap();
        assert_eq!(c, GuestAddr(base.0 + 300));
        assert!(mmu.host_alloc().0 >= addr::round_up(mmu.cursor().to_host().0, page));
        mmu.write_u64(GuestAddr(mmu.cursor().0 - 8), 0xdead_beef).unwrap();
        assert_eq!(mmu.read_u64(GuestAddr(mmu.cursor().0 - 8)).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_alloc_shrink_keeps_cursor_page() {
        let mut mmu = Mmu::at(GuestAddr(WINDOW + 0x50_0000));
        let base = mmu.base();
        let page = mmu.page_size();

        mmu.alloc(4 * page as i64).unwrap();
        assert!(is_mapped(base.to_host().0 + 3 * page));

        mmu.alloc(-(2 * page as i64) - 10).unwrap();
        let cursor = mmu.cursor();
        assert_eq!(cursor, GuestAddr(base.0 + 2 * page - 10));
        assert_eq!(mmu.host_alloc(), HostAddr(base.to_host().0 + 2 * page));
        assert!(is_mapped(cursor.to_host().0 - 1));
        assert!(!is_mapped(base.to_host().0 + 3 * page));
    }

    #[test]
    fn test_alloc_never_below_base() {
        let mut mmu = Mmu::at(GuestAddr(WINDOW + 0x60_0000));
        let base = mmu.base();
        let page = mmu.page_size() as i64;

        for step in [10, page, -5, 3 * page, -(2 * page), 7, -(page + 12)] {
            mmu.alloc(step).unwrap();
            assert!(mmu.cursor() >= base);
            let covered = addr::round_up(mmu.cursor().to_host().0, page as u64);
            assert!(mmu.host_alloc().0 >= covered);
        }

        let before = mmu.cursor();
        let err = mmu.alloc(-(before.0 as i64 - base.0 as i64) - 1).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(mmu.cursor(), before);
    }

    #[test]
    fn test_write_outside_mapping_fails() {
        let mmu = Mmu::at(GuestAddr(WINDOW + 0x70_0000));
        assert!(matches!(
            mmu.write(mmu.base(), &[1, 2, 3]),
            Err(Error::Unmapped { .. })
        ));
        assert!(!mmu.contains(GuestAddr(u64::MAX - 2), 8));
    }

    #[test]
    fn test_drop_unmaps() {
        let base = GuestAddr(WINDOW + 0x80_0000);
        {
            let mut mmu = Mmu::at(base);
            mmu.alloc(100).unwrap();
            assert!(is_mapped(base.to_host().0));
        }
        assert!(!is_mapped(base.to_host().0));
    }
}
