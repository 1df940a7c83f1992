// elf.rs - ELF header validation for RISC-V executables
//
// Uses goblin for parsing, extracts the loadable segments the MMU maps.

use crate::addr::{self, GUEST_MEMORY_OFFSET};
use crate::error::{Error, Result};
use goblin::elf::{header, program_header, Elf};

/// Information about a validated ELF
#[derive(Debug, Clone)]
pub struct ElfInfo {
    pub entry: u64,
    pub is_pie: bool,
    pub segments: Vec<Segment>,
}

/// A loadable segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub filesz: u64,
    pub offset: u64,
    pub flags: u32,
}

impl Segment {
    /// Host page protection for this segment's `PF_*` flags.
    pub fn prot(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.flags & program_header::PF_R != 0 {
            prot |= libc::PROT_READ;
        }
        if self.flags & program_header::PF_W != 0 {
            prot |= libc::PROT_WRITE;
        }
        if self.flags & program_header::PF_X != 0 {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Parse ELF and extract metadata.
///
/// Every check runs before the caller maps anything, so a rejected file leaves
/// the address space untouched.
pub fn parse(data: &[u8]) -> Result<ElfInfo> {
    // Check magic before handing the bytes to goblin so the error names the problem
    if data.len() < header::SELFMAG || &data[..header::SELFMAG] != header::ELFMAG {
        return Err(Error::BadMagic);
    }

    // Check 64-bit
    let class = data.get(header::EI_CLASS).copied().unwrap_or(0);
    if class != header::ELFCLASS64 {
        return Err(Error::NotElf64(class));
    }

    let elf = Elf::parse(data)?;

    // Verify RISC-V architecture
    if elf.header.e_machine != header::EM_RISCV {
        return Err(Error::NotRiscv(elf.header.e_machine));
    }

    // There is no dynamic loader; only static (or static-pie) images run.
    if let Some(interp) = elf.interpreter {
        return Err(Error::DynamicallyLinked(interp.to_string()));
    }
    let is_pie = elf.header.e_type == header::ET_DYN;
    let page = addr::page_size();

    let mut segments = Vec::new();
    for ph in elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == program_header::PT_LOAD)
    {
        let end = ph.p_offset.checked_add(ph.p_filesz);
        match end {
            Some(end) if end <= data.len() as u64 => {}
            _ => {
                return Err(Error::SegmentOutOfBounds {
                    vaddr: ph.p_vaddr,
                    offset: ph.p_offset,
                    end: end.unwrap_or(u64::MAX),
                })
            }
        }
        let memsz = ph.p_memsz.max(ph.p_filesz);
        // The mapping ends at the page-rounded host address of the last byte.
        let host_end = ph
            .p_vaddr
            .checked_add(memsz)
            .and_then(|end| end.checked_add(GUEST_MEMORY_OFFSET))
            .and_then(|end| end.checked_add(page - 1));
        if host_end.is_none() {
            return Err(Error::SegmentTooLarge {
                vaddr: ph.p_vaddr,
                memsz,
            });
        }
        segments.push(Segment {
            vaddr: ph.p_vaddr,
            memsz,
            filesz: ph.p_filesz,
            offset: ph.p_offset,
            flags: ph.p_flags,
        });
    }

    Ok(ElfInfo {
        entry: elf.entry,
        is_pie,
        segments,
    })
}
