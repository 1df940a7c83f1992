// error.rs - Error types for the translation runtime
//
// Input problems (bad ELF, unreadable file, failed host mapping) and resource
// limits (code cache) are ordinary error values. Broken runtime invariants get
// their own variant so callers can tell "the guest binary is bad" apart from
// "the emulator state is corrupt".

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ELF: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("bad elf file (magic mismatch)")]
    BadMagic,

    #[error("only riscv64 elf file is supported (ELF class {0}, expected 64-bit)")]
    NotElf64(u8),

    #[error("only riscv64 elf file is supported (e_machine=0x{0:x})")]
    NotRiscv(u16),

    #[error("segment at 0x{vaddr:x} reads file bytes 0x{offset:x}..0x{end:x} past end of image")]
    SegmentOutOfBounds { vaddr: u64, offset: u64, end: u64 },

    #[error("segment at 0x{vaddr:x} with memsz 0x{memsz:x} does not fit in the guest address space")]
    SegmentTooLarge { vaddr: u64, memsz: u64 },

    #[error("dynamically linked executables are not supported (interpreter {0})")]
    DynamicallyLinked(String),

    #[error("{op} at 0x{addr:x} (len 0x{len:x}) failed: {source}")]
    Map {
        op: &'static str,
        addr: u64,
        len: u64,
        source: std::io::Error,
    },

    #[error("guest range 0x{addr:x}..+0x{len:x} is not mapped by this MMU")]
    Unmapped { addr: u64, len: u64 },

    #[error("code cache: {0}")]
    Cache(#[from] CacheError),

    #[error("unsupported instruction 0x{bits:08x} at pc 0x{pc:x}")]
    Unsupported { pc: u64, bits: u32 },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Build a `Map` error from the current `errno`.
    pub(crate) fn map(op: &'static str, addr: u64, len: u64) -> Self {
        Error::Map {
            op,
            addr,
            len,
            source: std::io::Error::last_os_error(),
        }
    }

    /// True for errors that mean the runtime itself is in a bad state rather
    /// than the input being bad.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::Invariant(_) | Error::Cache(CacheError::ProbeLimit { .. }))
    }
}

/// Failures of the code cache and its executable arena.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("probe chain for pc 0x{pc:x} exceeded {limit} slots; table is full")]
    ProbeLimit { pc: u64, limit: usize },

    #[error("arena exhausted: need {needed} bytes at offset {offset}, capacity {capacity}")]
    ArenaExhausted {
        needed: usize,
        offset: usize,
        capacity: usize,
    },

    #[error("failed to map {size} byte executable arena: {source}")]
    ArenaMap {
        size: usize,
        source: std::io::Error,
    },
}
