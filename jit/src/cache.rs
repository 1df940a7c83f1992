// cache.rs - Code cache: guest PC -> translated host code
//
// A fixed-size open-addressed table (linear probing, no deletion) that serves
// two purposes at once: it counts how often each block entry is reached, and
// once a block has been translated it records where the host code lives in the
// arena. A slot that only tracks hotness never produces a lookup hit.

use crate::addr::GuestAddr;
use crate::arena::{CodePtr, ExecArena};
use crate::error::CacheError;
use tracing::{debug, trace};

/// Number of table slots.
pub const CACHE_ENTRY_SIZE: usize = 64 * 1024;
/// Executable arena size: 64MB.
pub const CACHE_SIZE: usize = 64 * 1024 * 1024;
/// Entries a block must be reached before it is worth compiling.
pub const CACHE_HOT_COUNT: u64 = 100_000;
/// Longest probe chain before the table counts as full.
pub const MAX_SEARCH_COUNT: usize = 32;

/// Code cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Table slots
    pub entries: usize,
    /// Executable arena bytes
    pub arena_size: usize,
    /// Hotness threshold
    pub hot_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entries: CACHE_ENTRY_SIZE,
            arena_size: CACHE_SIZE,
            hot_threshold: CACHE_HOT_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum Slot {
    #[default]
    Empty,
    Occupied(Entry),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    pc: u64,
    /// Saturates at the hotness threshold
    hot: u64,
    /// Arena offset once translated; `None` while only tracking hotness
    code: Option<usize>,
}

/// Counters for cache activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    /// Slots in use (tracking or compiled)
    pub slots: usize,
    /// Blocks installed, recompilations included
    pub installs: u64,
    /// Installs that replaced an existing translation
    pub recompilations: u64,
    /// Arena bytes used, padding and stale translations included
    pub arena_used: usize,
    pub arena_capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

pub struct CodeCache {
    table: Box<[Slot]>,
    arena: ExecArena,
    hot_threshold: u64,
    stats: CacheStats,
}

/// Where a probe for `pc` ended.
enum Probe {
    Found(usize),
    Vacant(usize),
}

impl CodeCache {
    pub fn new() -> Result<Self, CacheError> {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Result<Self, CacheError> {
        assert!(config.entries > 0, "code cache needs at least one slot");
        Ok(Self {
            table: vec![Slot::Empty; config.entries].into_boxed_slice(),
            arena: ExecArena::new(config.arena_size)?,
            hot_threshold: config.hot_threshold,
            stats: CacheStats::default(),
        })
    }

    pub fn hot_threshold(&self) -> u64 {
        self.hot_threshold
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            arena_used: self.arena.used(),
            arena_capacity: self.arena.capacity(),
            ..self.stats
        }
    }

    fn hash(&self, pc: u64) -> usize {
        (pc % self.table.len() as u64) as usize
    }

    /// Walk the probe sequence for `pc`. `None` means the chain ran past
    /// `MAX_SEARCH_COUNT` without finding `pc` or a free slot.
    fn probe(&self, pc: u64) -> Option<Probe> {
        let mut index = self.hash(pc);
        for _ in 0..=MAX_SEARCH_COUNT {
            match self.table[index] {
                Slot::Empty => return Some(Probe::Vacant(index)),
                Slot::Occupied(e) if e.pc == pc => return Some(Probe::Found(index)),
                Slot::Occupied(_) => index = self.hash(index as u64 + 1),
            }
        }
        None
    }

    fn entry(&self, index: usize) -> Entry {
        match self.table[index] {
            Slot::Occupied(e) => e,
            Slot::Empty => unreachable!("probe returned an empty slot as found"),
        }
    }

    /// Host code for `pc`, if it has been translated and is hot.
    ///
    /// # Panics
    ///
    /// If `pc` is zero; guest PC 0 is never a valid block address.
    pub fn lookup(&mut self, pc: GuestAddr) -> Option<CodePtr> {
        assert!(pc.0 != 0, "code cache lookup of guest pc 0");
        self.stats.lookups += 1;

        let Some(Probe::Found(index)) = self.probe(pc.0) else {
            return None;
        };
        let entry = self.entry(index);
        let offset = entry.code.filter(|_| entry.hot >= self.hot_threshold)?;
        self.stats.hits += 1;
        Some(self.arena.code_ptr(offset))
    }

    /// Count one more entry into the block at `pc` and report whether it is hot.
    pub fn record_hot(&mut self, pc: GuestAddr) -> Result<bool, CacheError> {
        assert!(pc.0 != 0, "code cache hotness update of guest pc 0");
        let threshold = self.hot_threshold;

        match self.probe(pc.0) {
            Some(Probe::Found(index)) => {
                let mut entry = self.entry(index);
                entry.hot = (entry.hot + 1).min(threshold);
                self.table[index] = Slot::Occupied(entry);
                if entry.hot == threshold {
                    trace!(pc = %pc, "block is hot");
                }
                Ok(entry.hot >= threshold)
            }
            Some(Probe::Vacant(index)) => {
                self.table[index] = Slot::Occupied(Entry {
                    pc: pc.0,
                    hot: 1,
                    code: None,
                });
                self.stats.slots += 1;
                Ok(1 >= threshold)
            }
            None => Err(CacheError::ProbeLimit {
                pc: pc.0,
                limit: MAX_SEARCH_COUNT,
            }),
        }
    }

    /// Copy translated code for `pc` into the arena and point the table at it.
    ///
    /// A previous translation of the same `pc` is only unlinked: its arena
    /// bytes stay allocated, since the arena never reclaims space.
    pub fn install(
        &mut self,
        pc: GuestAddr,
        code: &[u8],
        align: usize,
    ) -> Result<CodePtr, CacheError> {
        assert!(pc.0 != 0, "code cache install at guest pc 0");
        let index = match self.probe(pc.0) {
            Some(Probe::Found(index)) | Some(Probe::Vacant(index)) => index,
            None => {
                return Err(CacheError::ProbeLimit {
                    pc: pc.0,
                    limit: MAX_SEARCH_COUNT,
                })
            }
        };

        let offset = self.arena.push(code, align)?;
        let entry = match self.table[index] {
            Slot::Occupied(mut e) => {
                if e.code.is_some() {
                    self.stats.recompilations += 1;
                }
                e.code = Some(offset);
                e
            }
            Slot::Empty => {
                self.stats.slots += 1;
                Entry {
                    pc: pc.0,
                    hot: 0,
                    code: Some(offset),
                }
            }
        };
        self.table[index] = Slot::Occupied(entry);
        self.stats.installs += 1;

        debug!(
            pc = %pc,
            size = code.len(),
            offset,
            "installed translated block"
        );
        Ok(self.arena.code_ptr(offset))
    }

    /// Arena offset of an entry point returned by this cache.
    pub fn offset_of(&self, ptr: CodePtr) -> usize {
        self.arena.offset_of(ptr)
    }
}
