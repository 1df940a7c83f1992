// translate.rs - Translator used when no native backend is available
//
// Scans each block the engine reports as hot and records its shape, then
// declines compilation so the block keeps running in the interpreter. The
// collected profile is what a backend would be asked to compile.

use crate::addr::GuestAddr;
use crate::arena::CodePtr;
use crate::block::{self, BlockExit};
use crate::cache::CodeCache;
use crate::engine::Translator;
use crate::error::Result;
use crate::mmu::Mmu;
use std::collections::BTreeMap;
use tracing::debug;

/// A block that reached the hotness threshold
#[derive(Debug, Clone)]
pub struct HotBlock {
    pub start: u64,
    pub end: u64,
    pub insns: usize,
    pub exit: BlockExit,
    /// Statically known next blocks
    pub successors: Vec<u64>,
    /// Translation requests seen for this block
    pub requests: u64,
}

#[derive(Debug, Default)]
pub struct ProfilingTranslator {
    blocks: BTreeMap<u64, HotBlock>,
}

impl ProfilingTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot blocks ordered by start address.
    pub fn hot_blocks(&self) -> impl Iterator<Item = &HotBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Translator for ProfilingTranslator {
    fn translate(&mut self, pc: GuestAddr, mmu: &Mmu, _cache: &mut CodeCache) -> Result<Option<CodePtr>> {
        if let Some(hot) = self.blocks.get_mut(&pc.0) {
            hot.requests += 1;
            return Ok(None);
        }

        let block = block::scan(mmu, pc)?;
        debug!(
            pc = %pc,
            end = format_args!("0x{:x}", block.end),
            insns = block.instructions.len(),
            exit = ?block.exit,
            "hot block"
        );
        self.blocks.insert(
            pc.0,
            HotBlock {
                start: block.start,
                end: block.end,
                insns: block.instructions.len(),
                exit: block.exit,
                successors: block.successors(),
                requests: 1,
            },
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::error::Error;

    const WINDOW: u64 = 0x4000_0000;

    fn small_cache() -> CodeCache {
        CodeCache::with_config(CacheConfig {
            entries: 64,
            arena_size: 4096,
            hot_threshold: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_records_and_declines() {
        let mut mmu = Mmu::at(GuestAddr(WINDOW));
        // addi a0, a0, -1 ; bne a0, zero, -4
        let code: Vec<u8> = [0xfff5_0513u32, 0xfe05_1ee3]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let pc = mmu.alloc(4096).unwrap();
        mmu.write(pc, &code).unwrap();

        let mut cache = small_cache();
        let mut translator = ProfilingTranslator::new();
        assert!(translator.translate(pc, &mmu, &mut cache).unwrap().is_none());
        assert!(translator.translate(pc, &mmu, &mut cache).unwrap().is_none());

        assert_eq!(translator.len(), 1);
        let hot = translator.hot_blocks().next().unwrap();
        assert_eq!(hot.start, pc.0);
        assert_eq!(hot.end, pc.0 + 8);
        assert_eq!(hot.insns, 2);
        assert_eq!(hot.requests, 2);
        assert!(matches!(hot.exit, BlockExit::Branch { .. }));
        assert_eq!(hot.successors, vec![pc.0, pc.0 + 8]);
        assert_eq!(cache.stats().installs, 0);
    }

    #[test]
    fn test_unmapped_block_is_an_error() {
        let mmu = Mmu::at(GuestAddr(WINDOW + 0x10_0000));
        let mut cache = small_cache();
        let mut translator = ProfilingTranslator::new();
        let err = translator.translate(mmu.base(), &mmu, &mut cache).unwrap_err();
        assert!(matches!(err, Error::Unmapped { .. }));
        assert!(translator.is_empty());
    }
}
