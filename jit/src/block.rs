// block.rs - Basic block discovery in guest memory
//
// The front half of a code generator: starting at a block entry PC, decode
// straight-line instructions until one ends the block. Translators lower the
// resulting `GuestBlock`; the profiler uses it to report hot regions.

use crate::addr::GuestAddr;
use crate::decode::{self, Flow, Instruction};
use crate::error::{Error, Result};
use crate::mmu::Mmu;

/// Upper bound on instructions per block, so one huge straight-line region
/// does not produce an unbounded translation.
pub const MAX_BLOCK_INSNS: usize = 256;

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Conditional branch: taken target and fall-through
    Branch { taken: u64, fallthrough: u64 },
    /// Direct jump (`jal`), possibly a call when `link` is set
    Jump { target: u64, link: bool },
    /// Register-indirect jump (`jalr`); a return when it jumps through `ra`
    Indirect { is_return: bool },
    SystemCall { next: u64 },
    /// EBREAK or an instruction the interpreter must handle
    Interp { at: u64 },
    /// The block was cut at `MAX_BLOCK_INSNS` or at unmapped memory
    Fallthrough { next: u64 },
}

/// A straight-line run of guest instructions
#[derive(Debug, Clone)]
pub struct GuestBlock {
    /// Start address
    pub start: u64,
    /// End address (after last instruction)
    pub end: u64,
    pub instructions: Vec<Instruction>,
    pub exit: BlockExit,
}

impl GuestBlock {
    /// Possible successor addresses known statically.
    pub fn successors(&self) -> Vec<u64> {
        match self.exit {
            BlockExit::Branch { taken, fallthrough } => vec![taken, fallthrough],
            BlockExit::Jump { target, .. } => vec![target],
            BlockExit::SystemCall { next } | BlockExit::Fallthrough { next } => vec![next],
            BlockExit::Indirect { .. } | BlockExit::Interp { .. } => Vec::new(),
        }
    }
}

/// Decode the block starting at `pc`.
pub fn scan(mmu: &Mmu, pc: GuestAddr) -> Result<GuestBlock> {
    if !mmu.contains(pc, 2) {
        return Err(Error::Unmapped { addr: pc.0, len: 2 });
    }

    let mut instructions = Vec::new();
    let mut addr = pc.0;
    let exit = loop {
        let at = GuestAddr(addr);
        if instructions.len() == MAX_BLOCK_INSNS || !mmu.contains(at, 2) {
            break BlockExit::Fallthrough { next: addr };
        }
        // SAFETY: contains() checked the first halfword is mapped readable.
        let low: u16 = unsafe { crate::addr::read(at) };
        if decode::instruction_len(low) == 4 && !mmu.contains(at, 4) {
            break BlockExit::Fallthrough { next: addr };
        }
        // SAFETY: every byte of the instruction was checked above.
        let inst = unsafe { decode::fetch(at) };
        addr = inst.next_pc();
        instructions.push(inst);

        match inst.opcode.flow() {
            Flow::Next => continue,
            Flow::Branch => {
                break BlockExit::Branch {
                    taken: inst.addr.wrapping_add(inst.imm as u64),
                    fallthrough: addr,
                }
            }
            Flow::Jump => {
                break BlockExit::Jump {
                    target: inst.addr.wrapping_add(inst.imm as u64),
                    link: inst.rd != 0,
                }
            }
            Flow::IndirectJump => {
                break BlockExit::Indirect {
                    is_return: inst.rs1 == 1 && inst.rd == 0,
                }
            }
            Flow::SystemCall => break BlockExit::SystemCall { next: addr },
            Flow::Trap => break BlockExit::Interp { at: inst.addr },
        }
    };

    Ok(GuestBlock {
        start: pc.0,
        end: addr,
        instructions,
        exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 0x2000_0000;

    fn mmu_with_code(base: u64, words: &[u32]) -> (Mmu, GuestAddr) {
        let mut mmu = Mmu::at(GuestAddr(base));
        let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let at = mmu.alloc(code.len() as i64 + 64).unwrap();
        mmu.write(at, &code).unwrap();
        (mmu, at)
    }

    #[test]
    fn test_block_ends_at_branch() {
        // addi a0, a0, -1 ; bne a0, zero, -4
        let (mmu, pc) = mmu_with_code(WINDOW, &[0xfff5_0513, 0xfe05_1ee3]);
        let block = scan(&mmu, pc).unwrap();
        assert_eq!(block.instructions.len(), 2);
        assert_eq!(block.end, pc.0 + 8);
        assert_eq!(
            block.exit,
            BlockExit::Branch {
                taken: pc.0,
                fallthrough: pc.0 + 8
            }
        );
        assert_eq!(block.successors(), vec![pc.0, pc.0 + 8]);
    }

    #[test]
    fn test_block_ends_at_ecall() {
        // addi a7, zero, 93 ; ecall
        let (mmu, pc) = mmu_with_code(WINDOW + 0x10_0000, &[0x05d0_0893, 0x0000_0073]);
        let block = scan(&mmu, pc).unwrap();
        assert_eq!(block.exit, BlockExit::SystemCall { next: pc.0 + 8 });
        assert_eq!(block.instructions.last().unwrap().opcode, decode::Opcode::ECALL);
    }

    #[test]
    fn test_return_is_indirect() {
        // jalr zero, 0(ra)
        let (mmu, pc) = mmu_with_code(WINDOW + 0x20_0000, &[0x0000_8067]);
        let block = scan(&mmu, pc).unwrap();
        assert_eq!(block.exit, BlockExit::Indirect { is_return: true });
        assert!(block.successors().is_empty());
    }

    #[test]
    fn test_unknown_instruction_needs_interpreter() {
        // addi a0, zero, 1 ; csrr a0, fcsr
        let (mmu, pc) = mmu_with_code(WINDOW + 0x30_0000, &[0x0010_0513, 0x0030_2573]);
        let block = scan(&mmu, pc).unwrap();
        assert_eq!(block.exit, BlockExit::Interp { at: pc.0 + 4 });
    }

    #[test]
    fn test_compressed_instruction_at_end_of_mapping() {
        let mut mmu = Mmu::at(GuestAddr(WINDOW + 0x50_0000));
        let page = mmu.page_size();
        let base = mmu.alloc(page as i64).unwrap();
        let end = base.0 + page;

        // addi a0, a0, 1 ; c.ret, the last halfword of the mapping
        let pc = GuestAddr(end - 6);
        mmu.write(pc, &0x0015_0513u32.to_le_bytes()).unwrap();
        mmu.write(GuestAddr(end - 2), &0x8082u16.to_le_bytes()).unwrap();
        let block = scan(&mmu, pc).unwrap();
        assert_eq!(block.instructions.len(), 2);
        assert_eq!(block.end, end);
        assert_eq!(block.exit, BlockExit::Indirect { is_return: true });

        // A 32-bit encoding cut by the end of the mapping is not decoded.
        mmu.write(GuestAddr(end - 2), &0x0513u16.to_le_bytes()).unwrap();
        let block = scan(&mmu, GuestAddr(end - 2)).unwrap();
        assert!(block.instructions.is_empty());
        assert_eq!(block.exit, BlockExit::Fallthrough { next: end - 2 });
    }

    #[test]
    fn test_unmapped_start() {
        let mmu = Mmu::at(GuestAddr(WINDOW + 0x40_0000));
        assert!(matches!(
            scan(&mmu, mmu.base()),
            Err(Error::Unmapped { .. })
        ));
    }
}
