// interp.rs - Single-instruction RV64IM(C) interpreter
//
// Executes exactly the instruction at `state.pc` and reports where execution
// continues through `reenter_pc` / `exit_reason`, the same contract compiled
// blocks follow. Guest memory is accessed directly at its translated address.

use crate::addr::{self, GuestAddr};
use crate::decode::{self, Instruction, Opcode};
use crate::engine::Interpreter;
use crate::error::{Error, Result};
use crate::state::{ExecutionState, ExitReason};

#[derive(Debug, Default)]
pub struct Rv64Interpreter {
    /// Instructions executed so far
    pub retired: u64,
}

impl Rv64Interpreter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interpreter for Rv64Interpreter {
    fn step(&mut self, state: &mut ExecutionState) -> Result<()> {
        // SAFETY: guest code is trusted; the engine only runs PCs the guest
        // reached, which lie in its mapped image.
        let inst = unsafe { decode::fetch(GuestAddr(state.pc)) };
        execute(state, &inst)?;
        self.retired += 1;
        Ok(())
    }
}

/// Execute one decoded instruction against `state`.
pub fn execute(state: &mut ExecutionState, inst: &Instruction) -> Result<()> {
    use Opcode::*;
    let pc = inst.addr;
    let next = inst.next_pc();
    let rs1 = state.x(inst.rs1);
    let rs2 = state.x(inst.rs2);
    let imm = inst.imm as u64;
    let ea = rs1.wrapping_add(imm);

    let value = match inst.opcode {
        LUI => inst.imm as u64,
        AUIPC => pc.wrapping_add(imm),

        JAL => {
            state.set_x(inst.rd, next);
            state.set_exit(ExitReason::DirectBranch, pc.wrapping_add(imm));
            return Ok(());
        }
        JALR => {
            let target = ea & !1;
            state.set_x(inst.rd, next);
            state.set_exit(ExitReason::IndirectBranch, target);
            return Ok(());
        }
        BEQ | BNE | BLT | BGE | BLTU | BGEU => {
            let taken = match inst.opcode {
                BEQ => rs1 == rs2,
                BNE => rs1 != rs2,
                BLT => (rs1 as i64) < (rs2 as i64),
                BGE => (rs1 as i64) >= (rs2 as i64),
                BLTU => rs1 < rs2,
                _ => rs1 >= rs2,
            };
            let target = if taken { pc.wrapping_add(imm) } else { next };
            state.set_exit(ExitReason::DirectBranch, target);
            return Ok(());
        }
        ECALL => {
            state.set_exit(ExitReason::SystemCall, next);
            return Ok(());
        }
        FENCE => {
            state.set_exit(ExitReason::Interp, next);
            return Ok(());
        }
        EBREAK | Unknown => {
            return Err(Error::Unsupported {
                pc,
                bits: inst.bits,
            })
        }

        // SAFETY (loads and stores): guest memory is unsandboxed; a wild
        // guest address faults the host process.
        LB => unsafe { addr::read::<i8>(GuestAddr(ea)) as i64 as u64 },
        LH => unsafe { addr::read::<i16>(GuestAddr(ea)) as i64 as u64 },
        LW => unsafe { addr::read::<i32>(GuestAddr(ea)) as i64 as u64 },
        LD => unsafe { addr::read::<u64>(GuestAddr(ea)) },
        LBU => unsafe { addr::read::<u8>(GuestAddr(ea)) as u64 },
        LHU => unsafe { addr::read::<u16>(GuestAddr(ea)) as u64 },
        LWU => unsafe { addr::read::<u32>(GuestAddr(ea)) as u64 },
        SB | SH | SW | SD => {
            unsafe {
                match inst.opcode {
                    SB => addr::write(GuestAddr(ea), rs2 as u8),
                    SH => addr::write(GuestAddr(ea), rs2 as u16),
                    SW => addr::write(GuestAddr(ea), rs2 as u32),
                    _ => addr::write(GuestAddr(ea), rs2),
                }
            }
            state.set_exit(ExitReason::Interp, next);
            return Ok(());
        }

        ADDI => rs1.wrapping_add(imm),
        SLTI => ((rs1 as i64) < inst.imm) as u64,
        SLTIU => (rs1 < imm) as u64,
        XORI => rs1 ^ imm,
        ORI => rs1 | imm,
        ANDI => rs1 & imm,
        SLLI => rs1 << (imm & 0x3f),
        SRLI => rs1 >> (imm & 0x3f),
        SRAI => ((rs1 as i64) >> (imm & 0x3f)) as u64,

        ADD => rs1.wrapping_add(rs2),
        SUB => rs1.wrapping_sub(rs2),
        SLL => rs1 << (rs2 & 0x3f),
        SLT => ((rs1 as i64) < (rs2 as i64)) as u64,
        SLTU => (rs1 < rs2) as u64,
        XOR => rs1 ^ rs2,
        SRL => rs1 >> (rs2 & 0x3f),
        SRA => ((rs1 as i64) >> (rs2 & 0x3f)) as u64,
        OR => rs1 | rs2,
        AND => rs1 & rs2,

        ADDIW => sext32(rs1.wrapping_add(imm) as u32),
        SLLIW => sext32((rs1 as u32) << (imm & 0x1f)),
        SRLIW => sext32((rs1 as u32) >> (imm & 0x1f)),
        SRAIW => ((rs1 as i32) >> (imm & 0x1f)) as i64 as u64,
        ADDW => sext32((rs1 as u32).wrapping_add(rs2 as u32)),
        SUBW => sext32((rs1 as u32).wrapping_sub(rs2 as u32)),
        SLLW => sext32((rs1 as u32) << (rs2 & 0x1f)),
        SRLW => sext32((rs1 as u32) >> (rs2 & 0x1f)),
        SRAW => ((rs1 as i32) >> (rs2 & 0x1f)) as i64 as u64,

        MUL => rs1.wrapping_mul(rs2),
        MULH => ((rs1 as i64 as i128 * rs2 as i64 as i128) >> 64) as u64,
        MULHSU => ((rs1 as i64 as i128).wrapping_mul(rs2 as i128) >> 64) as u64,
        MULHU => ((rs1 as u128 * rs2 as u128) >> 64) as u64,
        DIV => div(rs1 as i64, rs2 as i64) as u64,
        DIVU => rs1.checked_div(rs2).unwrap_or(u64::MAX),
        REM => rem(rs1 as i64, rs2 as i64) as u64,
        REMU => rs1.checked_rem(rs2).unwrap_or(rs1),
        MULW => sext32((rs1 as u32).wrapping_mul(rs2 as u32)),
        DIVW => div(rs1 as i32 as i64, rs2 as i32 as i64) as i32 as i64 as u64,
        DIVUW => sext32((rs1 as u32).checked_div(rs2 as u32).unwrap_or(u32::MAX)),
        REMW => rem(rs1 as i32 as i64, rs2 as i32 as i64) as i32 as i64 as u64,
        REMUW => sext32((rs1 as u32).checked_rem(rs2 as u32).unwrap_or(rs1 as u32)),
    };

    state.set_x(inst.rd, value);
    state.set_exit(ExitReason::Interp, next);
    Ok(())
}

fn sext32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

/// Signed division with RISC-V semantics: x/0 = -1, MIN/-1 = MIN.
fn div(a: i64, b: i64) -> i64 {
    if b == 0 {
        -1
    } else {
        a.wrapping_div(b)
    }
}

/// Signed remainder with RISC-V semantics: x%0 = x, MIN%-1 = 0.
fn rem(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        a.wrapping_rem(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::mmu::Mmu;
    use crate::state::GpReg;

    fn run(state: &mut ExecutionState, pc: u64, raw: u32) -> Result<()> {
        state.pc = pc;
        execute(state, &decode(pc, raw))
    }

    #[test]
    fn test_alu_sets_interp_exit() {
        let mut s = ExecutionState::new();
        // addi a0, zero, 42
        run(&mut s, 0x1000, 0x02a0_0513).unwrap();
        assert_eq!(s.get_gp_reg(GpReg::A0), 42);
        assert_eq!(s.exit_reason(), Ok(ExitReason::Interp));
        assert_eq!(s.reenter_pc, 0x1004);

        // c.li a0, 5 advances by two
        run(&mut s, 0x1004, 0x4515).unwrap();
        assert_eq!(s.get_gp_reg(GpReg::A0), 5);
        assert_eq!(s.reenter_pc, 0x1006);

        // addi zero, zero, 1 leaves x0 alone
        run(&mut s, 0x1006, 0x0010_0013).unwrap();
        assert_eq!(s.x(0), 0);
    }

    #[test]
    fn test_word_ops_sign_extend() {
        let mut s = ExecutionState::new();
        s.set_x(10, 0x7fff_ffff);
        // addiw a0, a0, 1
        run(&mut s, 0x1000, 0x0015_051b).unwrap();
        assert_eq!(s.x(10), 0xffff_ffff_8000_0000);
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(div(7, 0), -1);
        assert_eq!(div(i64::MIN, -1), i64::MIN);
        assert_eq!(rem(7, 0), 7);
        assert_eq!(rem(i64::MIN, -1), 0);

        let mut s = ExecutionState::new();
        s.set_x(10, 10);
        s.set_x(11, 0);
        // divu a2, a0, a1
        run(&mut s, 0x1000, 0x02b5_5633).unwrap();
        assert_eq!(s.x(12), u64::MAX);
    }

    #[test]
    fn test_branches() {
        let mut s = ExecutionState::new();
        s.set_x(10, 1);
        // bne a0, a1, +16 (taken)
        run(&mut s, 0x2000, 0x00b5_1863).unwrap();
        assert_eq!(s.exit_reason(), Ok(ExitReason::DirectBranch));
        assert_eq!(s.reenter_pc, 0x2010);

        s.set_x(11, 1);
        run(&mut s, 0x2000, 0x00b5_1863).unwrap();
        assert_eq!(s.reenter_pc, 0x2004);

        // jal ra, -8
        run(&mut s, 0x1010, 0xff9f_f0ef).unwrap();
        assert_eq!(s.reenter_pc, 0x1008);
        assert_eq!(s.x(1), 0x1014);

        // jalr zero, 0(ra)
        run(&mut s, 0x1008, 0x0000_8067).unwrap();
        assert_eq!(s.exit_reason(), Ok(ExitReason::IndirectBranch));
        assert_eq!(s.reenter_pc, 0x1014);
    }

    #[test]
    fn test_ecall_and_unsupported() {
        let mut s = ExecutionState::new();
        run(&mut s, 0x3000, 0x0000_0073).unwrap();
        assert_eq!(s.exit_reason(), Ok(ExitReason::SystemCall));
        assert_eq!(s.reenter_pc, 0x3004);

        let err = run(&mut s, 0x3004, 0x0030_2573).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                pc: 0x3004,
                bits: 0x0030_2573
            }
        ));
    }

    #[test]
    fn test_loads_and_stores() {
        let mut mmu = Mmu::at(GuestAddr(0x3000_0000));
        let buf = mmu.alloc(64).unwrap();

        let mut s = ExecutionState::new();
        s.set_x(10, buf.0);
        s.set_x(11, 0xffff_ffff_ffff_fff0);
        // sd a1, 8(a0)
        run(&mut s, 0x1000, 0x00b5_3423).unwrap();
        assert_eq!(mmu.read_u64(buf.offset(8)).unwrap(), 0xffff_ffff_ffff_fff0);

        // lw a2, 8(a0) sign extends; lbu a3, 8(a0) does not
        run(&mut s, 0x1004, 0x0085_2603).unwrap();
        assert_eq!(s.x(12), 0xffff_ffff_ffff_fff0);
        run(&mut s, 0x1008, 0x0085_4683).unwrap();
        assert_eq!(s.x(13), 0xf0);
    }

    #[test]
    fn test_step_fetches_from_guest_memory() {
        let mut mmu = Mmu::at(GuestAddr(0x3010_0000));
        let code = mmu.alloc(16).unwrap();
        mmu.write(code, &0x02a0_0513u32.to_le_bytes()).unwrap();

        let mut s = ExecutionState::new();
        s.pc = code.0;
        let mut interp = Rv64Interpreter::new();
        interp.step(&mut s).unwrap();
        assert_eq!(s.x(10), 42);
        assert_eq!(s.reenter_pc, code.0 + 4);
        assert_eq!(interp.retired, 1);
    }
}
