// decode.rs - RISC-V instruction decoder
//
// Decodes RV64IM and the C extension. Compressed encodings are expanded to the
// equivalent base instruction, so consumers only deal with one opcode set and
// use `len` to step to the next instruction.

use crate::addr::{self, GuestAddr};

/// A decoded RISC-V instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Guest address
    pub addr: u64,
    /// Raw encoding (low 16 bits only for compressed instructions)
    pub bits: u32,
    /// 2 or 4
    pub len: u8,
    pub opcode: Opcode,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i64,
}

/// RV64IM opcodes
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    LUI,
    AUIPC,
    JAL,
    JALR,
    BEQ,
    BNE,
    BLT,
    BGE,
    BLTU,
    BGEU,
    LB,
    LH,
    LW,
    LD,
    LBU,
    LHU,
    LWU,
    SB,
    SH,
    SW,
    SD,
    ADDI,
    SLTI,
    SLTIU,
    XORI,
    ORI,
    ANDI,
    SLLI,
    SRLI,
    SRAI,
    ADD,
    SUB,
    SLL,
    SLT,
    SLTU,
    XOR,
    SRL,
    SRA,
    OR,
    AND,
    ADDIW,
    SLLIW,
    SRLIW,
    SRAIW,
    ADDW,
    SUBW,
    SLLW,
    SRLW,
    SRAW,
    MUL,
    MULH,
    MULHSU,
    MULHU,
    DIV,
    DIVU,
    REM,
    REMU,
    MULW,
    DIVW,
    DIVUW,
    REMW,
    REMUW,
    FENCE,
    ECALL,
    EBREAK,
    /// Anything else: reserved encodings, F/D, A, Zicsr
    Unknown,
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continues at the next instruction
    Next,
    /// Conditional branch with a static target
    Branch,
    /// Unconditional jump with a static target
    Jump,
    /// Jump through a register
    IndirectJump,
    SystemCall,
    /// EBREAK or an instruction only the interpreter can reject
    Trap,
}

impl Opcode {
    pub fn flow(self) -> Flow {
        use Opcode::*;
        match self {
            BEQ | BNE | BLT | BGE | BLTU | BGEU => Flow::Branch,
            JAL => Flow::Jump,
            JALR => Flow::IndirectJump,
            ECALL => Flow::SystemCall,
            EBREAK | Unknown => Flow::Trap,
            _ => Flow::Next,
        }
    }
}

impl Instruction {
    pub fn next_pc(&self) -> u64 {
        self.addr.wrapping_add(self.len as u64)
    }

    /// Target of a direct branch or jump.
    pub fn target(&self) -> Option<u64> {
        match self.opcode.flow() {
            Flow::Branch | Flow::Jump => Some(self.addr.wrapping_add(self.imm as u64)),
            _ => None,
        }
    }
}

/// Length in bytes of the instruction whose first halfword is `low`.
pub fn instruction_len(low: u16) -> u8 {
    if low & 0x3 == 0x3 {
        4
    } else {
        2
    }
}

/// Fetch and decode the instruction at `pc` from guest memory.
///
/// # Safety
///
/// The instruction bytes at the translated address must be mapped readable.
pub unsafe fn fetch(pc: GuestAddr) -> Instruction {
    let low: u16 = addr::read(pc);
    if instruction_len(low) == 2 {
        decode(pc.0, low as u32)
    } else {
        let high: u16 = addr::read(pc.offset(2));
        decode(pc.0, low as u32 | (high as u32) << 16)
    }
}

/// Decode one instruction. `raw` holds 32 bits, or 16 for a compressed encoding.
pub fn decode(addr: u64, raw: u32) -> Instruction {
    if instruction_len(raw as u16) == 2 {
        decode_compressed(addr, raw & 0xffff)
    } else {
        decode_32bit(addr, raw)
    }
}

/// Extract `inst[hi:lo]`.
fn bits(inst: u32, hi: u32, lo: u32) -> u32 {
    (inst >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

/// Sign extend the low `width` bits of `val`.
fn sext(val: u32, width: u32) -> i64 {
    let shift = 64 - width;
    ((val as i64) << shift) >> shift
}

#[allow(clippy::too_many_arguments)]
fn inst(addr: u64, bits: u32, len: u8, opcode: Opcode, rd: u8, rs1: u8, rs2: u8, imm: i64) -> Instruction {
    Instruction {
        addr,
        bits,
        len,
        opcode,
        rd,
        rs1,
        rs2,
        imm,
    }
}

fn decode_32bit(addr: u64, raw: u32) -> Instruction {
    use Opcode::*;
    let rd = bits(raw, 11, 7) as u8;
    let rs1 = bits(raw, 19, 15) as u8;
    let rs2 = bits(raw, 24, 20) as u8;
    let funct3 = bits(raw, 14, 12);
    let funct7 = bits(raw, 31, 25);

    let i_imm = sext(bits(raw, 31, 20), 12);
    let s_imm = sext(bits(raw, 31, 25) << 5 | bits(raw, 11, 7), 12);
    let b_imm = sext(
        bits(raw, 31, 31) << 12 | bits(raw, 7, 7) << 11 | bits(raw, 30, 25) << 5 | bits(raw, 11, 8) << 1,
        13,
    );
    let u_imm = (raw & 0xffff_f000) as i32 as i64;
    let j_imm = sext(
        bits(raw, 31, 31) << 20 | bits(raw, 19, 12) << 12 | bits(raw, 20, 20) << 11 | bits(raw, 30, 21) << 1,
        21,
    );
    let shamt6 = bits(raw, 25, 20) as i64;
    let shamt5 = bits(raw, 24, 20) as i64;

    let (opcode, imm) = match bits(raw, 6, 0) {
        0x37 => (LUI, u_imm),
        0x17 => (AUIPC, u_imm),
        0x6f => (JAL, j_imm),
        0x67 if funct3 == 0 => (JALR, i_imm),
        0x63 => {
            let op = match funct3 {
                0 => BEQ,
                1 => BNE,
                4 => BLT,
                5 => BGE,
                6 => BLTU,
                7 => BGEU,
                _ => Unknown,
            };
            (op, b_imm)
        }
        0x03 => {
            let op = match funct3 {
                0 => LB,
                1 => LH,
                2 => LW,
                3 => LD,
                4 => LBU,
                5 => LHU,
                6 => LWU,
                _ => Unknown,
            };
            (op, i_imm)
        }
        0x23 => {
            let op = match funct3 {
                0 => SB,
                1 => SH,
                2 => SW,
                3 => SD,
                _ => Unknown,
            };
            (op, s_imm)
        }
        0x13 => match (funct3, funct7 >> 1) {
            (0, _) => (ADDI, i_imm),
            (2, _) => (SLTI, i_imm),
            (3, _) => (SLTIU, i_imm),
            (4, _) => (XORI, i_imm),
            (6, _) => (ORI, i_imm),
            (7, _) => (ANDI, i_imm),
            (1, 0x00) => (SLLI, shamt6),
            (5, 0x00) => (SRLI, shamt6),
            (5, 0x10) => (SRAI, shamt6),
            _ => (Unknown, 0),
        },
        0x1b => match (funct3, funct7) {
            (0, _) => (ADDIW, i_imm),
            (1, 0x00) => (SLLIW, shamt5),
            (5, 0x00) => (SRLIW, shamt5),
            (5, 0x20) => (SRAIW, shamt5),
            _ => (Unknown, 0),
        },
        0x33 => {
            let op = match (funct7, funct3) {
                (0x00, 0) => ADD,
                (0x20, 0) => SUB,
                (0x00, 1) => SLL,
                (0x00, 2) => SLT,
                (0x00, 3) => SLTU,
                (0x00, 4) => XOR,
                (0x00, 5) => SRL,
                (0x20, 5) => SRA,
                (0x00, 6) => OR,
                (0x00, 7) => AND,
                (0x01, 0) => MUL,
                (0x01, 1) => MULH,
                (0x01, 2) => MULHSU,
                (0x01, 3) => MULHU,
                (0x01, 4) => DIV,
                (0x01, 5) => DIVU,
                (0x01, 6) => REM,
                (0x01, 7) => REMU,
                _ => Unknown,
            };
            (op, 0)
        }
        0x3b => {
            let op = match (funct7, funct3) {
                (0x00, 0) => ADDW,
                (0x20, 0) => SUBW,
                (0x00, 1) => SLLW,
                (0x00, 5) => SRLW,
                (0x20, 5) => SRAW,
                (0x01, 0) => MULW,
                (0x01, 4) => DIVW,
                (0x01, 5) => DIVUW,
                (0x01, 6) => REMW,
                (0x01, 7) => REMUW,
                _ => Unknown,
            };
            (op, 0)
        }
        // FENCE and FENCE.I; the interpreter treats both as no-ops
        0x0f if funct3 <= 1 => (FENCE, 0),
        0x73 => match raw {
            0x0000_0073 => (ECALL, 0),
            0x0010_0073 => (EBREAK, 0),
            _ => (Unknown, 0),
        },
        _ => (Unknown, 0),
    };

    inst(addr, raw, 4, opcode, rd, rs1, rs2, imm)
}

fn decode_compressed(addr: u64, raw: u32) -> Instruction {
    use Opcode::*;
    let c = |opcode, rd, rs1, rs2, imm| inst(addr, raw, 2, opcode, rd, rs1, rs2, imm);
    let unknown = c(Unknown, 0, 0, 0, 0);

    // Full and "prime" (x8-x15) register fields
    let r_hi = bits(raw, 11, 7) as u8;
    let r_lo = bits(raw, 6, 2) as u8;
    let rp_hi = bits(raw, 9, 7) as u8 + 8;
    let rp_lo = bits(raw, 4, 2) as u8 + 8;

    let ci_imm = sext(bits(raw, 12, 12) << 5 | bits(raw, 6, 2), 6);
    let ci_shamt = (bits(raw, 12, 12) << 5 | bits(raw, 6, 2)) as i64;
    let cl_w = (bits(raw, 5, 5) << 6 | bits(raw, 12, 10) << 3 | bits(raw, 6, 6) << 2) as i64;
    let cl_d = (bits(raw, 6, 5) << 6 | bits(raw, 12, 10) << 3) as i64;
    let cb_imm = sext(
        bits(raw, 12, 12) << 8 | bits(raw, 6, 5) << 6 | bits(raw, 2, 2) << 5 | bits(raw, 11, 10) << 3 | bits(raw, 4, 3) << 1,
        9,
    );
    let cj_imm = sext(
        bits(raw, 12, 12) << 11
            | bits(raw, 8, 8) << 10
            | bits(raw, 10, 9) << 8
            | bits(raw, 6, 6) << 7
            | bits(raw, 7, 7) << 6
            | bits(raw, 2, 2) << 5
            | bits(raw, 11, 11) << 4
            | bits(raw, 5, 3) << 1,
        12,
    );

    match (bits(raw, 1, 0), bits(raw, 15, 13)) {
        (0, 0) => {
            let imm = (bits(raw, 10, 7) << 6 | bits(raw, 12, 11) << 4 | bits(raw, 5, 5) << 3 | bits(raw, 6, 6) << 2) as i64;
            if imm == 0 {
                // Includes the all-zero halfword, which is defined illegal
                unknown
            } else {
                c(ADDI, rp_lo, 2, 0, imm)
            }
        }
        (0, 2) => c(LW, rp_lo, rp_hi, 0, cl_w),
        (0, 3) => c(LD, rp_lo, rp_hi, 0, cl_d),
        (0, 6) => c(SW, 0, rp_hi, rp_lo, cl_w),
        (0, 7) => c(SD, 0, rp_hi, rp_lo, cl_d),
        // C.NOP is C.ADDI with rd = x0
        (1, 0) => c(ADDI, r_hi, r_hi, 0, ci_imm),
        (1, 1) if r_hi != 0 => c(ADDIW, r_hi, r_hi, 0, ci_imm),
        (1, 2) => c(ADDI, r_hi, 0, 0, ci_imm),
        (1, 3) if r_hi == 2 => {
            let imm = sext(
                bits(raw, 12, 12) << 9 | bits(raw, 4, 3) << 7 | bits(raw, 5, 5) << 6 | bits(raw, 2, 2) << 5 | bits(raw, 6, 6) << 4,
                10,
            );
            if imm == 0 {
                unknown
            } else {
                c(ADDI, 2, 2, 0, imm)
            }
        }
        (1, 3) => {
            let imm = sext(bits(raw, 12, 12) << 17 | bits(raw, 6, 2) << 12, 18);
            if imm == 0 || r_hi == 0 {
                unknown
            } else {
                c(LUI, r_hi, 0, 0, imm)
            }
        }
        (1, 4) => match (bits(raw, 11, 10), bits(raw, 12, 12), bits(raw, 6, 5)) {
            (0, _, _) => c(SRLI, rp_hi, rp_hi, 0, ci_shamt),
            (1, _, _) => c(SRAI, rp_hi, rp_hi, 0, ci_shamt),
            (2, _, _) => c(ANDI, rp_hi, rp_hi, 0, ci_imm),
            (3, 0, 0) => c(SUB, rp_hi, rp_hi, rp_lo, 0),
            (3, 0, 1) => c(XOR, rp_hi, rp_hi, rp_lo, 0),
            (3, 0, 2) => c(OR, rp_hi, rp_hi, rp_lo, 0),
            (3, 0, 3) => c(AND, rp_hi, rp_hi, rp_lo, 0),
            (3, 1, 0) => c(SUBW, rp_hi, rp_hi, rp_lo, 0),
            (3, 1, 1) => c(ADDW, rp_hi, rp_hi, rp_lo, 0),
            _ => unknown,
        },
        (1, 5) => c(JAL, 0, 0, 0, cj_imm),
        (1, 6) => c(BEQ, 0, rp_hi, 0, cb_imm),
        (1, 7) => c(BNE, 0, rp_hi, 0, cb_imm),
        (2, 0) => c(SLLI, r_hi, r_hi, 0, ci_shamt),
        (2, 2) if r_hi != 0 => {
            let imm = (bits(raw, 3, 2) << 6 | bits(raw, 12, 12) << 5 | bits(raw, 6, 4) << 2) as i64;
            c(LW, r_hi, 2, 0, imm)
        }
        (2, 3) if r_hi != 0 => {
            let imm = (bits(raw, 4, 2) << 6 | bits(raw, 12, 12) << 5 | bits(raw, 6, 5) << 3) as i64;
            c(LD, r_hi, 2, 0, imm)
        }
        (2, 4) => match (bits(raw, 12, 12), r_hi, r_lo) {
            (0, 0, 0) => unknown,
            (0, rs1, 0) => c(JALR, 0, rs1, 0, 0),
            (0, rd, rs2) => c(ADD, rd, 0, rs2, 0),
            (1, 0, 0) => c(EBREAK, 0, 0, 0, 0),
            (1, rs1, 0) => c(JALR, 1, rs1, 0, 0),
            (_, rd, rs2) => c(ADD, rd, rd, rs2, 0),
        },
        (2, 6) => {
            let imm = (bits(raw, 8, 7) << 6 | bits(raw, 12, 9) << 2) as i64;
            c(SW, 0, 2, r_lo, imm)
        }
        (2, 7) => {
            let imm = (bits(raw, 9, 7) << 6 | bits(raw, 12, 10) << 3) as i64;
            c(SD, 0, 2, r_lo, imm)
        }
        _ => unknown,
    }
}
