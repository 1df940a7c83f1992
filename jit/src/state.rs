// state.rs - Guest register file shared by compiled blocks and the interpreter
//
// The layout is `#[repr(C)]` because translated code receives a raw pointer to
// it and addresses fields by offset. Keep the `OFFSET_*` constants in sync.

use std::mem;

/// Why a block handed control back to the engine.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Only valid while a block runs
    None = 0,
    DirectBranch = 1,
    IndirectBranch = 2,
    SystemCall = 3,
    /// A single instruction must go through the interpreter
    Interp = 4,
}

impl TryFrom<u32> for ExitReason {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Ok(match raw {
            0 => ExitReason::None,
            1 => ExitReason::DirectBranch,
            2 => ExitReason::IndirectBranch,
            3 => ExitReason::SystemCall,
            4 => ExitReason::Interp,
            other => return Err(other),
        })
    }
}

/// General-purpose registers by ABI name.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpReg {
    Zero = 0,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
}

pub const NUM_GP_REGS: usize = 32;
pub const NUM_FP_REGS: usize = 32;

/// Floating-point register, stored as its raw bit pattern.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FpReg(pub u64);

impl FpReg {
    pub fn from_f64(v: f64) -> Self {
        FpReg(v.to_bits())
    }

    /// Single precision values are NaN-boxed in the upper 32 bits.
    pub fn from_f32(v: f32) -> Self {
        FpReg(0xffff_ffff_0000_0000 | v.to_bits() as u64)
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }
}

#[repr(C)]
#[derive(Debug, Clone)]
pub struct ExecutionState {
    /// Raw `ExitReason`; generated code may store anything here
    pub exit_reason: u32,
    /// Guest address execution resumes at after the current block
    pub reenter_pc: u64,
    pub gp_regs: [u64; NUM_GP_REGS],
    pub fp_regs: [FpReg; NUM_FP_REGS],
    pub pc: u64,
    pub fcsr: u32,
}

pub const OFFSET_EXIT_REASON: usize = mem::offset_of!(ExecutionState, exit_reason);
pub const OFFSET_REENTER_PC: usize = mem::offset_of!(ExecutionState, reenter_pc);
pub const OFFSET_GP_REGS: usize = mem::offset_of!(ExecutionState, gp_regs);
pub const OFFSET_FP_REGS: usize = mem::offset_of!(ExecutionState, fp_regs);
pub const OFFSET_PC: usize = mem::offset_of!(ExecutionState, pc);

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            exit_reason: ExitReason::None as u32,
            reenter_pc: 0,
            gp_regs: [0; NUM_GP_REGS],
            fp_regs: [FpReg::default(); NUM_FP_REGS],
            pc: 0,
            fcsr: 0,
        }
    }

    /// Decoded exit reason, or the raw value if it is not a known one.
    pub fn exit_reason(&self) -> Result<ExitReason, u32> {
        ExitReason::try_from(self.exit_reason)
    }

    pub fn set_exit(&mut self, reason: ExitReason, reenter_pc: u64) {
        self.exit_reason = reason as u32;
        self.reenter_pc = reenter_pc;
    }

    pub fn get_gp_reg(&self, reg: GpReg) -> u64 {
        self.gp_regs[reg as usize]
    }

    pub fn set_gp_reg(&mut self, reg: GpReg, data: u64) {
        self.gp_regs[reg as usize] = data;
    }

    /// Register read by number; x0 always reads zero.
    pub fn x(&self, reg: u8) -> u64 {
        match reg {
            0 => 0,
            r => self.gp_regs[r as usize & 31],
        }
    }

    /// Register write by number; writes to x0 are dropped.
    pub fn set_x(&mut self, reg: u8, val: u64) {
        if reg != 0 {
            self.gp_regs[reg as usize & 31] = val;
        }
    }
}
