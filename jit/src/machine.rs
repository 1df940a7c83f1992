// machine.rs - One guest process: address space, registers, engine and kernel
//
// Ties the pieces together the way a process starts: load the image, build
// the initial stack, then alternate between running guest code and servicing
// the system call that stopped it.

use crate::addr::GuestAddr;
use crate::cache::CodeCache;
use crate::elf::ElfInfo;
use crate::engine::{Engine, Translator};
use crate::error::{Error, Result};
use crate::interp::Rv64Interpreter;
use crate::mmu::Mmu;
use crate::state::{ExecutionState, ExitReason, GpReg};
use crate::syscall::{LinuxSyscalls, SyscallHandler, SyscallOutcome};
use crate::translate::ProfilingTranslator;
use std::path::Path;
use tracing::{debug, info};

/// Default guest stack size (32 MiB)
pub const STACK_SIZE: u64 = 32 * 1024 * 1024;

pub struct Machine<T = ProfilingTranslator, S = LinuxSyscalls> {
    state: ExecutionState,
    mmu: Mmu,
    engine: Engine<T, Rv64Interpreter>,
    syscalls: S,
}

impl Machine {
    /// A machine that interprets everything and profiles hot blocks.
    pub fn new(cache: CodeCache) -> Self {
        Self::with_parts(cache, ProfilingTranslator::new(), LinuxSyscalls::new())
    }
}

impl<T: Translator, S: SyscallHandler> Machine<T, S> {
    pub fn with_parts(cache: CodeCache, translator: T, syscalls: S) -> Self {
        Self {
            state: ExecutionState::new(),
            mmu: Mmu::new(),
            engine: Engine::new(cache, translator, Rv64Interpreter::new()),
            syscalls,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn engine(&self) -> &Engine<T, Rv64Interpreter> {
        &self.engine
    }

    pub fn syscalls(&self) -> &S {
        &self.syscalls
    }

    /// Load an ELF executable and point the PC at its entry.
    pub fn load_program(&mut self, path: impl AsRef<Path>) -> Result<ElfInfo> {
        let data = std::fs::read(path.as_ref())?;
        self.load_elf(&data)
    }

    pub fn load_elf(&mut self, data: &[u8]) -> Result<ElfInfo> {
        let info = self.mmu.load_elf(data)?;
        self.state.pc = info.entry;
        Ok(info)
    }

    /// Allocate the stack and lay out the process arguments on it.
    ///
    /// From `sp` upwards: argc, argv pointers, a null argv terminator, an
    /// empty envp and an empty auxv. The argument strings live on the heap.
    pub fn setup<A: AsRef<[u8]>>(&mut self, args: &[A], stack_size: u64) -> Result<()> {
        let stack = self.mmu.alloc(stack_size as i64)?;
        let mut sp = stack.0 + stack_size;
        sp -= 8; // auxv
        sp -= 8; // envp
        sp -= 8; // argv terminator
        for arg in args.iter().rev() {
            let bytes = arg.as_ref();
            let at = self.mmu.alloc(bytes.len() as i64 + 1)?;
            self.mmu.write(at, bytes)?;
            self.mmu.write(at.offset(bytes.len() as i64), &[0])?;
            sp -= 8;
            self.mmu.write_u64(GuestAddr(sp), at.0)?;
        }
        sp -= 8;
        self.mmu.write_u64(GuestAddr(sp), args.len() as u64)?;
        self.state.set_gp_reg(GpReg::Sp, sp);

        debug!(
            stack = %stack,
            sp = format_args!("0x{:x}", sp),
            argc = args.len(),
            "initial stack"
        );
        Ok(())
    }

    /// Run guest code up to the next system call.
    pub fn step(&mut self) -> Result<ExitReason> {
        self.engine.step(&mut self.state, &self.mmu)
    }

    /// Run until the guest exits and return its exit status.
    pub fn run(&mut self) -> Result<i32> {
        loop {
            let reason = self.step()?;
            if reason != ExitReason::SystemCall {
                return Err(Error::Invariant(format!(
                    "engine stopped with {reason:?} instead of a system call"
                )));
            }
            let nr = self.state.get_gp_reg(GpReg::A7);
            match self.syscalls.handle(nr, &mut self.state, &mut self.mmu)? {
                SyscallOutcome::Return(value) => self.state.set_gp_reg(GpReg::A0, value),
                SyscallOutcome::Exit(code) => {
                    info!(code, pc = format_args!("0x{:x}", self.state.pc), "guest exited");
                    return Ok(code);
                }
            }
        }
    }
}
