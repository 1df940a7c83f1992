// engine.rs - Dispatch loop
//
// The outer loop picks how to run the block at `state.pc`: cached host code if
// it is hot and translated, a fresh translation if it just became hot, the
// interpreter otherwise. The inner loop keeps running as long as control stays
// in hot cached code (block chaining) or in the interpreter, and only falls
// back to the outer loop on a branch to code that is not cached yet. A system
// call leaves both loops and returns to the caller.

use crate::addr::GuestAddr;
use crate::arena::CodePtr;
use crate::cache::CodeCache;
use crate::error::{Error, Result};
use crate::mmu::Mmu;
use crate::state::{ExecutionState, ExitReason};
use tracing::trace;

/// Produces host code for guest blocks.
///
/// An implementation lowers the block at `pc` (see [`crate::block::scan`]),
/// installs the result with [`CodeCache::install`] and returns its entry
/// point, or returns `None` to leave the block to the interpreter.
pub trait Translator {
    fn translate(&mut self, pc: GuestAddr, mmu: &Mmu, cache: &mut CodeCache) -> Result<Option<CodePtr>>;
}

/// Executes one guest instruction at `state.pc`, then sets `reenter_pc` and
/// `exit_reason` (`Interp`, a branch kind, or `SystemCall`).
pub trait Interpreter {
    fn step(&mut self, state: &mut ExecutionState) -> Result<()>;
}

/// Signature of translated code: takes the shared state, returns through
/// `exit_reason`/`reenter_pc`.
pub type BlockFn = unsafe extern "C" fn(*mut ExecutionState);

#[derive(Debug, Clone, Copy)]
enum Target {
    Compiled(CodePtr),
    Interpreter,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Passes through the outer (compile-or-interpret) loop
    pub outer_iterations: u64,
    /// Translated blocks entered
    pub compiled_runs: u64,
    /// Instructions handed to the interpreter
    pub interp_steps: u64,
    /// Branches that went straight into cached code without leaving the inner loop
    pub chained: u64,
    /// Translations the translator produced
    pub translations: u64,
}

pub struct Engine<T, I> {
    cache: CodeCache,
    translator: T,
    interp: I,
    stats: EngineStats,
}

impl<T: Translator, I: Interpreter> Engine<T, I> {
    pub fn new(cache: CodeCache, translator: T, interp: I) -> Self {
        Self {
            cache,
            translator,
            interp,
            stats: EngineStats::default(),
        }
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn translator(&self) -> &T {
        &self.translator
    }

    pub fn interpreter(&self) -> &I {
        &self.interp
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Run the guest until it makes a system call.
    ///
    /// On return `state.pc` is the instruction after the `ecall`; the caller
    /// services the call and invokes `step` again.
    pub fn step(&mut self, state: &mut ExecutionState, mmu: &Mmu) -> Result<ExitReason> {
        loop {
            self.stats.outer_iterations += 1;
            let pc = GuestAddr(state.pc);
            if pc.0 == 0 {
                return Err(Error::Invariant("guest control reached pc 0".into()));
            }

            let mut target = match self.cache.lookup(pc) {
                Some(code) => Target::Compiled(code),
                None => self.cold_target(pc, mmu)?,
            };

            let reason = loop {
                self.run(target, state)?;

                match check_exit(state)? {
                    branch @ (ExitReason::DirectBranch | ExitReason::IndirectBranch) => {
                        let next = GuestAddr(state.reenter_pc);
                        if next.0 != 0 {
                            if let Some(code) = self.cache.lookup(next) {
                                state.pc = next.0;
                                target = Target::Compiled(code);
                                self.stats.chained += 1;
                                continue;
                            }
                        }
                        break branch;
                    }
                    ExitReason::Interp => {
                        state.pc = state.reenter_pc;
                        target = Target::Interpreter;
                    }
                    ExitReason::SystemCall => break ExitReason::SystemCall,
                    ExitReason::None => unreachable!("check_exit rejects None"),
                }
            };

            state.pc = state.reenter_pc;
            if reason == ExitReason::SystemCall {
                return Ok(reason);
            }
        }
    }

    /// Count an entry into an uncached block and translate it once hot.
    fn cold_target(&mut self, pc: GuestAddr, mmu: &Mmu) -> Result<Target> {
        if !self.cache.record_hot(pc)? {
            return Ok(Target::Interpreter);
        }
        match self.translator.translate(pc, mmu, &mut self.cache)? {
            Some(code) => {
                self.stats.translations += 1;
                trace!(pc = %pc, "translated hot block");
                Ok(Target::Compiled(code))
            }
            None => Ok(Target::Interpreter),
        }
    }

    fn run(&mut self, target: Target, state: &mut ExecutionState) -> Result<()> {
        state.exit_reason = ExitReason::None as u32;
        match target {
            Target::Compiled(code) => {
                self.stats.compiled_runs += 1;
                // SAFETY: `code` came from the cache, which only hands out
                // entry points of installed blocks; translators guarantee
                // those blocks follow the `BlockFn` contract.
                unsafe {
                    let block: BlockFn = std::mem::transmute::<*const u8, BlockFn>(code.as_ptr());
                    block(state as *mut ExecutionState);
                }
                Ok(())
            }
            Target::Interpreter => {
                self.stats.interp_steps += 1;
                self.interp.step(state)
            }
        }
    }
}

/// Decode the exit reason a block left behind; `None` or garbage is fatal.
fn check_exit(state: &ExecutionState) -> Result<ExitReason> {
    match state.exit_reason() {
        Ok(ExitReason::None) => Err(Error::Invariant(format!(
            "block at 0x{:x} returned without an exit reason",
            state.pc
        ))),
        Ok(reason) => Ok(reason),
        Err(raw) => Err(Error::Invariant(format!(
            "block at 0x{:x} returned unknown exit reason {raw}",
            state.pc
        ))),
    }
}
