// rvjit - RISC-V (RV64) user-mode dynamic binary translator
//
// Runs a 64-bit RISC-V Linux ELF executable on the host, switching between
// interpreted and translated execution per basic block.
//
// # Architecture
//
// 1. **Addresses** (`addr.rs`): guest memory sits at a fixed offset in the host
//    address space, so translation is a single add
// 2. **Memory** (`mmu.rs`, `elf.rs`): load `PT_LOAD` segments at their translated
//    addresses, then hand out heap and stack with a bump allocator
// 3. **Code cache** (`cache.rs`, `arena.rs`): guest PC -> hotness counter and
//    entry point into an executable arena
// 4. **Engine** (`engine.rs`): the dispatch loop; looks up cached code, counts
//    block entries, requests translation once a block is hot, and falls back to
//    the interpreter (`interp.rs`) otherwise
// 5. **Process** (`machine.rs`, `syscall.rs`): initial stack, argument layout and
//    Linux system calls
//
// # Block Contract
//
// Translated blocks and the interpreter share `ExecutionState` (`state.rs`).
// A block receives a pointer to it, and before returning sets:
// - `exit_reason`: why control came back (branch, system call, needs interpreter)
// - `reenter_pc`: the guest address execution continues at
//
// A branch to a block that is already hot and cached is followed without
// leaving the engine's inner loop.

pub mod addr;
pub mod arena;
pub mod block;
pub mod cache;
pub mod decode;
pub mod elf;
pub mod engine;
pub mod error;
pub mod interp;
pub mod machine;
pub mod mmu;
pub mod state;
pub mod syscall;
pub mod translate;

pub use addr::{GuestAddr, HostAddr, GUEST_MEMORY_OFFSET};
pub use arena::CodePtr;
pub use block::{BlockExit, GuestBlock};
pub use cache::{CacheConfig, CacheStats, CodeCache};
pub use decode::{Instruction, Opcode};
pub use elf::{ElfInfo, Segment};
pub use engine::{Engine, EngineStats, Interpreter, Translator};
pub use error::{CacheError, Error, Result};
pub use interp::Rv64Interpreter;
pub use machine::{Machine, STACK_SIZE};
pub use mmu::Mmu;
pub use state::{ExecutionState, ExitReason, GpReg};
pub use syscall::{LinuxSyscalls, SyscallHandler, SyscallOutcome};
pub use translate::{HotBlock, ProfilingTranslator};
