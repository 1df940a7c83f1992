// syscall.rs - RISC-V Linux system calls forwarded to the host
//
// Call number in a7, arguments in a0..a5, result back in a0. Errors are
// returned to the guest as negated errno values, like the kernel does.

use crate::addr::GuestAddr;
use crate::error::Result;
use crate::mmu::Mmu;
use crate::state::{ExecutionState, GpReg};
use tracing::{debug, warn};

pub const SYS_CLOSE: u64 = 57;
pub const SYS_WRITE: u64 = 64;
pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_BRK: u64 = 214;

/// What the driver does after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Store the value in a0 and resume the guest
    Return(u64),
    /// Guest exited with this status
    Exit(i32),
}

pub trait SyscallHandler {
    fn handle(&mut self, nr: u64, state: &mut ExecutionState, mmu: &mut Mmu) -> Result<SyscallOutcome>;
}

/// Kernel-style error return: `-errno` as a register value.
fn errno(code: i32) -> SyscallOutcome {
    SyscallOutcome::Return((-(code as i64)) as u64)
}

#[derive(Debug, Default)]
pub struct LinuxSyscalls {
    /// System calls handled, unknown ones included
    pub calls: u64,
    /// Lowest program break; the allocator cursor at the first `brk`
    start_brk: Option<u64>,
}

impl LinuxSyscalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&mut self, state: &ExecutionState, mmu: &Mmu) -> SyscallOutcome {
        let fd = state.get_gp_reg(GpReg::A0) as i32;
        let buf = GuestAddr(state.get_gp_reg(GpReg::A1));
        let len = state.get_gp_reg(GpReg::A2);

        if len != 0 && !mmu.contains(buf, len) {
            return errno(libc::EFAULT);
        }
        // SAFETY: the range was checked to be mapped guest memory.
        let n = unsafe { libc::write(fd, buf.to_host().as_ptr(), len as usize) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return errno(err.raw_os_error().unwrap_or(libc::EIO));
        }
        SyscallOutcome::Return(n as u64)
    }

    /// Program break on top of the bump allocator.
    ///
    /// The break starts where the allocator cursor is at the first call, so
    /// the stack and argument strings below it are never released. Requests
    /// below that point, or that the allocator cannot satisfy, leave the break
    /// where it is and report it, like the kernel does.
    fn brk(&mut self, state: &ExecutionState, mmu: &mut Mmu) -> SyscallOutcome {
        let requested = state.get_gp_reg(GpReg::A0);
        let current = mmu.cursor().0;
        let start = *self.start_brk.get_or_insert(current);
        if requested < start {
            return SyscallOutcome::Return(current);
        }

        let delta = if requested >= current {
            i64::try_from(requested - current).ok()
        } else {
            i64::try_from(current - requested).ok().map(|d| -d)
        };
        let Some(delta) = delta else {
            return SyscallOutcome::Return(current);
        };
        if delta != 0 {
            if let Err(err) = mmu.alloc(delta) {
                debug!(requested = format_args!("0x{requested:x}"), %err, "brk refused");
                return SyscallOutcome::Return(current);
            }
        }
        SyscallOutcome::Return(mmu.cursor().0)
    }
}

impl SyscallHandler for LinuxSyscalls {
    fn handle(&mut self, nr: u64, state: &mut ExecutionState, mmu: &mut Mmu) -> Result<SyscallOutcome> {
        self.calls += 1;
        let outcome = match nr {
            SYS_WRITE => self.write(state, mmu),
            SYS_EXIT | SYS_EXIT_GROUP => SyscallOutcome::Exit(state.get_gp_reg(GpReg::A0) as i32),
            SYS_BRK => self.brk(state, mmu),
            // Guest stdio belongs to the host process; nothing else can be open.
            SYS_CLOSE => match state.get_gp_reg(GpReg::A0) {
                0..=2 => SyscallOutcome::Return(0),
                _ => errno(libc::EBADF),
            },
            _ => {
                warn!(
                    nr,
                    a0 = format_args!("0x{:x}", state.get_gp_reg(GpReg::A0)),
                    a1 = format_args!("0x{:x}", state.get_gp_reg(GpReg::A1)),
                    pc = format_args!("0x{:x}", state.pc),
                    "unknown system call"
                );
                errno(libc::ENOSYS)
            }
        };
        debug!(nr, ?outcome, "system call");
        Ok(outcome)
    }
}
