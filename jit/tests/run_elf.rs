// End-to-end: build a tiny RISC-V executable on disk, load it and run it.

use rvjit::{BlockExit, CacheConfig, CodeCache, Error, ExitReason, GpReg, Machine, STACK_SIZE};
use std::io::Write;

const PF_X: u32 = 1;
const PF_R: u32 = 4;
const EM_RISCV: u16 = 243;

fn elf(machine: u16, vaddr: u64, code: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 64];
    out[..4].copy_from_slice(b"\x7fELF");
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // little endian
    out[6] = 1;
    out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out[18..20].copy_from_slice(&machine.to_le_bytes());
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&vaddr.to_le_bytes());
    out[32..40].copy_from_slice(&64u64.to_le_bytes());
    out[52..54].copy_from_slice(&64u16.to_le_bytes());
    out[54..56].copy_from_slice(&56u16.to_le_bytes());
    out[56..58].copy_from_slice(&1u16.to_le_bytes());

    let mut ph = vec![0u8; 56];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
    ph[8..16].copy_from_slice(&120u64.to_le_bytes());
    ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
    ph[24..32].copy_from_slice(&vaddr.to_le_bytes());
    ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
    ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());
    ph[48..56].copy_from_slice(&0x1000u64.to_le_bytes());
    out.extend_from_slice(&ph);
    out.extend_from_slice(code);
    out
}

fn words(insns: &[u32]) -> Vec<u8> {
    insns.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn write_temp(image: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(image).unwrap();
    file.flush().unwrap();
    file
}

fn cache(threshold: u64) -> CodeCache {
    CodeCache::with_config(CacheConfig {
        entries: 4096,
        arena_size: 1 << 20,
        hot_threshold: threshold,
    })
    .unwrap()
}

#[test]
fn test_exit_status_from_argc() {
    // ld a0, 0(sp) ; addi a0, a0, 40 ; addi a7, zero, 93 ; ecall
    let vaddr = 0x7000_0000;
    let code = words(&[0x0001_3503, 0x0285_0513, 0x05d0_0893, 0x0000_0073]);
    let file = write_temp(&elf(EM_RISCV, vaddr, &code));

    let mut machine = Machine::new(cache(100));
    let info = machine.load_program(file.path()).unwrap();
    assert_eq!(info.entry, vaddr);
    machine.setup(&["prog", "a", "b"], STACK_SIZE).unwrap();

    assert_eq!(machine.run().unwrap(), 43);
    assert_eq!(machine.state().get_gp_reg(GpReg::A7), 93);
}

#[test]
fn test_step_stops_at_each_syscall() {
    // addi a7, zero, 214 ; addi a0, zero, 0 ; ecall ; addi a7, zero, 93 ; ecall
    let vaddr = 0x7400_0000;
    let code = words(&[0x0d60_0893, 0x0000_0513, 0x0000_0073, 0x05d0_0893, 0x0000_0073]);
    let file = write_temp(&elf(EM_RISCV, vaddr, &code));

    let mut machine = Machine::new(cache(100));
    machine.load_program(file.path()).unwrap();
    machine.setup(&["prog"], 1 << 20).unwrap();

    assert_eq!(machine.step().unwrap(), ExitReason::SystemCall);
    assert_eq!(machine.state().pc, vaddr + 12);
    assert_eq!(machine.state().get_gp_reg(GpReg::A7), 214);
}

#[test]
fn test_countdown_loop_profiles_hot_block() {
    // addi t0, zero, 200
    // loop: addi t0, t0, -1 ; bne t0, zero, loop
    // addi a0, zero, 0 ; addi a7, zero, 93 ; ecall
    let vaddr = 0x7800_0000;
    let code = words(&[
        0x0c80_0293,
        0xfff2_8293,
        0xfe02_9ee3,
        0x0000_0513,
        0x05d0_0893,
        0x0000_0073,
    ]);
    let file = write_temp(&elf(EM_RISCV, vaddr, &code));

    let mut machine = Machine::new(cache(50));
    machine.load_program(file.path()).unwrap();
    machine.setup(&["loop"], 1 << 20).unwrap();
    assert_eq!(machine.run().unwrap(), 0);

    let hot: Vec<_> = machine.engine().translator().hot_blocks().collect();
    assert_eq!(hot.len(), 1);
    assert_eq!(hot[0].start, vaddr + 4);
    assert_eq!(
        hot[0].exit,
        BlockExit::Branch {
            taken: vaddr + 4,
            fallthrough: vaddr + 12
        }
    );
    // Every loop entry after the 50th asked for a translation.
    assert_eq!(hot[0].requests, 199 - 50 + 1);
    assert_eq!(machine.engine().stats().translations, 0);
}

#[test]
fn test_rejects_foreign_machine() {
    let file = write_temp(&elf(62, 0x7c00_0000, &words(&[0x0000_0073])));
    let mut machine = Machine::new(cache(100));
    let err = machine.load_program(file.path()).unwrap_err();
    assert!(matches!(err, Error::NotRiscv(62)));
    assert!(!machine.mmu().contains(rvjit::GuestAddr(0x7c00_0000), 4));
}

#[test]
fn test_missing_file_is_io_error() {
    let mut machine = Machine::new(cache(100));
    let err = machine
        .load_program("/nonexistent/rvjit-test-binary")
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
