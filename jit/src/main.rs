// rvjit - run a RISC-V 64 Linux executable on the host
//
// Usage:
//   rvjit program.elf [args...]
//   rvjit --hot-threshold 1000 --stats -v program.elf

use anyhow::{Context, Result};
use clap::Parser;
use rvjit::cache::CACHE_HOT_COUNT;
use rvjit::{CacheConfig, CodeCache, Machine};
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "rvjit")]
#[command(about = "RISC-V 64 user-mode dynamic binary translator")]
#[command(version)]
struct Args {
    /// RISC-V ELF executable
    program: PathBuf,

    /// Arguments passed to the guest program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,

    /// Block entries before a block is handed to the translator
    #[arg(long, default_value_t = CACHE_HOT_COUNT, value_parser = clap::value_parser!(u64).range(1..))]
    hot_threshold: u64,

    /// Executable arena size in MiB
    #[arg(long, default_value_t = 64)]
    arena_mib: usize,

    /// Guest stack size in MiB
    #[arg(long, default_value_t = 32)]
    stack_mib: u64,

    /// Print engine and cache statistics on exit
    #[arg(long)]
    stats: bool,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = CacheConfig {
        arena_size: args.arena_mib * 1024 * 1024,
        hot_threshold: args.hot_threshold,
        ..CacheConfig::default()
    };
    let cache = CodeCache::with_config(config).context("Failed to create code cache")?;
    let mut machine = Machine::new(cache);

    machine
        .load_program(&args.program)
        .with_context(|| format!("Failed to load {}", args.program.display()))?;

    let mut argv: Vec<&[u8]> = vec![args.program.as_os_str().as_bytes()];
    argv.extend(args.args.iter().map(|a| a.as_bytes()));
    machine
        .setup(&argv, args.stack_mib * 1024 * 1024)
        .context("Failed to set up guest stack")?;

    let code = machine.run().context("Guest execution failed")?;

    if args.stats {
        print_stats(&machine);
    }

    std::process::exit(code);
}

fn print_stats(machine: &Machine) {
    let engine = machine.engine().stats();
    let cache = machine.engine().cache().stats();
    let hot = machine.engine().translator();

    eprintln!("rvjit statistics");
    eprintln!("================");
    eprintln!("  Outer iterations:  {}", engine.outer_iterations);
    eprintln!("  Interpreted insns: {}", engine.interp_steps);
    eprintln!("  Compiled runs:     {}", engine.compiled_runs);
    eprintln!("  Chained branches:  {}", engine.chained);
    eprintln!("  Translations:      {}", engine.translations);
    eprintln!("  System calls:      {}", machine.syscalls().calls);
    eprintln!(
        "  Cache: {} slots, {} lookups, {:.1}% hits, {}/{} bytes of code",
        cache.slots,
        cache.lookups,
        cache.hit_rate() * 100.0,
        cache.arena_used,
        cache.arena_capacity
    );
    eprintln!(
        "  Hot blocks: {} (threshold {})",
        hot.len(),
        machine.engine().cache().hot_threshold()
    );
    for block in hot.hot_blocks() {
        let next: Vec<String> = block.successors.iter().map(|pc| format!("0x{pc:x}")).collect();
        eprintln!(
            "    0x{:08x}..0x{:08x}: {} insns, {} requests, {:?} -> [{}]",
            block.start,
            block.end,
            block.insns,
            block.requests,
            block.exit,
            next.join(", ")
        );
    }
}
