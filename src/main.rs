mod cpu;
mod dev;
mod io;
mod jit;
mod machine;
mod mem;
mod timing;
mod util;

use std::io::BufRead;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::{unbounded, Receiver};

use crate::cpu::state::seg;
use crate::dev::post::Post;
use crate::dev::ram::Ram;
use crate::dev::rom::Bios;
use crate::machine::{Machine, MachineConfig};

/// Cycles executed per outer loop iteration before the control channel is
/// polled.
const SLICE_CYCLES: i64 = 1_000_000;

#[derive(Parser)]
#[command(name = "pcbox", about = "Cycle-driven real-mode PC emulator core")]
struct Args {
    /// BIOS ROM image, mapped so it ends at the top of the first megabyte
    bios: String,

    /// Conventional RAM in KiB
    #[arg(long, default_value_t = 640)]
    ram_kib: u32,

    /// Emulated CPU clock in Hz
    #[arg(long, default_value_t = 4_772_727)]
    hz: u64,

    /// Interpret everything instead of translating blocks
    #[arg(long)]
    no_jit: bool,

    /// Stop after this many million cycles (0 = run until halt)
    #[arg(long, default_value_t = 0)]
    limit_mcycles: u64,
}

fn spawn_control_thread() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn build_machine(args: &Args) -> Result<Machine> {
    let mut m = Machine::new(MachineConfig {
        ram_size: args.ram_kib * 1024,
        hz: args.hz,
        jit: !args.no_jit,
        ..MachineConfig::default()
    });

    Ram::install(&mut m, args.ram_kib * 1024)?;

    let image = util::read_file(&args.bios)
        .with_context(|| format!("reading bios image {:?}", args.bios))?;
    Bios::install(&mut m, image)?;

    Post::install(&mut m)?;

    Ok(m)
}

fn log_stats(m: &Machine) {
    log::info!(
        "tsc {} cycles, {} live blocks, {} translations, {} flushes, {} invalidations",
        m.timing.tsc(),
        m.jit.len(),
        m.jit.translations,
        m.jit.flushes,
        m.jit.invalidations
    );
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut m = build_machine(&args)?;
    let control = spawn_control_thread();

    log::info!(
        "starting at {:04x}:{:04x}, {} Hz, jit {}",
        m.cpu.sregs[seg::CS as usize].sel,
        m.cpu.ip,
        args.hz,
        if m.jit_enabled() { "on" } else { "off" }
    );

    loop {
        m.run(SLICE_CYCLES);

        while let Ok(cmd) = control.try_recv() {
            match cmd.trim() {
                "" => {}
                "reset" => {
                    log::info!("reset requested");
                    m.reset();
                }
                "stats" => log_stats(&m),
                "quit" | "q" => {
                    log_stats(&m);
                    return Ok(());
                }
                other => log::warn!("unknown command {other:?}"),
            }
        }

        if m.cpu.halted && m.timing.next_due_in().is_none() {
            log::info!("cpu halted with no pending timers, exiting");
            break;
        }
        if args.limit_mcycles != 0 && m.timing.tsc() >= args.limit_mcycles * 1_000_000 {
            log::info!("cycle limit reached");
            break;
        }
    }

    log_stats(&m);
    Ok(())
}
