use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use x86emu_core::logging::{LogCategory, LogConfig, LogLevel};
use x86emu_core::{Cpu, Emulator, EmulatorConfig};

/// Parse a decimal or 0x-prefixed hexadecimal number
fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    LogLevel::from_str(s).ok_or_else(|| {
        format!(
            "invalid log level '{}' (expected off, error, warn, info, debug or trace)",
            s
        )
    })
}

#[derive(Parser)]
#[command(name = "x86emu", about = "Run a flat 32-bit x86 binary image")]
struct Args {
    /// Raw binary image to load
    image: PathBuf,

    /// Emulated RAM size in bytes
    #[arg(long, value_parser = parse_number, default_value = "0x100000")]
    memory_size: u32,

    /// Address the image is loaded at
    #[arg(long, value_parser = parse_number, default_value = "0x7C00")]
    load_address: u32,

    /// Initial EIP (defaults to the load address)
    #[arg(long, value_parser = parse_number)]
    eip: Option<u32>,

    /// Initial ESP
    #[arg(long, value_parser = parse_number, default_value = "0x7C00")]
    esp: u32,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,

    /// Dump the final CPU state to this file as JSON
    #[arg(long)]
    save: Option<PathBuf>,

    /// Do not print the register dump on exit
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// Global core log level
    #[arg(long, value_parser = parse_log_level, default_value = "info")]
    log_level: LogLevel,

    /// Log level for instruction tracing
    #[arg(long, value_parser = parse_log_level)]
    log_cpu: Option<LogLevel>,

    /// Log level for interrupt delivery
    #[arg(long, value_parser = parse_log_level)]
    log_interrupts: Option<LogLevel>,

    /// Write core logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Why the run loop stopped
#[derive(Debug, PartialEq, Eq)]
enum StopReason {
    ReturnedToZero,
    Halted,
    StepLimit,
}

fn configure_logging(args: &Args) -> Result<()> {
    let config = LogConfig::global();
    config.set_global_level(args.log_level);
    if let Some(level) = args.log_cpu {
        config.set_level(LogCategory::CPU, level);
    }
    if let Some(level) = args.log_interrupts {
        config.set_level(LogCategory::Interrupts, level);
    }
    if let Some(path) = args.log_file.as_ref() {
        config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

/// Step until EIP reaches 0, the CPU halts (nothing here raises IRQs), or the
/// step limit runs out
fn run(emu: &mut Emulator, max_steps: Option<u64>) -> Result<StopReason> {
    let mut steps = 0u64;
    loop {
        if emu.eip == 0 {
            return Ok(StopReason::ReturnedToZero);
        }
        if emu.is_halted() {
            return Ok(StopReason::Halted);
        }
        if max_steps.is_some_and(|max| steps >= max) {
            return Ok(StopReason::StepLimit);
        }

        if let Err(e) = emu.step() {
            eprint!("{}", emu.dump_registers());
            return Err(e).context("CPU stopped");
        }
        steps += 1;
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    configure_logging(&args)?;

    if args.load_address >= args.memory_size {
        anyhow::bail!(
            "load address {:#X} is outside memory of {:#X} bytes",
            args.load_address,
            args.memory_size
        );
    }

    let image = std::fs::read(&args.image)
        .with_context(|| format!("reading image {}", args.image.display()))?;

    let config = EmulatorConfig {
        memory_size: args.memory_size as usize,
        initial_eip: args.eip.unwrap_or(args.load_address),
        initial_esp: args.esp,
    };
    let mut emu = Emulator::with_config(config);
    emu.load_image(args.load_address, &image)
        .with_context(|| format!("loading {} bytes at {:#X}", image.len(), args.load_address))?;
    info!(
        "Loaded {} ({} bytes) at {:#010X} into {} bytes of RAM, EIP={:#010X}",
        args.image.display(),
        image.len(),
        args.load_address,
        emu.memory_size(),
        emu.eip
    );

    let result = run(&mut emu, args.max_steps);

    if let Some(path) = args.save.as_ref() {
        let state = emu.save_state();
        let mut f = File::create(path)?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    let reason = result?;
    match reason {
        StopReason::ReturnedToZero => info!("End of program after {} instructions", emu.cycles),
        StopReason::Halted => info!("CPU halted at {:#010X}", emu.eip),
        StopReason::StepLimit => warn!("Step limit reached after {} instructions", emu.cycles),
    }

    if !args.quiet {
        print!("{}", emu.dump_registers());
    }

    LogConfig::global().clear_log_file();
    Ok(())
}
