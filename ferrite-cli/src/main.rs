mod debugger;

use anyhow::{bail, Context};
use clap::Parser;
use ferrite_core::board::{Board, Config};
use ferrite_core::peripherals::rom::Rom;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use debugger::Debugger;

#[derive(Parser, Debug)]
#[command(
    name = "ferrite",
    version,
    about = "RV32IMA system emulator",
    disable_version_flag = true
)]
struct Args {
    /// Print version information.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Run under the interactive debugger.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Main memory size: decimal bytes with an optional `k` or `m` suffix
    /// (base 1024). Must be a nonzero multiple of four.
    #[arg(short = 'm', long = "memory", default_value = "64k", value_parser = parse_size)]
    memory: u32,

    /// Image mapped read-write at the flash window.
    #[arg(short = 'f', long = "flash")]
    flash: Option<PathBuf>,

    /// Raw binary image loaded at the reset vector. A `.hex` file is parsed
    /// as whitespace-separated two-digit hex bytes instead.
    binary: PathBuf,
}

fn parse_size(arg: &str) -> Result<u32, String> {
    let (digits, multiplier) = match arg.strip_suffix(['k', 'K']) {
        Some(digits) => (digits, 1024),
        None => match arg.strip_suffix(['m', 'M']) {
            Some(digits) => (digits, 1024 * 1024),
            None => (arg, 1),
        },
    };
    let count: u32 = digits
        .parse()
        .map_err(|_| format!("invalid size {arg:?}"))?;
    let size = count
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {arg:?} does not fit in 32 bits"))?;
    if size == 0 || size % 4 != 0 {
        return Err(format!("size {arg:?} is not a nonzero multiple of four"));
    }
    Ok(size)
}

fn load_rom(path: &Path) -> anyhow::Result<Rom> {
    let rom = if path.extension().is_some_and(|ext| ext == "hex") {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Rom::from_hex_text(&text)?
    } else {
        Rom::new(fs::read(path).with_context(|| format!("cannot read {}", path.display()))?)
    };
    if rom.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(rom)
}

fn run(args: Args) -> anyhow::Result<u32> {
    let rom = load_rom(&args.binary)?;
    debug!("loaded {} bytes from {}", rom.len(), args.binary.display());
    let flash = match &args.flash {
        Some(path) => Some(
            fs::read(path).with_context(|| format!("cannot read {}", path.display()))?,
        ),
        None => None,
    };
    let mut board = Board::new(Config {
        rom,
        ram_size: args.memory as usize,
        flash,
    })?;
    if args.debug {
        Debugger::new().run(&mut board);
    } else {
        while !board.halted() {
            board.step();
        }
    }
    Ok(board.exit_code())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => process::exit(code as i32),
        Err(err) => {
            eprintln!("ferrite: {err:#}");
            process::exit(1);
        }
    }
}
