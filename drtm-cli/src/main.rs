#![allow(missing_docs)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use drtm_core::demo::DemoKernel;
use drtm_core::registers::bytes_value;
use drtm_core::{
    Architecture, Engine, EngineConfig, MemoryImage, SymbolManager, TargetCapability, ThreadId,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "drtm",
    author,
    version,
    about = "Inspect RTOS threads on a halted Cortex-M target",
    long_about = None
)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Core the firmware runs on (cortex-m0/m1/m3/m4/m7)
    #[arg(long, global = true)]
    core: Option<Architecture>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    source: Source,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Source {
    /// Attach to this chip through a debug probe (probe-rs target name)
    #[arg(long, global = true)]
    chip: Option<String>,

    /// Probe index as listed by probe-rs
    #[arg(long, global = true, default_value_t = 0)]
    probe: usize,

    /// Firmware ELF providing symbols
    #[arg(long, global = true)]
    elf: Option<PathBuf>,

    /// Raw RAM dump taken from a halted target
    #[arg(long, global = true, conflicts_with = "chip")]
    dump: Option<PathBuf>,

    /// Load address of the dump
    #[arg(long, global = true, value_parser = parse_address)]
    base: Option<u64>,

    /// Extra symbol, NAME=ADDR (repeatable)
    #[arg(long = "symbol", global = true, value_parser = parse_symbol)]
    symbols: Vec<(String, u64)>,

    /// Use the built-in simulated kernel
    #[arg(long, global = true, conflicts_with_all = ["chip", "dump"])]
    demo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List threads
    Threads,
    /// Show the DRTM layout descriptor
    Layout,
    /// Show the registers of a thread
    Regs {
        #[arg(short, long)]
        thread: u32,
    },
    /// Write one register of a thread
    SetReg {
        #[arg(short, long)]
        thread: u32,
        #[arg(short, long)]
        index: u16,
        /// Hex bytes in target order, e.g. "00100020"
        #[arg(short, long)]
        value: String,
    },
}

fn parse_address(s: &str) -> Result<u64, String> {
    let cleaned = s.trim().replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn parse_symbol(s: &str) -> Result<(String, u64), String> {
    let (name, address) =
        s.split_once('=').ok_or_else(|| format!("expected NAME=ADDR, got '{s}'"))?;
    Ok((name.trim().to_string(), parse_address(address)?))
}

fn load_symbols(source: &Source) -> Result<SymbolManager> {
    let mut symbols = SymbolManager::new();
    if let Some(elf) = &source.elf {
        symbols.load_elf(elf)?;
    }
    for (name, address) in &source.symbols {
        symbols.insert(name.clone(), *address);
    }
    Ok(symbols)
}

fn open_dump(path: &Path, base: Option<u64>, symbols: &SymbolManager) -> Result<MemoryImage> {
    let base = base.context("--dump needs --base")?;
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read dump {}", path.display()))?;
    log::info!("Loaded {} byte dump at 0x{base:08X}", data.len());

    let mut image = MemoryImage::new();
    image.map(base, data);
    for (name, address) in symbols.iter() {
        image.add_symbol(name, address);
    }
    Ok(image)
}

#[cfg(feature = "hardware")]
fn open_probe(
    chip: &str,
    probe: usize,
    symbols: SymbolManager,
) -> Result<(Box<dyn TargetCapability + Send>, Option<Architecture>)> {
    let mut target = drtm_core::ProbeTarget::attach(chip, probe, symbols)?;
    let detected = target.architecture()?;
    Ok((Box::new(target), detected))
}

#[cfg(not(feature = "hardware"))]
fn open_probe(
    _chip: &str,
    _probe: usize,
    _symbols: SymbolManager,
) -> Result<(Box<dyn TargetCapability + Send>, Option<Architecture>)> {
    bail!("drtm was built without the `hardware` feature, use --dump or --demo")
}

/// Build the capability for the selected target source.
fn open_target(
    source: &Source,
) -> Result<(Box<dyn TargetCapability + Send>, Option<Architecture>)> {
    if source.demo {
        let image = DemoKernel::sample().build().context("Failed to build demo kernel")?;
        return Ok((Box::new(image), Some(Architecture::CortexM4)));
    }
    let symbols = load_symbols(source)?;
    if let Some(dump) = &source.dump {
        return Ok((Box::new(open_dump(dump, source.base, &symbols)?), None));
    }
    if let Some(chip) = &source.chip {
        return open_probe(chip, source.probe, symbols);
    }
    bail!("No target selected: use --chip, --dump or --demo")
}

fn thread_id(raw: u32) -> Result<ThreadId> {
    ThreadId::new(raw).context("Thread id 0 is reserved")
}

fn register_name(index: u16) -> String {
    match index {
        13 => "sp".to_string(),
        14 => "lr".to_string(),
        15 => "pc".to_string(),
        16 => "xpsr".to_string(),
        n => format!("r{n}"),
    }
}

#[derive(Serialize)]
struct RegisterReport {
    index: u16,
    name: String,
    value: Option<String>,
}

fn print_threads(engine: &Engine, json: bool) -> Result<()> {
    let snapshot = engine.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!(
        "{:>4}  {:<20} {:<12} {:>10}  {:>10}  {:>4}",
        "ID", "NAME", "STATE", "ADDRESS", "SP", "PRIO"
    );
    for thread in snapshot.threads().iter() {
        let marker = if snapshot.current() == Some(thread.id()) { '*' } else { ' ' };
        println!(
            "{marker}{:>3}  {:<20} {:<12} 0x{:08X}  0x{:08X}  {:>4}",
            thread.id().get(),
            thread.name().unwrap_or("<unnamed>"),
            thread.state().to_string(),
            thread.address(),
            thread.stack_pointer(),
            thread.priority().map_or_else(|| "-".to_string(), |p| p.to_string()),
        );
    }
    if snapshot.threads().is_empty() {
        println!("(no threads)");
    }
    Ok(())
}

fn print_layout(engine: &Engine, json: bool) -> Result<()> {
    let layout = engine.layout().context("Target exports no valid DRTM layout")?;
    if json {
        println!("{}", serde_json::to_string_pretty(layout)?);
        return Ok(());
    }

    println!("DRTM layout v{}", layout.version);
    println!("  thread list head   0x{:08X}", layout.thread_list_head_address);
    println!("  current thread     0x{:08X}", layout.current_thread_address);
    if let Some(address) = layout.scheduler_started_address {
        println!("  scheduler started  0x{address:08X}");
    }
    println!("  struct size        {} bytes", layout.struct_size);
    let intrusive = if layout.intrusive_link { " (intrusive)" } else { "" };
    println!("  next link          +0x{:02X}{intrusive}", layout.next_offset);
    println!("  state              +0x{:02X} ({} bytes)", layout.state_offset, layout.state_width);
    println!("  stack pointer      +0x{:02X}", layout.stack_pointer_offset);
    for reg in &layout.registers {
        println!("  {:<5} {} bytes  {:?}", register_name(reg.index), reg.width, reg.source);
    }
    Ok(())
}

fn print_registers(engine: &mut Engine, id: ThreadId, json: bool) -> Result<()> {
    let layout = engine.layout().context("Target exports no valid DRTM layout")?;
    let indices: Vec<u16> = layout.registers.iter().map(|r| r.index).collect();

    let mut reports = Vec::with_capacity(indices.len());
    for index in indices {
        let value = match engine.get_register(id, index) {
            Ok(text) => Some(text),
            Err(drtm_core::DrtmError::InvalidThreadId(raw)) => bail!("No thread with id {raw}"),
            Err(e) => {
                log::debug!("Register {index}: {e}");
                None
            }
        };
        reports.push(RegisterReport { index, name: register_name(index), value });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    println!("{}", engine.describe(id)?);
    for report in reports {
        match report.value {
            Some(text) => {
                let value = bytes_value(&hex::decode(&text)?);
                println!("  {:<5} 0x{value:08X}  ({text})", report.name);
            }
            None => println!("  {:<5} unavailable", report.name),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let (target, detected) = open_target(&cli.source)?;
    let architecture = cli.core.or(detected).unwrap_or(Architecture::CortexM4);

    let mut engine = Engine::initialize(target, architecture.core_id(), config)
        .context("Failed to initialize thread awareness")?;
    engine.refresh().context("Failed to read the thread list")?;

    match cli.command {
        Commands::Threads => print_threads(&engine, cli.json)?,
        Commands::Layout => print_layout(&engine, cli.json)?,
        Commands::Regs { thread } => print_registers(&mut engine, thread_id(thread)?, cli.json)?,
        Commands::SetReg { thread, index, value } => {
            let id = thread_id(thread)?;
            engine
                .set_register(id, index, &value)
                .with_context(|| {
                    format!("Failed to write {} of thread {id}", register_name(index))
                })?;
            let value = engine.get_register(id, index)?;
            println!("{} of thread {id} = {value}", register_name(index));
        }
    }
    Ok(())
}
