use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nes_apu_core::nes::cartridge::{Cartridge, RomHeader};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Config {
    rom: Option<PathBuf>,
    json: bool,
}

#[derive(Debug, Serialize)]
struct RomReport {
    file: String,
    format: String,
    mapper_id: u8,
    mapper_name: String,
    prg_banks: usize,
    chr_banks: usize,
    chr_ram: bool,
    mirroring: String,
    battery: bool,
    trainer: bool,
    prg_sha1: String,
    chr_sha1: String,
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--json" => cfg.json = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
            other => {
                if cfg.rom.is_some() {
                    anyhow::bail!("only one ROM path may be given (extra: {other})");
                }
                cfg.rom = Some(PathBuf::from(other));
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "iNES header and bank inspector\n\n\
Usage:\n\
  rom_info <rom.nes> [--json]\n\n\
Options:\n\
  --json                         Print the report as JSON\n\
  -h, --help                     Show this help\n\n\
Log level comes from RUST_LOG (default info)."
    );
}

fn inspect(path: &Path) -> Result<RomReport> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let header = RomHeader::parse(&bytes)
        .with_context(|| format!("bad header in {}", path.display()))?;
    tracing::debug!(
        mapper = header.mapper_id(),
        prg_chunks = header.prg_chunks,
        chr_chunks = header.chr_chunks,
        "header parsed"
    );

    let cart = Cartridge::from_bytes(&bytes)
        .with_context(|| format!("failed to load {}", path.display()))?;

    Ok(RomReport {
        file: path.display().to_string(),
        format: format!("{:?}", cart.format()),
        mapper_id: cart.mapper_id(),
        mapper_name: cart.mapper_name().to_string(),
        prg_banks: cart.prg_banks(),
        chr_banks: cart.chr_banks(),
        chr_ram: cart.chr_banks() == 0,
        mirroring: format!("{:?}", cart.mirror()),
        battery: header.has_battery(),
        trainer: header.has_trainer(),
        prg_sha1: cart.prg_digest(),
        chr_sha1: cart.chr_digest(),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = parse_args()?;
    let rom = cfg
        .rom
        .context("missing ROM path\nUse --help to view supported options.")?;
    let report = inspect(&rom)?;

    if cfg.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode report")?
        );
        return Ok(());
    }

    println!("File:       {}", report.file);
    println!("Format:     {}", report.format);
    println!("Mapper:     {} ({:03})", report.mapper_name, report.mapper_id);
    println!(
        "PRG:        {} x 16 KiB  sha1 {}",
        report.prg_banks, report.prg_sha1
    );
    if report.chr_ram {
        println!("CHR:        8 KiB RAM    sha1 {}", report.chr_sha1);
    } else {
        println!(
            "CHR:        {} x 8 KiB   sha1 {}",
            report.chr_banks, report.chr_sha1
        );
    }
    println!("Mirroring:  {}", report.mirroring);
    println!("Battery:    {}", if report.battery { "yes" } else { "no" });
    println!("Trainer:    {}", if report.trainer { "yes" } else { "no" });
    Ok(())
}
