//! Doubles for the CPU and PPU contracts and an iNES image builder.

use std::{collections::VecDeque, fs, path::PathBuf};

use super::cartridge::{Cartridge, HEADER_SIZE, TRAINER_SIZE};
use super::cpu::{Cpu, CpuBus};
use super::ppu::Ppu;

const PRG_CHUNK: usize = 16 * 1024;
const CHR_CHUNK: usize = 8 * 1024;

pub struct RomBuilder {
    mapper_id: u8,
    prg_chunks: u8,
    chr_chunks: u8,
    flags6: u8,
    flags7: u8,
    byte8: u8,
    extra_chr: usize,
}

impl RomBuilder {
    pub fn new(mapper_id: u8) -> Self {
        Self {
            mapper_id,
            prg_chunks: 1,
            chr_chunks: 1,
            flags6: 0,
            flags7: 0,
            byte8: 0,
            extra_chr: 0,
        }
    }

    pub fn prg_chunks(mut self, chunks: u8) -> Self {
        self.prg_chunks = chunks;
        self
    }

    pub fn chr_chunks(mut self, chunks: u8) -> Self {
        self.chr_chunks = chunks;
        self
    }

    /// Low flag bits of byte 6; the mapper nibble is filled in by `build`.
    pub fn flags6(mut self, flags: u8) -> Self {
        self.flags6 = flags & 0x0F;
        self
    }

    pub fn flags7(mut self, flags: u8) -> Self {
        self.flags7 = flags & 0x0F;
        self
    }

    pub fn byte8(mut self, value: u8) -> Self {
        self.byte8 = value;
        self
    }

    pub fn extra_chr(mut self, len: usize) -> Self {
        self.extra_chr = len;
        self
    }

    /// PRG bank `i` is filled with `i + 1`, a trainer with 0xEE and CHR
    /// bank `i` with `0x80 | i`.
    pub fn build(self) -> Vec<u8> {
        let mut rom = vec![0u8; HEADER_SIZE];
        rom[..4].copy_from_slice(b"NES\x1A");
        rom[4] = self.prg_chunks;
        rom[5] = self.chr_chunks;
        rom[6] = ((self.mapper_id & 0x0F) << 4) | self.flags6;
        rom[7] = (self.mapper_id & 0xF0) | self.flags7;
        rom[8] = self.byte8;

        if self.flags6 & 0x04 != 0 {
            rom.extend(std::iter::repeat_n(0xEE, TRAINER_SIZE));
        }
        for bank in 0..self.prg_chunks {
            rom.extend(std::iter::repeat_n(bank.wrapping_add(1), PRG_CHUNK));
        }
        for bank in 0..self.chr_chunks {
            rom.extend(std::iter::repeat_n(0x80 | bank, CHR_CHUNK));
        }
        rom.extend(std::iter::repeat_n(0x55, self.extra_chr));
        rom
    }

    pub fn cartridge(self) -> Cartridge {
        Cartridge::from_bytes(&self.build()).unwrap()
    }
}

pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "nes_apu_core_{}_{}",
        std::process::id(),
        name
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Read(u16),
    Write(u16, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    Reset,
    Nmi,
    Irq,
}

/// Performs one scripted bus access per clock and records everything the
/// bus does to it.
#[derive(Default)]
pub struct ScriptedCpu {
    pub script: VecDeque<BusOp>,
    pub reads: Vec<(u16, u8)>,
    pub clocks: u64,
    pub events: Vec<CpuEvent>,
}

impl ScriptedCpu {
    pub fn with_script(ops: impl IntoIterator<Item = BusOp>) -> Self {
        Self {
            script: ops.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn count(&self, event: CpuEvent) -> usize {
        self.events.iter().filter(|&&e| e == event).count()
    }
}

impl Cpu for ScriptedCpu {
    fn clock(&mut self, bus: &mut dyn CpuBus) {
        self.clocks += 1;
        match self.script.pop_front() {
            Some(BusOp::Read(addr)) => {
                let value = bus.read(addr, false);
                self.reads.push((addr, value));
            }
            Some(BusOp::Write(addr, data)) => bus.write(addr, data),
            None => {}
        }
    }

    fn reset(&mut self, _bus: &mut dyn CpuBus) {
        self.events.push(CpuEvent::Reset);
    }

    fn nmi(&mut self, _bus: &mut dyn CpuBus) {
        self.events.push(CpuEvent::Nmi);
    }

    fn irq(&mut self, _bus: &mut dyn CpuBus) {
        self.events.push(CpuEvent::Irq);
    }

    fn instruction_count(&self) -> u64 {
        self.clocks
    }
}

/// Register-file PPU that can raise NMI, finish frames and clock the mapper
/// scanline counter on fixed dot counts.
#[derive(Default)]
pub struct StubPpu {
    pub clocks: u64,
    pub registers: [u8; 8],
    pub writes: Vec<(u16, u8)>,
    pub nmi_pending: bool,
    pub frame_length: Option<u64>,
    pub scanline_length: Option<u64>,
    pub connected: bool,
    pub resets: u32,
    frame_done: bool,
}

impl Ppu for StubPpu {
    fn clock(&mut self, cart: &mut Cartridge) {
        self.clocks += 1;
        if let Some(len) = self.frame_length
            && self.clocks % len == 0
        {
            self.frame_done = true;
        }
        if let Some(len) = self.scanline_length
            && self.clocks % len == 0
        {
            cart.scanline();
        }
    }

    fn cpu_read(&mut self, reg: u16, _read_only: bool, _cart: &mut Cartridge) -> u8 {
        self.registers[reg as usize]
    }

    fn cpu_write(&mut self, reg: u16, data: u8, _cart: &mut Cartridge) {
        self.registers[reg as usize] = data;
        self.writes.push((reg, data));
    }

    fn connect_cartridge(&mut self, _cart: &Cartridge) {
        self.connected = true;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    fn frame_complete(&self) -> bool {
        self.frame_done
    }

    fn clear_frame_complete(&mut self) {
        self.frame_done = false;
    }
}
