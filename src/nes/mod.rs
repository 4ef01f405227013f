pub mod apu;
pub mod cartridge;
pub mod cpu;
pub mod mapper;
pub mod ppu;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use std::{collections::VecDeque, path::Path};

use crate::config::EmulatorConfig;
use apu::Apu;
use cartridge::Cartridge;
use cpu::{Cpu, CpuBus};
use ppu::Ppu;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub const SYSTEM_CLOCK_HZ: f64 = 5_369_318.0;

const RAM_SIZE: usize = 2048;
const MAX_DEBUG_EVENTS: usize = 512;
const DMC_STALL_CYCLES: u8 = 4;

#[derive(Debug, Clone, Copy)]
struct OamDma {
    page: u8,
    addr: u8,
    addr_start: u8,
    data: u8,
    wait: bool,
    transfer: bool,
}

impl Default for OamDma {
    fn default() -> Self {
        Self {
            page: 0,
            addr: 0,
            addr_start: 0,
            data: 0,
            wait: true,
            transfer: false,
        }
    }
}

struct Board<P: Ppu> {
    ram: [u8; RAM_SIZE],
    ppu: P,
    apu: Apu,
    cart: Option<Cartridge>,

    controller: [u8; 2],
    controller_shift: [u8; 2],
    controller_strobe: bool,

    dma: OamDma,
    dmc_stall: u8,
    cpu_step: u64,
    debug_events: VecDeque<String>,
}

impl<P: Ppu> Board<P> {
    fn new(ppu: P, apu: Apu) -> Self {
        Self {
            ram: [0; RAM_SIZE],
            ppu,
            apu,
            cart: None,
            controller: [0; 2],
            controller_shift: [0; 2],
            controller_strobe: false,
            dma: OamDma::default(),
            dmc_stall: 0,
            cpu_step: 0,
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        let event = event.into();
        tracing::debug!("{event}");
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event);
    }

    fn write_controller_strobe(&mut self, data: u8) {
        let strobe = data & 0x01 != 0;
        if self.controller_strobe && !strobe {
            self.controller_shift = self.controller;
        }
        self.controller_strobe = strobe;
    }

    fn read_controller(&mut self, port: usize, read_only: bool) -> u8 {
        if self.controller_strobe {
            return self.controller[port] & 0x01;
        }

        let bit = self.controller_shift[port] & 0x01;
        if !read_only {
            self.controller_shift[port] >>= 1;
        }
        bit
    }

    fn start_oam_dma(&mut self, page: u8) {
        let addr = self.read(0x2003, false);
        self.dma = OamDma {
            page,
            addr,
            addr_start: addr,
            transfer: true,
            ..OamDma::default()
        };
        self.push_debug_event(format!("OAM DMA start page=${page:02X} oam_addr=${addr:02X}"));
    }

    // Reads on even ticks, `$2004` writes on odd ones.
    fn step_oam_dma(&mut self, system_tick: u64) {
        if self.dma.wait {
            if system_tick % 2 == 1 {
                self.dma.wait = false;
            }
            return;
        }

        if system_tick % 2 == 0 {
            let addr = ((self.dma.page as u16) << 8) | self.dma.addr as u16;
            self.dma.data = self.read(addr, false);
        } else {
            self.write(0x2004, self.dma.data);
            self.dma.addr = self.dma.addr.wrapping_add(1);
            if self.dma.addr == self.dma.addr_start {
                self.dma.transfer = false;
                self.dma.wait = true;
                let page = self.dma.page;
                self.push_debug_event(format!("OAM DMA complete page=${page:02X}"));
            }
        }
    }

    fn service_dmc(&mut self) -> bool {
        if self.dmc_stall > 0 {
            self.dmc_stall -= 1;
            return true;
        }

        let Some(addr) = self.apu.pending_dmc_fetch() else {
            return false;
        };
        let byte = self.read(addr, false);
        self.apu.complete_dmc_fetch(byte);
        self.dmc_stall = DMC_STALL_CYCLES - 1;
        true
    }
}

impl<P: Ppu> CpuBus for Board<P> {
    fn read(&mut self, addr: u16, read_only: bool) -> u8 {
        if let Some(cart) = self.cart.as_mut()
            && let Some(data) = cart.cpu_read(addr)
        {
            return data;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => match self.cart.as_mut() {
                Some(cart) => self.ppu.cpu_read(addr & 0x0007, read_only, cart),
                None => 0,
            },
            0x4015 => self.apu.read_status(),
            0x4016 => self.read_controller(0, read_only),
            0x4017 => self.read_controller(1, read_only),
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, data: u8) {
        if let Some(cart) = self.cart.as_mut()
            && cart.cpu_write(addr, data, self.cpu_step)
        {
            return;
        }

        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = data,
            0x2000..=0x3FFF => {
                if let Some(cart) = self.cart.as_mut() {
                    self.ppu.cpu_write(addr & 0x0007, data, cart);
                }
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.cpu_write(addr, data),
            0x4014 => self.start_oam_dma(data),
            0x4016 => self.write_controller_strobe(data),
            _ => tracing::trace!("unclaimed write ${addr:04X} <- ${data:02X}"),
        }
    }
}

/// The system bus: owns every device and steps them at their relative rates.
pub struct Bus<C: Cpu, P: Ppu> {
    cpu: C,
    board: Board<P>,
    config: EmulatorConfig,

    system_clock_counter: u64,
    audio_time: f64,
    audio_time_per_system_sample: f64,
    audio_time_per_nes_clock: f64,
    audio_sample: f32,
}

impl<C: Cpu, P: Ppu> Bus<C, P> {
    pub fn new(cpu: C, ppu: P) -> Self {
        Self::with_config(cpu, ppu, EmulatorConfig::default())
    }

    pub fn with_config(cpu: C, ppu: P, config: EmulatorConfig) -> Self {
        let mut apu = Apu::with_waveform_capacity(config.waveform_capacity);
        for (channel, enabled) in config.channels.entries() {
            apu.set_channel_enabled(channel, enabled);
        }

        let mut bus = Self {
            cpu,
            board: Board::new(ppu, apu),
            config,
            system_clock_counter: 0,
            audio_time: 0.0,
            audio_time_per_system_sample: 0.0,
            audio_time_per_nes_clock: 0.0,
            audio_sample: 0.0,
        };
        bus.set_sample_frequency(bus.config.sample_rate);
        bus
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn set_sample_frequency(&mut self, sample_rate: u32) {
        self.config.sample_rate = sample_rate.max(1);
        self.audio_time_per_system_sample = 1.0 / self.config.sample_rate as f64;
        self.audio_time_per_nes_clock = 1.0 / SYSTEM_CLOCK_HZ;
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path, self.config.save_dir.as_deref())?;
        self.insert_cartridge(cart);
        self.reset();
        Ok(())
    }

    pub fn insert_cartridge(&mut self, mut cart: Cartridge) {
        cart.set_mmc1_serial_gate(self.config.mmc1_serial_gate);
        self.board.ppu.connect_cartridge(&cart);
        let label = format!(
            "ROM inserted: {} (mapper {})",
            cart.mapper_name(),
            cart.mapper_id()
        );
        self.board.cart = Some(cart);
        self.board.push_debug_event(label);
    }

    pub fn has_rom(&self) -> bool {
        self.board.cart.is_some()
    }

    pub fn cartridge(&self) -> Option<&Cartridge> {
        self.board.cart.as_ref()
    }

    pub fn cartridge_mut(&mut self) -> Option<&mut Cartridge> {
        self.board.cart.as_mut()
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    pub fn ppu(&self) -> &P {
        &self.board.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut P {
        &mut self.board.ppu
    }

    pub fn apu(&self) -> &Apu {
        &self.board.apu
    }

    pub fn apu_mut(&mut self) -> &mut Apu {
        &mut self.board.apu
    }

    /// Live button state for `port` 0 or 1, latched on the next strobe.
    pub fn set_controller(&mut self, port: usize, buttons: u8) {
        if let Some(slot) = self.board.controller.get_mut(port) {
            *slot = buttons;
        }
    }

    pub fn cpu_read(&mut self, addr: u16, read_only: bool) -> u8 {
        self.board.read(addr, read_only)
    }

    pub fn cpu_write(&mut self, addr: u16, data: u8) {
        self.board.write(addr, data);
    }

    pub fn system_clock_counter(&self) -> u64 {
        self.system_clock_counter
    }

    pub fn audio_sample(&self) -> f32 {
        self.audio_sample
    }

    pub fn reset(&mut self) {
        if let Some(cart) = self.board.cart.as_mut() {
            cart.reset();
        }
        self.cpu.reset(&mut self.board);
        self.board.apu.reset();
        self.board.ppu.reset();
        self.board.dma = OamDma::default();
        self.board.dmc_stall = 0;
        self.system_clock_counter = 0;
        self.audio_time = 0.0;
        tracing::info!("system reset");
        self.board.push_debug_event("System reset");
    }

    /// One PPU-rate tick. Returns true when a new audio sample is ready.
    pub fn clock(&mut self) -> bool {
        let board = &mut self.board;
        if let Some(cart) = board.cart.as_mut() {
            board.ppu.clock(cart);
        }
        board.apu.clock();

        if self.system_clock_counter % 3 == 0 {
            if board.dma.transfer {
                board.step_oam_dma(self.system_clock_counter);
            } else if !board.service_dmc() {
                board.cpu_step = self.cpu.instruction_count();
                self.cpu.clock(board);
            }
        }

        let mut sample_ready = false;
        self.audio_time += self.audio_time_per_nes_clock;
        if self.audio_time >= self.audio_time_per_system_sample {
            self.audio_time -= self.audio_time_per_system_sample;
            self.audio_sample = board.apu.output_sample();
            sample_ready = true;
        }

        if board.ppu.take_nmi() {
            self.cpu.nmi(board);
        }

        if let Some(cart) = board.cart.as_mut()
            && cart.irq_state()
        {
            cart.irq_clear();
            self.cpu.irq(board);
        }

        if board.apu.irq_pending() {
            self.cpu.irq(board);
        }

        self.system_clock_counter = self.system_clock_counter.wrapping_add(1);
        sample_ready
    }

    pub fn next_sample(&mut self) -> f32 {
        while !self.clock() {}
        self.audio_sample
    }

    /// Clocks until the PPU finishes a frame. Returns false without a ROM or
    /// when the tick guard trips first.
    pub fn run_frame(&mut self) -> bool {
        if self.board.cart.is_none() {
            return false;
        }

        self.board.ppu.clear_frame_complete();
        let guard = self.config.frame_guard_ticks;
        let mut ticks: u64 = 0;
        while !self.board.ppu.frame_complete() {
            self.clock();
            ticks += 1;
            if ticks >= guard {
                tracing::warn!("frame guard tripped after {guard} system ticks");
                self.board
                    .push_debug_event(format!("Frame guard tripped at {guard} system ticks"));
                return false;
            }
        }
        true
    }

    pub fn recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.board
            .debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn debug_mapper_state(&self) -> String {
        self.board
            .cart
            .as_ref()
            .map_or_else(|| "No ROM loaded".to_string(), Cartridge::debug_mapper_state)
    }
}
