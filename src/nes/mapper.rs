use anyhow::{Result, bail};

use super::cartridge::CartridgeError;

pub const STATIC_RAM_SIZE: usize = 32 * 1024;

const PRG_BANK_16K: usize = 0x4000;
const PRG_BANK_8K: usize = 0x2000;
const CHR_BANK_8K: usize = 0x2000;
const CHR_BANK_4K: usize = 0x1000;
const CHR_BANK_1K: usize = 0x0400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirror {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
    FourScreen,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuRead {
    Prg(usize),
    Ram(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuWrite {
    Prg(usize),
    Ram,
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        9 => "MMC2",
        _ => "Unsupported",
    }
}

/// Closed set of supported boards. `prg_banks` counts 16 KiB units and
/// `chr_banks` counts 8 KiB units, zero meaning the board carries CHR RAM.
#[derive(Debug, Clone)]
pub enum Mapper {
    Nrom(Nrom),
    Mmc1(Mmc1),
    Uxrom(Uxrom),
    Cnrom(Cnrom),
    Mmc3(Mmc3),
    Mmc2(Mmc2),
}

impl Mapper {
    pub fn new(mapper_id: u8, prg_banks: usize, chr_banks: usize) -> Result<Self> {
        let prg_banks = prg_banks.max(1);
        let mapper = match mapper_id {
            0 => Self::Nrom(Nrom::new(prg_banks, chr_banks)),
            1 => Self::Mmc1(Mmc1::new(prg_banks, chr_banks)),
            2 => Self::Uxrom(Uxrom::new(prg_banks, chr_banks)),
            3 => Self::Cnrom(Cnrom::new(prg_banks, chr_banks)),
            4 => Self::Mmc3(Mmc3::new(prg_banks, chr_banks)),
            9 => Self::Mmc2(Mmc2::new(prg_banks, chr_banks)),
            id => bail!(CartridgeError::UnsupportedMapper(id)),
        };
        Ok(mapper)
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::Nrom(_) => 0,
            Self::Mmc1(_) => 1,
            Self::Uxrom(_) => 2,
            Self::Cnrom(_) => 3,
            Self::Mmc3(_) => 4,
            Self::Mmc2(_) => 9,
        }
    }

    pub fn name(&self) -> &'static str {
        mapper_name(self.id())
    }

    pub fn cpu_map_read(&mut self, addr: u16) -> Option<CpuRead> {
        match self {
            Self::Nrom(m) => m.cpu_map_read(addr),
            Self::Mmc1(m) => m.cpu_map_read(addr),
            Self::Uxrom(m) => m.cpu_map_read(addr),
            Self::Cnrom(m) => m.cpu_map_read(addr),
            Self::Mmc3(m) => m.cpu_map_read(addr),
            Self::Mmc2(m) => m.cpu_map_read(addr),
        }
    }

    /// `cpu_step` is the CPU's executed-instruction count at the time of the
    /// write; only the MMC1 serial port looks at it.
    pub fn cpu_map_write(&mut self, addr: u16, data: u8, cpu_step: u64) -> Option<CpuWrite> {
        match self {
            Self::Nrom(m) => m.cpu_map_write(addr),
            Self::Mmc1(m) => m.cpu_map_write(addr, data, cpu_step),
            Self::Uxrom(m) => m.cpu_map_write(addr, data),
            Self::Cnrom(m) => m.cpu_map_write(addr, data),
            Self::Mmc3(m) => m.cpu_map_write(addr, data),
            Self::Mmc2(m) => m.cpu_map_write(addr, data),
        }
    }

    pub fn ppu_map_read(&mut self, addr: u16) -> Option<usize> {
        if addr > 0x1FFF {
            return None;
        }
        match self {
            Self::Nrom(m) => Some(m.chr_offset(addr)),
            Self::Mmc1(m) => Some(m.chr_offset(addr)),
            Self::Uxrom(_) => Some(addr as usize),
            Self::Cnrom(m) => Some(m.chr_offset(addr)),
            Self::Mmc3(m) => Some(m.chr_offset(addr)),
            Self::Mmc2(m) => Some(m.ppu_map_read(addr)),
        }
    }

    pub fn ppu_map_write(&mut self, addr: u16) -> Option<usize> {
        if addr > 0x1FFF || self.chr_banks() != 0 {
            return None;
        }
        match self {
            Self::Mmc3(m) => Some(m.chr_offset(addr)),
            Self::Mmc1(m) => Some(m.chr_offset(addr)),
            _ => Some(addr as usize),
        }
    }

    pub fn mirror(&self) -> Mirror {
        match self {
            Self::Mmc1(m) => m.mirror,
            Self::Mmc3(m) => m.mirror,
            Self::Mmc2(m) => m.mirror,
            Self::Nrom(_) | Self::Uxrom(_) | Self::Cnrom(_) => Mirror::Hardware,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Nrom(_) => {}
            Self::Mmc1(m) => m.reset(),
            Self::Uxrom(m) => m.reset(),
            Self::Cnrom(m) => m.chr_bank = 0,
            Self::Mmc3(m) => m.reset(),
            Self::Mmc2(m) => m.reset(),
        }
    }

    pub fn irq_state(&self) -> bool {
        match self {
            Self::Mmc3(m) => m.irq_active,
            _ => false,
        }
    }

    pub fn irq_clear(&mut self) {
        if let Self::Mmc3(m) = self {
            m.irq_active = false;
        }
    }

    pub fn scanline(&mut self) {
        if let Self::Mmc3(m) = self {
            m.scanline();
        }
    }

    pub fn static_ram(&self) -> Option<&[u8]> {
        match self {
            Self::Mmc1(m) => Some(&m.ram),
            Self::Mmc3(m) => Some(&m.ram),
            Self::Mmc2(m) => Some(&m.ram),
            _ => None,
        }
    }

    /// Restores a persisted RAM image. Short images fill from the start.
    pub fn load_static_ram(&mut self, image: &[u8]) -> bool {
        let ram = match self {
            Self::Mmc1(m) => &mut m.ram,
            Self::Mmc3(m) => &mut m.ram,
            Self::Mmc2(m) => &mut m.ram,
            _ => return false,
        };
        let len = image.len().min(ram.len());
        ram[..len].copy_from_slice(&image[..len]);
        true
    }

    pub fn set_serial_gate(&mut self, enabled: bool) {
        if let Self::Mmc1(m) = self {
            m.serial_gate = enabled;
        }
    }

    fn chr_banks(&self) -> usize {
        match self {
            Self::Nrom(m) => m.chr_banks,
            Self::Mmc1(m) => m.chr_banks,
            Self::Uxrom(m) => m.chr_banks,
            Self::Cnrom(m) => m.chr_banks,
            Self::Mmc3(m) => m.chr_banks,
            Self::Mmc2(m) => m.chr_banks,
        }
    }

    pub fn debug_state(&self) -> String {
        match self {
            Self::Nrom(m) => format!("NROM prg_banks={}", m.prg_banks),
            Self::Mmc1(m) => format!(
                "MMC1 control=${:02X} load=${:02X}/{} chr=[{:02X},{:02X}] prg=${:02X}",
                m.control, m.load, m.load_count, m.chr0, m.chr1, m.prg
            ),
            Self::Uxrom(m) => format!("UxROM lo={} hi={}", m.lo, m.hi),
            Self::Cnrom(m) => format!("CNROM chr={}", m.chr_bank),
            Self::Mmc3(m) => format!(
                "MMC3 target={} regs={:02X?} irq reload={} counter={} en={} active={}",
                m.target,
                m.regs,
                m.irq_reload,
                m.irq_counter,
                m.irq_enable,
                m.irq_active
            ),
            Self::Mmc2(m) => format!(
                "MMC2 prg={} fd=[{:02X},{:02X}] fe=[{:02X},{:02X}] latch=[{},{}]",
                m.prg_bank,
                m.chr_fd[0],
                m.chr_fd[1],
                m.chr_fe[0],
                m.chr_fe[1],
                m.latch[0],
                m.latch[1]
            ),
        }
    }
}

fn static_ram() -> Vec<u8> {
    vec![0; STATIC_RAM_SIZE]
}

#[derive(Debug, Clone)]
pub struct Nrom {
    prg_banks: usize,
    chr_banks: usize,
}

impl Nrom {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
        }
    }

    fn prg_mask(&self) -> u16 {
        if self.prg_banks > 1 { 0x7FFF } else { 0x3FFF }
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        match addr {
            0x8000..=0xFFFF => Some(CpuRead::Prg((addr & self.prg_mask()) as usize)),
            _ => None,
        }
    }

    fn cpu_map_write(&self, addr: u16) -> Option<CpuWrite> {
        match addr {
            0x8000..=0xFFFF => Some(CpuWrite::Prg((addr & self.prg_mask()) as usize)),
            _ => None,
        }
    }

    fn chr_offset(&self, addr: u16) -> usize {
        addr as usize
    }
}

#[derive(Debug, Clone)]
pub struct Mmc1 {
    prg_banks: usize,
    chr_banks: usize,
    ram: Vec<u8>,

    load: u8,
    load_count: u8,
    control: u8,
    chr0: u8,
    chr1: u8,
    prg: u8,

    chr_lo: usize,
    chr_hi: usize,
    chr_8k: usize,
    prg_lo: usize,
    prg_hi: usize,
    prg_32k: usize,

    mirror: Mirror,
    serial_gate: bool,
    last_step: u64,
}

impl Mmc1 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        let mut mapper = Self {
            prg_banks,
            chr_banks,
            ram: static_ram(),
            load: 0,
            load_count: 0,
            control: 0x1C,
            chr0: 0,
            chr1: 0,
            prg: 0,
            chr_lo: 0,
            chr_hi: 0,
            chr_8k: 0,
            prg_lo: 0,
            prg_hi: 0,
            prg_32k: 0,
            mirror: Mirror::Horizontal,
            serial_gate: false,
            last_step: 0,
        };
        mapper.reset();
        mapper
    }

    fn reset(&mut self) {
        self.load = 0;
        self.load_count = 0;
        self.control = 0x1C;
        self.chr0 = 0;
        self.chr1 = 0;
        self.prg = 0;
        self.mirror = Mirror::Horizontal;
        self.last_step = 0;
        self.update_banks();
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        match addr {
            0x6000..=0x7FFF => Some(CpuRead::Ram(self.ram[(addr & 0x1FFF) as usize])),
            0x8000..=0xFFFF => {
                let offset = (addr & 0x3FFF) as usize;
                let mapped = if self.control & 0x08 == 0 {
                    let count = (self.prg_banks / 2).max(1);
                    (self.prg_32k % count) * 0x8000 + (addr & 0x7FFF) as usize
                } else if addr < 0xC000 {
                    (self.prg_lo % self.prg_banks) * PRG_BANK_16K + offset
                } else {
                    (self.prg_hi % self.prg_banks) * PRG_BANK_16K + offset
                };
                Some(CpuRead::Prg(mapped))
            }
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8, cpu_step: u64) -> Option<CpuWrite> {
        match addr {
            0x6000..=0x7FFF => {
                self.ram[(addr & 0x1FFF) as usize] = data;
                Some(CpuWrite::Ram)
            }
            0x8000..=0xFFFF => {
                self.serial_write(addr, data, cpu_step);
                None
            }
            _ => None,
        }
    }

    fn serial_write(&mut self, addr: u16, data: u8, cpu_step: u64) {
        if data & 0x80 != 0 {
            self.load = 0;
            self.load_count = 0;
            self.control |= 0x0C;
            self.update_banks();
            return;
        }

        if self.serial_gate {
            // Writes exactly one instruction after the last accepted one are
            // dropped.
            if cpu_step == self.last_step.wrapping_add(1) {
                return;
            }
            self.last_step = cpu_step;
        }

        self.load >>= 1;
        self.load |= (data & 0x01) << 4;
        self.load_count += 1;
        if self.load_count < 5 {
            return;
        }

        let value = self.load & 0x1F;
        match addr {
            0x8000..=0x9FFF => {
                self.control = value;
                self.mirror = match value & 0x03 {
                    0 => Mirror::OneScreenLower,
                    1 => Mirror::OneScreenUpper,
                    2 => Mirror::Vertical,
                    _ => Mirror::Horizontal,
                };
            }
            0xA000..=0xBFFF => self.chr0 = value,
            0xC000..=0xDFFF => self.chr1 = value,
            _ => self.prg = value & 0x0F,
        }
        self.load = 0;
        self.load_count = 0;
        self.update_banks();
        tracing::debug!("MMC1 commit ${addr:04X} <- ${value:02X}");
    }

    fn update_banks(&mut self) {
        if self.control & 0x10 != 0 {
            self.chr_lo = (self.chr0 & 0x1F) as usize;
            self.chr_hi = (self.chr1 & 0x1F) as usize;
        } else {
            self.chr_8k = ((self.chr0 & 0x1E) >> 1) as usize;
        }

        // 512K boards use CHR bank 0 bit 4 to pick the 256K half.
        let outer = if self.prg_banks > 16 {
            (self.chr0 & 0x10) as usize
        } else {
            0
        };
        let last = if self.prg_banks > 16 {
            outer | 0x0F
        } else {
            self.prg_banks - 1
        };

        match (self.control >> 2) & 0x03 {
            0 | 1 => self.prg_32k = (outer >> 1) | ((self.prg & 0x0E) >> 1) as usize,
            2 => {
                self.prg_lo = outer;
                self.prg_hi = outer | (self.prg & 0x0F) as usize;
            }
            _ => {
                self.prg_lo = outer | (self.prg & 0x0F) as usize;
                self.prg_hi = last;
            }
        }
    }

    fn chr_offset(&self, addr: u16) -> usize {
        if self.chr_banks == 0 {
            return addr as usize;
        }
        if self.control & 0x10 != 0 {
            let count = self.chr_banks * 2;
            let bank = if addr < 0x1000 { self.chr_lo } else { self.chr_hi };
            (bank % count) * CHR_BANK_4K + (addr & 0x0FFF) as usize
        } else {
            (self.chr_8k % self.chr_banks) * CHR_BANK_8K + (addr & 0x1FFF) as usize
        }
    }
}

#[derive(Debug, Clone)]
pub struct Uxrom {
    prg_banks: usize,
    chr_banks: usize,
    lo: usize,
    hi: usize,
}

impl Uxrom {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            lo: 0,
            hi: prg_banks - 1,
        }
    }

    fn reset(&mut self) {
        self.lo = 0;
        self.hi = self.prg_banks - 1;
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        let offset = (addr & 0x3FFF) as usize;
        match addr {
            0x8000..=0xBFFF => Some(CpuRead::Prg(self.lo * PRG_BANK_16K + offset)),
            0xC000..=0xFFFF => Some(CpuRead::Prg(self.hi * PRG_BANK_16K + offset)),
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuWrite> {
        if addr >= 0x8000 {
            self.lo = (data & 0x0F) as usize % self.prg_banks;
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct Cnrom {
    prg_banks: usize,
    chr_banks: usize,
    chr_bank: usize,
}

impl Cnrom {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        Self {
            prg_banks,
            chr_banks,
            chr_bank: 0,
        }
    }

    fn prg_mask(&self) -> u16 {
        if self.prg_banks > 1 { 0x7FFF } else { 0x3FFF }
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        match addr {
            0x8000..=0xFFFF => Some(CpuRead::Prg((addr & self.prg_mask()) as usize)),
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuWrite> {
        if addr >= 0x8000 {
            self.chr_bank = (data & 0x03) as usize % self.chr_banks.max(1);
        }
        None
    }

    fn chr_offset(&self, addr: u16) -> usize {
        self.chr_bank * CHR_BANK_8K + (addr & 0x1FFF) as usize
    }
}

#[derive(Debug, Clone)]
pub struct Mmc3 {
    prg_banks: usize,
    chr_banks: usize,
    ram: Vec<u8>,

    target: u8,
    prg_mode: bool,
    chr_inversion: bool,
    regs: [u8; 8],
    chr_offsets: [usize; 8],
    prg_offsets: [usize; 4],
    mirror: Mirror,

    irq_active: bool,
    irq_enable: bool,
    irq_counter: u8,
    irq_reload: u8,
}

impl Mmc3 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        let mut mapper = Self {
            prg_banks,
            chr_banks,
            ram: static_ram(),
            target: 0,
            prg_mode: false,
            chr_inversion: false,
            regs: [0; 8],
            chr_offsets: [0; 8],
            prg_offsets: [0; 4],
            mirror: Mirror::Hardware,
            irq_active: false,
            irq_enable: false,
            irq_counter: 0,
            irq_reload: 0,
        };
        mapper.reset();
        mapper
    }

    fn prg_count_8k(&self) -> usize {
        self.prg_banks * 2
    }

    fn chr_count_1k(&self) -> usize {
        (self.chr_banks * 8).max(8)
    }

    fn reset(&mut self) {
        self.target = 0;
        self.prg_mode = false;
        self.chr_inversion = false;
        self.mirror = Mirror::Hardware;
        self.irq_active = false;
        self.irq_enable = false;
        self.irq_counter = 0;
        self.irq_reload = 0;
        self.regs = [0; 8];
        self.chr_offsets = [0; 8];

        let count = self.prg_count_8k();
        self.prg_offsets = [
            0,
            (1 % count) * PRG_BANK_8K,
            (count - 2) * PRG_BANK_8K,
            (count - 1) * PRG_BANK_8K,
        ];
    }

    fn update_banks(&mut self) {
        let chr_count = self.chr_count_1k();
        let r = self.regs.map(|v| v as usize);
        let layout = if self.chr_inversion {
            [r[2], r[3], r[4], r[5], r[0] & 0xFE, r[0] | 1, r[1] & 0xFE, r[1] | 1]
        } else {
            [r[0] & 0xFE, r[0] | 1, r[1] & 0xFE, r[1] | 1, r[2], r[3], r[4], r[5]]
        };
        for (slot, bank) in self.chr_offsets.iter_mut().zip(layout) {
            *slot = (bank % chr_count) * CHR_BANK_1K;
        }

        let prg_count = self.prg_count_8k();
        let switchable = (r[6] & 0x3F) % prg_count;
        let second_last = prg_count - 2;
        let (first, third) = if self.prg_mode {
            (second_last, switchable)
        } else {
            (switchable, second_last)
        };
        self.prg_offsets = [
            first * PRG_BANK_8K,
            ((r[7] & 0x3F) % prg_count) * PRG_BANK_8K,
            third * PRG_BANK_8K,
            (prg_count - 1) * PRG_BANK_8K,
        ];
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        match addr {
            0x6000..=0x7FFF => Some(CpuRead::Ram(self.ram[(addr & 0x1FFF) as usize])),
            0x8000..=0xFFFF => {
                let window = ((addr - 0x8000) / 0x2000) as usize;
                Some(CpuRead::Prg(self.prg_offsets[window] + (addr & 0x1FFF) as usize))
            }
            _ => None,
        }
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuWrite> {
        let even = addr & 0x0001 == 0;
        match addr {
            0x6000..=0x7FFF => {
                self.ram[(addr & 0x1FFF) as usize] = data;
                return Some(CpuWrite::Ram);
            }
            0x8000..=0x9FFF => {
                if even {
                    self.target = data & 0x07;
                    self.prg_mode = data & 0x40 != 0;
                    self.chr_inversion = data & 0x80 != 0;
                } else {
                    self.regs[self.target as usize] = data;
                }
                self.update_banks();
            }
            0xA000..=0xBFFF => {
                if even {
                    self.mirror = if data & 0x01 != 0 {
                        Mirror::Horizontal
                    } else {
                        Mirror::Vertical
                    };
                } else {
                    tracing::trace!(data, "MMC3 PRG RAM protect write ignored");
                }
            }
            0xC000..=0xDFFF => {
                if even {
                    self.irq_reload = data;
                } else {
                    self.irq_counter = 0;
                }
            }
            0xE000..=0xFFFF => {
                if even {
                    self.irq_enable = false;
                    self.irq_active = false;
                } else {
                    self.irq_enable = true;
                }
            }
            _ => {}
        }
        None
    }

    fn chr_offset(&self, addr: u16) -> usize {
        let slot = (addr as usize & 0x1FFF) / CHR_BANK_1K;
        self.chr_offsets[slot] + (addr & 0x03FF) as usize
    }

    fn scanline(&mut self) {
        if self.irq_counter == 0 {
            self.irq_counter = self.irq_reload;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enable {
            self.irq_active = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mmc2 {
    prg_banks: usize,
    chr_banks: usize,
    ram: Vec<u8>,
    prg_bank: usize,
    chr_fd: [usize; 2],
    chr_fe: [usize; 2],
    // true selects the $FE bank
    latch: [bool; 2],
    mirror: Mirror,
}

impl Mmc2 {
    fn new(prg_banks: usize, chr_banks: usize) -> Self {
        let mut mapper = Self {
            prg_banks,
            chr_banks,
            ram: static_ram(),
            prg_bank: 0,
            chr_fd: [0; 2],
            chr_fe: [0; 2],
            latch: [false; 2],
            mirror: Mirror::Horizontal,
        };
        mapper.reset();
        mapper
    }

    fn prg_count_8k(&self) -> usize {
        self.prg_banks * 2
    }

    fn reset(&mut self) {
        self.prg_bank = 0;
        self.latch = [false; 2];
    }

    fn cpu_map_read(&self, addr: u16) -> Option<CpuRead> {
        let count = self.prg_count_8k();
        let bank = match addr {
            0x6000..=0x7FFF => return Some(CpuRead::Ram(self.ram[(addr & 0x1FFF) as usize])),
            0x8000..=0x9FFF => self.prg_bank % count,
            0xA000..=0xBFFF => count.saturating_sub(3),
            0xC000..=0xDFFF => count.saturating_sub(2),
            0xE000..=0xFFFF => count - 1,
            _ => return None,
        };
        Some(CpuRead::Prg(bank * PRG_BANK_8K + (addr & 0x1FFF) as usize))
    }

    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<CpuWrite> {
        match addr {
            0x6000..=0x7FFF => {
                self.ram[(addr & 0x1FFF) as usize] = data;
                return Some(CpuWrite::Ram);
            }
            0xA000..=0xAFFF => self.prg_bank = (data & 0x0F) as usize,
            0xB000..=0xBFFF => self.chr_fd[0] = (data & 0x1F) as usize,
            0xC000..=0xCFFF => self.chr_fe[0] = (data & 0x1F) as usize,
            0xD000..=0xDFFF => self.chr_fd[1] = (data & 0x1F) as usize,
            0xE000..=0xEFFF => self.chr_fe[1] = (data & 0x1F) as usize,
            0xF000..=0xFFFF => {
                self.mirror = if data & 0x01 != 0 {
                    Mirror::Horizontal
                } else {
                    Mirror::Vertical
                };
            }
            _ => {}
        }
        None
    }

    // Serve from the current bank, then let the address flip the latch.
    fn ppu_map_read(&mut self, addr: u16) -> usize {
        let window = (addr >> 12) as usize & 0x01;
        let bank = if self.latch[window] {
            self.chr_fe[window]
        } else {
            self.chr_fd[window]
        };
        let count = (self.chr_banks * 2).max(2);
        let mapped = (bank % count) * CHR_BANK_4K + (addr & 0x0FFF) as usize;

        match addr & 0x0FF0 {
            0x0FD0 => self.latch[window] = false,
            0x0FE0 => self.latch[window] = true,
            _ => {}
        }
        mapped
    }
}
