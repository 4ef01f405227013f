use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha1::{Digest, Sha1};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use super::mapper::{CpuRead, CpuWrite, Mapper, Mirror};

pub const HEADER_SIZE: usize = 16;
pub const TRAINER_SIZE: usize = 512;
pub const SAVE_EXTENSION: &str = "sav";

const PRG_UNIT: usize = 16 * 1024;
const HALF_PRG_UNIT: usize = 8 * 1024;
const CHR_UNIT: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    InvalidRom(String),
    Truncated {
        section: &'static str,
        expected: usize,
        available: usize,
    },
    UnsupportedMapper(u8),
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRom(reason) => write!(f, "invalid ROM: {reason}"),
            Self::Truncated {
                section,
                expected,
                available,
            } => write!(
                f,
                "invalid ROM: {section} needs {expected} bytes but only {available} remain"
            ),
            Self::UnsupportedMapper(id) => write!(f, "unsupported mapper {id}"),
        }
    }
}

impl std::error::Error for CartridgeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomFormat {
    Ines,
    Nes2,
    HalfPrg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomHeader {
    pub tag: [u8; 4],
    pub prg_chunks: u8,
    pub chr_chunks: u8,
    pub mapper1: u8,
    pub mapper2: u8,
    pub prg_ram_size: u8,
    pub tv_system1: u8,
    pub tv_system2: u8,
    pub reserved: [u8; 5],
}

impl RomHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!(CartridgeError::Truncated {
                section: "header",
                expected: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!(CartridgeError::InvalidRom(
                "bad header tag, expected NES<EOF>".to_string()
            ));
        }

        let mut reserved = [0u8; 5];
        reserved.copy_from_slice(&bytes[11..16]);
        Ok(Self {
            tag: [bytes[0], bytes[1], bytes[2], bytes[3]],
            prg_chunks: bytes[4],
            chr_chunks: bytes[5],
            mapper1: bytes[6],
            mapper2: bytes[7],
            prg_ram_size: bytes[8],
            tv_system1: bytes[9],
            tv_system2: bytes[10],
            reserved,
        })
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }

    pub fn mapper_id(&self) -> u8 {
        (self.mapper2 & 0xF0) | (self.mapper1 >> 4)
    }

    pub fn has_battery(&self) -> bool {
        self.mapper1 & 0x02 != 0
    }

    pub fn has_trainer(&self) -> bool {
        self.mapper1 & 0x04 != 0
    }

    pub fn four_screen(&self) -> bool {
        self.mapper1 & 0x08 != 0
    }

    pub fn hardware_mirror(&self) -> Mirror {
        if self.four_screen() {
            Mirror::FourScreen
        } else if self.mapper1 & 0x01 != 0 {
            Mirror::Vertical
        } else {
            Mirror::Horizontal
        }
    }

    fn payload_offset(&self) -> usize {
        if self.has_trainer() {
            HEADER_SIZE + TRAINER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Picks the container flavour. Header bits 2-3 of byte 7 mark NES 2.0;
    /// otherwise a file too short for 16K PRG units but exactly sized for 8K
    /// units is an early half-PRG dump.
    pub fn format(&self, file_len: usize) -> RomFormat {
        if self.mapper2 & 0x0C == 0x08 {
            return RomFormat::Nes2;
        }
        let chr = self.chr_chunks as usize * CHR_UNIT;
        let ines_len = self.payload_offset() + self.prg_chunks as usize * PRG_UNIT + chr;
        let half_len = self.payload_offset() + self.prg_chunks as usize * HALF_PRG_UNIT + chr;
        if file_len < ines_len && file_len == half_len {
            RomFormat::HalfPrg
        } else {
            RomFormat::Ines
        }
    }
}

pub struct Cartridge {
    header: RomHeader,
    format: RomFormat,
    prg: Vec<u8>,
    chr: Vec<u8>,
    prg_banks: usize,
    chr_banks: usize,
    mapper: Mapper,
    save_path: Option<PathBuf>,
    save_warning: Option<String>,
}

impl Cartridge {
    /// Loads a ROM and, for battery boards, restores `<stem>.sav` from
    /// `save_dir` (defaulting to the ROM's own directory).
    pub fn from_file(path: &Path, save_dir: Option<&Path>) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        let mut cart = Self::from_bytes(&bytes)
            .with_context(|| format!("failed to load ROM: {}", path.display()))?;

        if cart.header.has_battery() {
            let mut file_name = path.file_stem().unwrap_or(path.as_os_str()).to_os_string();
            file_name.push(".");
            file_name.push(SAVE_EXTENSION);
            let dir = save_dir
                .map(Path::to_path_buf)
                .or_else(|| path.parent().map(Path::to_path_buf))
                .unwrap_or_default();
            cart.attach_save(dir.join(file_name));
        }

        tracing::info!(
            "loaded {} ({} mapper {}, {:?}, PRG {}x16K, CHR {}x8K)",
            path.display(),
            cart.mapper.name(),
            cart.mapper_id(),
            cart.format,
            cart.prg_banks,
            cart.chr_banks
        );
        Ok(cart)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = RomHeader::parse(bytes)?;
        let format = header.format(bytes.len());
        let mut cursor = header.payload_offset();
        if bytes.len() < cursor {
            bail!(CartridgeError::Truncated {
                section: "trainer",
                expected: TRAINER_SIZE,
                available: bytes.len().saturating_sub(HEADER_SIZE),
            });
        }

        let (prg_banks, prg_len, chr_banks) = match format {
            RomFormat::Ines => (
                header.prg_chunks as usize,
                header.prg_chunks as usize * PRG_UNIT,
                header.chr_chunks as usize,
            ),
            RomFormat::Nes2 => {
                let prg = (((header.prg_ram_size & 0x07) as usize) << 8)
                    | header.prg_chunks as usize;
                let chr = ((((header.prg_ram_size & 0x38) >> 3) as usize) << 8)
                    | header.chr_chunks as usize;
                (prg, prg * PRG_UNIT, chr)
            }
            RomFormat::HalfPrg => {
                let len = header.prg_chunks as usize * HALF_PRG_UNIT;
                (len.div_ceil(PRG_UNIT), len, header.chr_chunks as usize)
            }
        };
        if prg_banks == 0 {
            bail!(CartridgeError::InvalidRom("header declares no PRG ROM".to_string()));
        }

        let remaining = bytes.len() - cursor;
        if remaining < prg_len {
            bail!(CartridgeError::Truncated {
                section: "PRG ROM",
                expected: prg_len,
                available: remaining,
            });
        }
        let mut prg = bytes[cursor..cursor + prg_len].to_vec();
        prg.resize(prg_banks * PRG_UNIT, 0);
        cursor += prg_len;

        let chr = if chr_banks == 0 {
            vec![0; CHR_UNIT]
        } else {
            let expected = chr_banks * CHR_UNIT;
            let remaining = bytes.len() - cursor;
            if remaining < expected {
                bail!(CartridgeError::Truncated {
                    section: "CHR ROM",
                    expected,
                    available: remaining,
                });
            }
            let len = if format == RomFormat::Nes2 {
                (expected * 2).min(remaining)
            } else {
                expected
            };
            bytes[cursor..cursor + len].to_vec()
        };

        let mapper = Mapper::new(header.mapper_id(), prg_banks, chr_banks)?;
        Ok(Self {
            header,
            format,
            prg,
            chr,
            prg_banks,
            chr_banks,
            mapper,
            save_path: None,
            save_warning: None,
        })
    }

    fn attach_save(&mut self, save_path: PathBuf) {
        if self.mapper.static_ram().is_none() {
            tracing::debug!("{} has no static RAM to persist", self.mapper.name());
            return;
        }
        if save_path.exists() {
            match fs::read(&save_path) {
                Ok(image) => {
                    self.mapper.load_static_ram(&image);
                    tracing::info!("restored save RAM from {}", save_path.display());
                }
                Err(err) => {
                    self.disable_persistence(format!(
                        "failed to read save {}: {err}",
                        save_path.display()
                    ));
                    return;
                }
            }
        }
        self.save_path = Some(save_path);
    }

    fn persist_static_ram(&mut self) {
        let (Some(path), Some(ram)) = (self.save_path.as_ref(), self.mapper.static_ram()) else {
            return;
        };
        if let Err(err) = fs::write(path, ram) {
            let warning = format!("failed to write save {}: {err}", path.display());
            self.disable_persistence(warning);
        }
    }

    fn disable_persistence(&mut self, warning: String) {
        tracing::warn!("{warning}; continuing without battery persistence");
        self.save_path = None;
        self.save_warning = Some(warning);
    }

    pub fn header(&self) -> &RomHeader {
        &self.header
    }

    pub fn format(&self) -> RomFormat {
        self.format
    }

    pub fn mapper_id(&self) -> u8 {
        self.mapper.id()
    }

    pub fn mapper_name(&self) -> &'static str {
        self.mapper.name()
    }

    pub fn prg_banks(&self) -> usize {
        self.prg_banks
    }

    pub fn chr_banks(&self) -> usize {
        self.chr_banks
    }

    pub fn prg_rom(&self) -> &[u8] {
        &self.prg
    }

    pub fn chr_data(&self) -> &[u8] {
        &self.chr
    }

    pub fn prg_digest(&self) -> String {
        BASE64_STANDARD.encode(Sha1::digest(&self.prg))
    }

    pub fn chr_digest(&self) -> String {
        BASE64_STANDARD.encode(Sha1::digest(&self.chr))
    }

    pub fn has_battery(&self) -> bool {
        self.header.has_battery()
    }

    pub fn save_path(&self) -> Option<&Path> {
        self.save_path.as_deref()
    }

    pub fn save_warning(&self) -> Option<&str> {
        self.save_warning.as_deref()
    }

    pub fn set_mmc1_serial_gate(&mut self, enabled: bool) {
        self.mapper.set_serial_gate(enabled);
    }

    pub fn cpu_read(&mut self, addr: u16) -> Option<u8> {
        match self.mapper.cpu_map_read(addr)? {
            CpuRead::Ram(data) => Some(data),
            CpuRead::Prg(offset) => Some(self.prg[offset % self.prg.len()]),
        }
    }

    pub fn cpu_write(&mut self, addr: u16, data: u8, cpu_step: u64) -> bool {
        match self.mapper.cpu_map_write(addr, data, cpu_step) {
            Some(CpuWrite::Ram) => {
                if self.header.has_battery() {
                    self.persist_static_ram();
                }
                true
            }
            Some(CpuWrite::Prg(offset)) => {
                let len = self.prg.len();
                self.prg[offset % len] = data;
                true
            }
            None => false,
        }
    }

    pub fn ppu_read(&mut self, addr: u16) -> Option<u8> {
        let offset = self.mapper.ppu_map_read(addr)?;
        Some(self.chr[offset % self.chr.len()])
    }

    pub fn ppu_write(&mut self, addr: u16, data: u8) -> bool {
        let Some(offset) = self.mapper.ppu_map_write(addr) else {
            return false;
        };
        let len = self.chr.len();
        self.chr[offset % len] = data;
        true
    }

    /// Nametable layout. The header's four-screen bit only applies while the
    /// mapper defers to the board wiring.
    pub fn mirror(&self) -> Mirror {
        match self.mapper.mirror() {
            Mirror::Hardware => self.header.hardware_mirror(),
            mode => mode,
        }
    }

    pub fn reset(&mut self) {
        self.mapper.reset();
    }

    pub fn irq_state(&self) -> bool {
        self.mapper.irq_state()
    }

    pub fn irq_clear(&mut self) {
        self.mapper.irq_clear();
    }

    pub fn scanline(&mut self) {
        self.mapper.scanline();
    }

    pub fn debug_mapper_state(&self) -> String {
        self.mapper.debug_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::testing::{RomBuilder, temp_dir};

    #[test]
    fn parses_nrom_header() {
        let rom = RomBuilder::new(0).prg_chunks(2).chr_chunks(1).build();
        let cart = Cartridge::from_bytes(&rom).unwrap();

        assert_eq!(cart.mapper_id(), 0);
        assert_eq!(cart.prg_banks(), 2);
        assert_eq!(cart.prg_rom().len(), 32 * 1024);
        assert_eq!(cart.chr_banks(), 1);
        assert_eq!(cart.chr_data().len(), 8 * 1024);
        assert_eq!(cart.mirror(), Mirror::Horizontal);
        assert!(!cart.has_battery());
        assert_eq!(cart.format(), RomFormat::Ines);
        assert_eq!(cart.header().name(), "NES\u{1A}");
    }

    #[test]
    fn mapper_id_combines_both_nibbles() {
        let rom = RomBuilder::new(0x41).prg_chunks(1).chr_chunks(1).build();
        let err = Cartridge::from_bytes(&rom).err().unwrap();
        assert_eq!(
            err.downcast_ref::<CartridgeError>(),
            Some(&CartridgeError::UnsupportedMapper(0x41))
        );
    }

    #[test]
    fn rejects_bad_tag() {
        let mut rom = RomBuilder::new(0).build();
        rom[0] = b'X';
        let err = Cartridge::from_bytes(&rom).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CartridgeError>(),
            Some(CartridgeError::InvalidRom(_))
        ));
    }

    #[test]
    fn rejects_truncated_prg() {
        let mut rom = RomBuilder::new(0).prg_chunks(2).chr_chunks(0).build();
        rom.truncate(HEADER_SIZE + 20 * 1024);
        let err = Cartridge::from_bytes(&rom).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CartridgeError>(),
            Some(CartridgeError::Truncated {
                section: "PRG ROM",
                ..
            })
        ));
    }

    #[test]
    fn rejects_truncated_chr() {
        let mut rom = RomBuilder::new(0).prg_chunks(1).chr_chunks(2).build();
        rom.truncate(rom.len() - 1);
        let err = Cartridge::from_bytes(&rom).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CartridgeError>(),
            Some(CartridgeError::Truncated {
                section: "CHR ROM",
                ..
            })
        ));
    }

    #[test]
    fn missing_chr_becomes_writable_ram() {
        let rom = RomBuilder::new(2).prg_chunks(2).chr_chunks(0).build();
        let mut cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.chr_data().len(), 8 * 1024);
        assert!(cart.ppu_write(0x0123, 0x5A));
        assert_eq!(cart.ppu_read(0x0123), Some(0x5A));
    }

    #[test]
    fn trainer_is_skipped() {
        let rom = RomBuilder::new(0)
            .flags6(0x04)
            .prg_chunks(1)
            .chr_chunks(1)
            .build();
        let mut cart = Cartridge::from_bytes(&rom).unwrap();
        // RomBuilder fills PRG with 0x01, the trainer with 0xEE.
        assert_eq!(cart.cpu_read(0x8000), Some(0x01));
    }

    #[test]
    fn four_screen_bit_yields_to_mapper_mirroring() {
        let rom = RomBuilder::new(4)
            .flags6(0x08 | 0x01)
            .prg_chunks(2)
            .chr_chunks(1)
            .build();
        let mut cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.mirror(), Mirror::FourScreen);

        cart.cpu_write(0xA000, 0x01, 0);
        assert_eq!(cart.mirror(), Mirror::Horizontal);

        cart.reset();
        assert_eq!(cart.mirror(), Mirror::FourScreen);
    }

    #[test]
    fn four_screen_bit_on_fixed_wiring_board() {
        let rom = RomBuilder::new(0).flags6(0x08).prg_chunks(1).build();
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.mirror(), Mirror::FourScreen);
    }

    #[test]
    fn vertical_bit_reaches_hardware_mirror() {
        let rom = RomBuilder::new(2).flags6(0x01).prg_chunks(2).build();
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.mirror(), Mirror::Vertical);
    }

    #[test]
    fn nes2_reads_extended_bank_bits_and_doubled_chr() {
        let rom = RomBuilder::new(0)
            .flags7(0x08)
            .byte8(0x00)
            .prg_chunks(2)
            .chr_chunks(1)
            .extra_chr(8 * 1024)
            .build();
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.format(), RomFormat::Nes2);
        assert_eq!(cart.prg_banks(), 2);
        assert_eq!(cart.chr_data().len(), 16 * 1024);
    }

    #[test]
    fn half_prg_dump_is_padded() {
        let mut rom = RomBuilder::new(0).prg_chunks(0).chr_chunks(1).build();
        rom[4] = 1;
        rom.splice(HEADER_SIZE..HEADER_SIZE, std::iter::repeat_n(0x42u8, 8 * 1024));
        let mut cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.format(), RomFormat::HalfPrg);
        assert_eq!(cart.prg_banks(), 1);
        assert_eq!(cart.prg_rom().len(), 16 * 1024);
        assert_eq!(cart.cpu_read(0x8000), Some(0x42));
        assert_eq!(cart.cpu_read(0xA000), Some(0x00));
    }

    #[test]
    fn digests_distinguish_bank_contents() {
        let one = Cartridge::from_bytes(&RomBuilder::new(0).prg_chunks(1).build()).unwrap();
        let two = Cartridge::from_bytes(&RomBuilder::new(0).prg_chunks(2).build()).unwrap();
        assert_ne!(one.prg_digest(), two.prg_digest());
        assert_eq!(one.chr_digest(), two.chr_digest());
        // SHA-1 is 20 bytes, 28 characters in padded base64.
        assert_eq!(one.prg_digest().len(), 28);
    }

    #[test]
    fn battery_ram_round_trips_through_save_file() {
        let dir = temp_dir("battery_round_trip");
        let rom_path = dir.join("quest.nes");
        let rom = RomBuilder::new(1)
            .flags6(0x02)
            .prg_chunks(2)
            .chr_chunks(1)
            .build();
        fs::write(&rom_path, &rom).unwrap();

        let mut cart = Cartridge::from_file(&rom_path, None).unwrap();
        assert_eq!(cart.save_path(), Some(dir.join("quest.sav").as_path()));
        assert!(cart.cpu_write(0x6005, 0x77, 0));

        let saved = fs::read(dir.join("quest.sav")).unwrap();
        assert_eq!(saved.len(), 32 * 1024);
        assert_eq!(saved[5], 0x77);

        let mut reloaded = Cartridge::from_file(&rom_path, None).unwrap();
        assert_eq!(reloaded.cpu_read(0x6005), Some(0x77));
    }

    #[test]
    fn save_failure_is_a_warning_not_an_error() {
        let dir = temp_dir("battery_failure");
        let rom_path = dir.join("quest.nes");
        let rom = RomBuilder::new(1)
            .flags6(0x02)
            .prg_chunks(2)
            .chr_chunks(1)
            .build();
        fs::write(&rom_path, &rom).unwrap();

        let missing = dir.join("no_such_dir");
        let mut cart = Cartridge::from_file(&rom_path, Some(&missing)).unwrap();
        assert!(cart.cpu_write(0x6000, 0x11, 0));
        assert!(cart.save_warning().is_some());
        assert_eq!(cart.save_path(), None);
        assert_eq!(cart.cpu_read(0x6000), Some(0x11));
    }
}
