//! Emulator configuration, loadable from JSON.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::nes::apu::{Channel, DEFAULT_WAVEFORM_CAPACITY};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_FRAME_GUARD_TICKS: u64 = 1_000_000;

/// Per-channel user mutes, applied in the mixer before the DAC curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelEnables {
    pub pulse1: bool,
    pub pulse2: bool,
    pub triangle: bool,
    pub noise: bool,
    pub dmc: bool,
}

impl Default for ChannelEnables {
    fn default() -> Self {
        Self {
            pulse1: true,
            pulse2: true,
            triangle: true,
            noise: true,
            dmc: true,
        }
    }
}

impl ChannelEnables {
    pub fn entries(&self) -> [(Channel, bool); 5] {
        [
            (Channel::Pulse1, self.pulse1),
            (Channel::Pulse2, self.pulse2),
            (Channel::Triangle, self.triangle),
            (Channel::Noise, self.noise),
            (Channel::Dmc, self.dmc),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Output rate the Bus decimates to, in Hz.
    pub sample_rate: u32,
    pub channels: ChannelEnables,
    /// Samples kept per channel for waveform displays.
    pub waveform_capacity: usize,
    /// Where battery saves go. `None` keeps them next to the ROM.
    pub save_dir: Option<PathBuf>,
    /// Upper bound on system ticks spent in one `run_frame`.
    pub frame_guard_ticks: u64,
    /// Drop MMC1 serial writes on consecutive CPU instructions.
    pub mmc1_serial_gate: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: ChannelEnables::default(),
            waveform_capacity: DEFAULT_WAVEFORM_CAPACITY,
            save_dir: None,
            frame_guard_ticks: DEFAULT_FRAME_GUARD_TICKS,
            mmc1_serial_gate: false,
        }
    }
}

impl EmulatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid emulator config")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize emulator config")
    }
}
