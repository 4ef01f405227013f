use std::collections::VecDeque;
use std::f64::consts::{PI, TAU};

pub const CPU_CLOCK_HZ: f64 = 1_789_773.0;
pub const DEFAULT_WAVEFORM_CAPACITY: usize = 1024;

const HARMONICS: u32 = 20;
const TRIANGLE_REFERENCE_RATE: f64 = 44_100.0;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const DUTY_TABLE: [(u16, f64); 4] = [
    (0b0000_0001, 0.125),
    (0b0000_0011, 0.250),
    (0b0000_1111, 0.500),
    (0b1111_1100, 0.750),
];

const FC_QUARTER_1: u32 = 3_729;
const FC_HALF_1: u32 = 7_457;
const FC_QUARTER_3: u32 = 11_186;
const FC_HALF_2: u32 = 14_916;

pub fn approx_sin(t: f64) -> f64 {
    let mut j = t * 0.15915;
    j -= j.trunc();
    20.785 * j * (j - 0.5) * (j - 1.0)
}

fn pulse_wave(frequency: f64, duty_cycle: f64, amplitude: f64, t: f64) -> f64 {
    let p = duty_cycle * TAU;
    let mut a = 0.0;
    let mut b = 0.0;
    for n in 1..HARMONICS {
        let n = n as f64;
        let c = n * frequency * TAU * t;
        a += -approx_sin(c) / n;
        b += -approx_sin(c - p * n) / n;
    }
    (2.0 * amplitude / PI) * (a - b)
}

fn guard_sample(value: f64, previous: f64) -> f64 {
    if value.is_nan() || !(-1.0..=1.0).contains(&value) {
        previous
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Pulse1,
    Pulse2,
    Triangle,
    Noise,
    Dmc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Duty,
    Lfsr { tap: u8 },
}

impl Rotation {
    fn apply(self, s: u16) -> u16 {
        match self {
            Self::Duty => ((s & 0x0001) << 7) | ((s & 0x00FE) >> 1),
            Self::Lfsr { tap } => {
                let feedback = (s ^ (s >> tap)) & 0x0001;
                ((s >> 1) & 0x3FFF) | (feedback << 14)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sequencer {
    pub sequence: u16,
    pub timer: u16,
    pub reload: u16,
    pub output: u8,
}

impl Sequencer {
    pub fn clock(&mut self, enable: bool, rotation: Rotation) -> u8 {
        if enable {
            self.timer = self.timer.wrapping_sub(1);
            if self.timer == 0xFFFF {
                self.timer = self.reload.wrapping_add(1);
                self.sequence = rotation.apply(self.sequence);
                self.output = (self.sequence & 0x0001) as u8;
            }
        }
        self.output
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Envelope {
    pub start: bool,
    pub disable: bool,
    pub volume: u8,
    pub divider_count: u8,
    pub decay_count: u8,
    pub output: u8,
}

impl Envelope {
    pub fn clock(&mut self, looping: bool) {
        if self.start {
            self.start = false;
            self.decay_count = 15;
            self.divider_count = self.volume;
        } else if self.divider_count == 0 {
            self.divider_count = self.volume;
            if self.decay_count == 0 {
                if looping {
                    self.decay_count = 15;
                }
            } else {
                self.decay_count -= 1;
            }
        } else {
            self.divider_count -= 1;
        }

        self.output = if self.disable {
            self.volume
        } else {
            self.decay_count
        };
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LengthCounter {
    pub counter: u8,
}

impl LengthCounter {
    pub fn clock(&mut self, enable: bool, halt: bool) -> u8 {
        if !enable {
            self.counter = 0;
        } else if self.counter > 0 && !halt {
            self.counter -= 1;
        }
        self.counter
    }

    fn load(&mut self, data: u8) {
        self.counter = LENGTH_TABLE[(data >> 3) as usize];
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sweep {
    pub enabled: bool,
    pub down: bool,
    pub reload: bool,
    pub shift: u8,
    pub timer: u8,
    pub period: u8,
    pub change: u16,
    pub mute: bool,
}

impl Sweep {
    fn target(&self, period: u16, ones_complement: bool) -> u16 {
        if self.down {
            let extra = u16::from(ones_complement);
            period.saturating_sub(self.change + extra)
        } else {
            period + self.change
        }
    }

    /// Recomputes the pending change and the mute flag for the channel's
    /// current period. Muting does not depend on `enabled`.
    pub fn track(&mut self, period: u16, ones_complement: bool) {
        self.change = period >> self.shift;
        self.mute = period < 8 || self.target(period, ones_complement) > 0x7FF;
    }

    pub fn clock(&mut self, period: u16, ones_complement: bool) -> Option<u16> {
        let mut updated = None;
        if self.timer == 0 && self.enabled && self.shift > 0 && !self.mute {
            updated = Some(self.target(period, ones_complement));
        }

        if self.timer == 0 || self.reload {
            self.timer = self.period;
            self.reload = false;
        } else {
            self.timer -= 1;
        }

        self.track(updated.unwrap_or(period), ones_complement);
        updated
    }
}

#[derive(Debug, Clone)]
pub struct Waveform {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl Waveform {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: f32) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn drain(&mut self) -> Vec<f32> {
        self.samples.drain(..).collect()
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
struct PulseChannel {
    enabled: bool,
    halt: bool,
    ones_complement: bool,
    duty_pattern: u16,
    duty_cycle: f64,
    seq: Sequencer,
    env: Envelope,
    length: LengthCounter,
    sweep: Sweep,
    output: f64,
    waveform: Waveform,
}

impl PulseChannel {
    fn new(ones_complement: bool, capacity: usize) -> Self {
        Self {
            enabled: false,
            halt: false,
            ones_complement,
            duty_pattern: DUTY_TABLE[0].0,
            duty_cycle: DUTY_TABLE[0].1,
            seq: Sequencer::default(),
            env: Envelope::default(),
            length: LengthCounter::default(),
            sweep: Sweep::default(),
            output: 0.0,
            waveform: Waveform::new(capacity),
        }
    }

    fn write_control(&mut self, data: u8) {
        let (pattern, cycle) = DUTY_TABLE[((data & 0xC0) >> 6) as usize];
        self.duty_pattern = pattern;
        self.duty_cycle = cycle;
        self.seq.sequence = pattern;
        self.halt = data & 0x20 != 0;
        self.env.disable = data & 0x10 != 0;
        self.env.volume = data & 0x0F;
    }

    fn write_sweep(&mut self, data: u8) {
        self.sweep.enabled = data & 0x80 != 0;
        self.sweep.period = (data & 0x70) >> 4;
        self.sweep.down = data & 0x08 != 0;
        self.sweep.shift = data & 0x07;
        self.sweep.reload = true;
    }

    fn write_timer_low(&mut self, data: u8) {
        self.seq.reload = (self.seq.reload & 0xFF00) | data as u16;
    }

    fn write_timer_high(&mut self, data: u8) {
        self.seq.reload = (((data & 0x07) as u16) << 8) | (self.seq.reload & 0x00FF);
        self.seq.timer = self.seq.reload;
        self.seq.sequence = self.duty_pattern;
        if self.enabled {
            self.length.load(data);
        }
        self.env.start = true;
    }

    fn clock_half_frame(&mut self) {
        self.length.clock(self.enabled, self.halt);
        if let Some(period) = self.sweep.clock(self.seq.reload, self.ones_complement) {
            self.seq.reload = period;
        }
    }

    fn clock(&mut self, t: f64) {
        self.seq.clock(self.enabled, Rotation::Duty);
        let frequency = CPU_CLOCK_HZ / (16.0 * (self.seq.reload as f64 + 1.0));
        let amplitude = (self.env.output as f64 - 1.0) / 16.0;

        let audible = self.enabled
            && self.length.counter > 0
            && self.seq.timer >= 8
            && !self.sweep.mute
            && self.env.output > 2;
        self.output = if audible {
            pulse_wave(frequency, self.duty_cycle, amplitude, t)
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone)]
struct TriangleChannel {
    enabled: bool,
    control_flag: bool,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload_flag: bool,
    reload: u16,
    length: LengthCounter,
    last_output: f64,
    output: f64,
    waveform: Waveform,
}

impl TriangleChannel {
    fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            control_flag: false,
            linear_reload_value: 0,
            linear_counter: 0,
            linear_reload_flag: false,
            reload: 0,
            length: LengthCounter::default(),
            last_output: 0.0,
            output: 0.0,
            waveform: Waveform::new(capacity),
        }
    }

    fn write_linear(&mut self, data: u8) {
        self.control_flag = data & 0x80 != 0;
        self.linear_reload_value = data & 0x7F;
    }

    fn write_timer_low(&mut self, data: u8) {
        self.reload = (self.reload & 0xFF00) | data as u16;
    }

    fn write_timer_high(&mut self, data: u8) {
        self.reload = (((data & 0x07) as u16) << 8) | (self.reload & 0x00FF);
        if self.enabled {
            self.length.load(data);
        }
        self.linear_reload_flag = true;
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload_flag {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }

        if !self.control_flag {
            self.linear_reload_flag = false;
        }
    }

    fn frequency(&self) -> f64 {
        CPU_CLOCK_HZ / (32.0 * (self.reload as f64 + 1.0))
    }

    fn clock(&mut self, t: f64) {
        let audible = self.enabled && self.linear_counter > 0 && self.length.counter >= 8;
        if !audible {
            self.output = 0.0;
            return;
        }

        let period = TRIANGLE_REFERENCE_RATE / self.frequency();
        let phase = (TAU / period) * (t * TRIANGLE_REFERENCE_RATE);
        let shaped = (2.0 / PI) * approx_sin(phase).asin();
        self.output = guard_sample(shaped, self.last_output);
        self.last_output = self.output;
    }
}

#[derive(Debug, Clone)]
struct NoiseChannel {
    enabled: bool,
    halt: bool,
    mode: bool,
    seq: Sequencer,
    env: Envelope,
    length: LengthCounter,
    output: f64,
    waveform: Waveform,
}

impl NoiseChannel {
    fn new(capacity: usize) -> Self {
        let mut noise = Self {
            enabled: false,
            halt: false,
            mode: false,
            seq: Sequencer {
                sequence: 1,
                ..Sequencer::default()
            },
            env: Envelope::default(),
            length: LengthCounter::default(),
            output: 0.0,
            waveform: Waveform::new(capacity),
        };
        noise.set_period(0);
        noise
    }

    fn write_control(&mut self, data: u8) {
        self.halt = data & 0x20 != 0;
        self.env.disable = data & 0x10 != 0;
        self.env.volume = data & 0x0F;
    }

    fn write_period(&mut self, data: u8) {
        self.mode = data & 0x80 != 0;
        self.set_period(data & 0x0F);
    }

    // Table is in CPU cycles. The sequencer runs at half rate.
    fn set_period(&mut self, index: u8) {
        let apu_ticks = NOISE_PERIOD_TABLE[index as usize] / 2;
        self.seq.reload = apu_ticks.saturating_sub(2);
    }

    fn write_length(&mut self, data: u8) {
        if self.enabled {
            self.length.load(data);
        }
        self.env.start = true;
    }

    fn clock(&mut self) {
        let tap = if self.mode { 6 } else { 1 };
        self.seq.clock(self.enabled, Rotation::Lfsr { tap });

        let audible = self.enabled && self.seq.sequence & 0x0001 != 0 && self.length.counter >= 8;
        self.output = if audible {
            (self.env.output as f64 - 1.0) / 16.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    loop_flag: bool,
    timer_period: u16,
    timer_counter: u16,
    output_level: u8,
    sample_addr: u16,
    sample_length: u16,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    waveform: Waveform,
}

impl DmcChannel {
    fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            loop_flag: false,
            timer_period: DMC_RATE_TABLE[0],
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0xC000,
            sample_length: 1,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
            waveform: Waveform::new(capacity),
        }
    }

    fn write_control(&mut self, data: u8) {
        self.irq_enabled = data & 0x80 != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.loop_flag = data & 0x40 != 0;
        self.timer_period = DMC_RATE_TABLE[(data & 0x0F) as usize];
    }

    fn write_enable(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.irq_flag = false;
        if !enabled {
            self.bytes_remaining = 0;
        } else if self.bytes_remaining == 0 {
            self.restart();
        }
    }

    fn restart(&mut self) {
        self.current_addr = self.sample_addr;
        self.bytes_remaining = self.sample_length;
    }

    fn wants_fetch(&self) -> bool {
        self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0
    }

    fn load_sample_byte(&mut self, byte: u8) {
        self.sample_buffer = Some(byte);
        self.current_addr = if self.current_addr == 0xFFFF {
            0x8000
        } else {
            self.current_addr + 1
        };
        self.bytes_remaining = self.bytes_remaining.saturating_sub(1);
        if self.bytes_remaining == 0 {
            if self.loop_flag {
                self.restart();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        self.timer_counter = self.timer_counter.saturating_sub(1);
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.clock_output_unit();
        }
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if self.shift_register & 0x01 != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }

        self.shift_register >>= 1;
        self.bits_remaining -= 1;
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(byte) => {
                    self.shift_register = byte;
                    self.silence = false;
                }
                None => self.silence = true,
            }
        }
    }

    fn output(&self) -> f64 {
        self.output_level as f64 / 127.0
    }
}

pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    pulse1_user_enable: bool,
    pulse2_user_enable: bool,
    triangle_user_enable: bool,
    noise_user_enable: bool,
    dmc_user_enable: bool,

    global_time: f64,
    clock_counter: u64,
    frame_clock_counter: u32,
    waveform_capacity: usize,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self::with_waveform_capacity(DEFAULT_WAVEFORM_CAPACITY)
    }

    pub fn with_waveform_capacity(capacity: usize) -> Self {
        Self {
            pulse1: PulseChannel::new(true, capacity),
            pulse2: PulseChannel::new(false, capacity),
            triangle: TriangleChannel::new(capacity),
            noise: NoiseChannel::new(capacity),
            dmc: DmcChannel::new(capacity),
            pulse1_user_enable: true,
            pulse2_user_enable: true,
            triangle_user_enable: true,
            noise_user_enable: true,
            dmc_user_enable: true,
            global_time: 0.0,
            clock_counter: 0,
            frame_clock_counter: 0,
            waveform_capacity: capacity,
        }
    }

    /// Power-on channel state. User mutes and waveform capacity survive.
    pub fn reset(&mut self) {
        let capacity = self.waveform_capacity;
        self.pulse1 = PulseChannel::new(true, capacity);
        self.pulse2 = PulseChannel::new(false, capacity);
        self.triangle = TriangleChannel::new(capacity);
        self.noise = NoiseChannel::new(capacity);
        self.dmc = DmcChannel::new(capacity);
        self.global_time = 0.0;
        self.clock_counter = 0;
        self.frame_clock_counter = 0;
    }

    pub fn set_channel_enabled(&mut self, channel: Channel, enabled: bool) {
        match channel {
            Channel::Pulse1 => self.pulse1_user_enable = enabled,
            Channel::Pulse2 => self.pulse2_user_enable = enabled,
            Channel::Triangle => self.triangle_user_enable = enabled,
            Channel::Noise => self.noise_user_enable = enabled,
            Channel::Dmc => self.dmc_user_enable = enabled,
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Pulse1 => self.pulse1_user_enable,
            Channel::Pulse2 => self.pulse2_user_enable,
            Channel::Triangle => self.triangle_user_enable,
            Channel::Noise => self.noise_user_enable,
            Channel::Dmc => self.dmc_user_enable,
        }
    }

    pub fn set_waveform_capacity(&mut self, capacity: usize) {
        self.waveform_capacity = capacity;
        for waveform in self.waveforms_mut() {
            waveform.set_capacity(capacity);
        }
    }

    pub fn drain_waveform(&mut self, channel: Channel) -> Vec<f32> {
        self.waveform_mut(channel).drain()
    }

    fn waveform_mut(&mut self, channel: Channel) -> &mut Waveform {
        match channel {
            Channel::Pulse1 => &mut self.pulse1.waveform,
            Channel::Pulse2 => &mut self.pulse2.waveform,
            Channel::Triangle => &mut self.triangle.waveform,
            Channel::Noise => &mut self.noise.waveform,
            Channel::Dmc => &mut self.dmc.waveform,
        }
    }

    fn waveforms_mut(&mut self) -> [&mut Waveform; 5] {
        [
            &mut self.pulse1.waveform,
            &mut self.pulse2.waveform,
            &mut self.triangle.waveform,
            &mut self.noise.waveform,
            &mut self.dmc.waveform,
        ]
    }

    pub fn cpu_write(&mut self, addr: u16, data: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(data),
            0x4001 => self.pulse1.write_sweep(data),
            0x4002 => self.pulse1.write_timer_low(data),
            0x4003 => self.pulse1.write_timer_high(data),

            0x4004 => self.pulse2.write_control(data),
            0x4005 => self.pulse2.write_sweep(data),
            0x4006 => self.pulse2.write_timer_low(data),
            0x4007 => self.pulse2.write_timer_high(data),

            0x4008 => self.triangle.write_linear(data),
            0x400A => self.triangle.write_timer_low(data),
            0x400B => self.triangle.write_timer_high(data),

            0x400C => self.noise.write_control(data),
            0x400E => self.noise.write_period(data),
            0x400F => self.noise.write_length(data),

            0x4010 => self.dmc.write_control(data),
            0x4011 => self.dmc.output_level = data & 0x7F,
            0x4012 => self.dmc.sample_addr = 0xC000 + data as u16 * 64,
            0x4013 => self.dmc.sample_length = data as u16 * 16 + 1,

            0x4015 => self.write_status(data),
            0x4017 => tracing::trace!("frame counter write ${data:02X} ignored, 4-step only"),
            _ => {}
        }
    }

    fn write_status(&mut self, data: u8) {
        self.pulse1.enabled = data & 0x01 != 0;
        self.pulse2.enabled = data & 0x02 != 0;
        self.triangle.enabled = data & 0x04 != 0;
        self.noise.enabled = data & 0x08 != 0;

        if !self.pulse1.enabled {
            self.pulse1.length.counter = 0;
        }
        if !self.pulse2.enabled {
            self.pulse2.length.counter = 0;
        }
        if !self.triangle.enabled {
            self.triangle.length.counter = 0;
        }
        if !self.noise.enabled {
            self.noise.length.counter = 0;
        }
        self.dmc.write_enable(data & 0x10 != 0);
    }

    /// `$4015` status: length counters in bits 0-3, DMC activity in bit 4,
    /// DMC IRQ in bit 7.
    pub fn read_status(&self) -> u8 {
        let mut status = 0u8;
        if self.pulse1.length.counter > 0 {
            status |= 0x01;
        }
        if self.pulse2.length.counter > 0 {
            status |= 0x02;
        }
        if self.triangle.length.counter > 0 {
            status |= 0x04;
        }
        if self.noise.length.counter > 0 {
            status |= 0x08;
        }
        if self.dmc.bytes_remaining > 0 {
            status |= 0x10;
        }
        if self.dmc.irq_flag {
            status |= 0x80;
        }
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.dmc.irq_flag
    }

    pub fn pending_dmc_fetch(&self) -> Option<u16> {
        self.dmc.wants_fetch().then_some(self.dmc.current_addr)
    }

    pub fn complete_dmc_fetch(&mut self, byte: u8) {
        self.dmc.load_sample_byte(byte);
    }

    pub fn clock(&mut self) {
        self.global_time += (1.0 / 3.0) / CPU_CLOCK_HZ;

        if self.clock_counter % 3 == 0 {
            self.dmc.clock_timer();
        }

        if self.clock_counter % 6 == 0 {
            let (quarter, half) = self.step_frame_sequencer();
            if quarter {
                self.pulse1.env.clock(self.pulse1.halt);
                self.pulse2.env.clock(self.pulse2.halt);
                self.triangle.clock_linear_counter();
                self.noise.env.clock(self.noise.halt);
            }
            if half {
                self.pulse1.clock_half_frame();
                self.pulse2.clock_half_frame();
                self.triangle
                    .length
                    .clock(self.triangle.enabled, self.triangle.control_flag);
                self.noise.length.clock(self.noise.enabled, self.noise.halt);
            }

            let t = self.global_time;
            self.pulse1.clock(t);
            self.pulse2.clock(t);
            self.triangle.clock(t);
            self.noise.clock();
        }

        self.pulse1
            .sweep
            .track(self.pulse1.seq.reload, self.pulse1.ones_complement);
        self.pulse2
            .sweep
            .track(self.pulse2.seq.reload, self.pulse2.ones_complement);

        self.clock_counter = self.clock_counter.wrapping_add(1);
    }

    fn step_frame_sequencer(&mut self) -> (bool, bool) {
        self.frame_clock_counter += 1;
        match self.frame_clock_counter {
            FC_QUARTER_1 | FC_QUARTER_3 => (true, false),
            FC_HALF_1 => (true, true),
            FC_HALF_2 => {
                self.frame_clock_counter = 0;
                (true, true)
            }
            _ => (false, false),
        }
    }

    pub fn output_sample(&mut self) -> f32 {
        let p1 = if self.pulse1_user_enable { self.pulse1.output } else { 0.0 };
        let p2 = if self.pulse2_user_enable { self.pulse2.output } else { 0.0 };
        let t = if self.triangle_user_enable { self.triangle.output } else { 0.0 };
        let n = if self.noise_user_enable { self.noise.output } else { 0.0 };
        let d = if self.dmc_user_enable { self.dmc.output() } else { 0.0 };

        self.pulse1.waveform.push(p1 as f32);
        self.pulse2.waveform.push(p2 as f32);
        self.triangle.waveform.push(t as f32);
        self.noise.waveform.push(n as f32);
        self.dmc.waveform.push(d as f32);

        let pulse_sum = p1 + p2;
        let pulse_out = if pulse_sum == 0.0 {
            0.0
        } else {
            95.88 / ((8128.0 / pulse_sum) + 100.0)
        };

        let tnd_in = (t / 8227.0) + (n / 12241.0) + (d / 22638.0);
        let tnd_out = if tnd_in == 0.0 {
            0.0
        } else {
            159.79 / ((1.0 / tnd_in) + 100.0)
        };

        ((pulse_out + tnd_out) * 10.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_system_ticks(apu: &mut Apu, ticks: usize) {
        for _ in 0..ticks {
            apu.clock();
        }
    }

    #[test]
    fn sequencer_rotates_once_per_reload_plus_two_clocks() {
        for reload in [0u16, 1, 7, 0x0F8, 0x7FF] {
            let mut seq = Sequencer {
                sequence: 0b0000_0001,
                timer: reload + 1,
                reload,
                output: 0,
            };
            for _ in 0..reload + 1 {
                seq.clock(true, Rotation::Duty);
            }
            assert_eq!(seq.sequence, 0b0000_0001, "reload {reload}");

            seq.clock(true, Rotation::Duty);
            assert_eq!(seq.sequence, 0b1000_0000, "reload {reload}");
            assert_eq!(seq.timer, reload + 1);
        }
    }

    #[test]
    fn disabled_sequencer_holds_still() {
        let mut seq = Sequencer {
            sequence: 0b0000_0011,
            timer: 0,
            reload: 4,
            output: 1,
        };
        for _ in 0..10 {
            assert_eq!(seq.clock(false, Rotation::Duty), 1);
        }
        assert_eq!(seq.timer, 0);
    }

    #[test]
    fn lfsr_rotation_feeds_bit_14() {
        assert_eq!(Rotation::Lfsr { tap: 1 }.apply(0x0001), 0x4000);
        assert_eq!(Rotation::Lfsr { tap: 1 }.apply(0x0003), 0x0001);
        assert_eq!(Rotation::Lfsr { tap: 6 }.apply(0x0041), 0x0020);
    }

    #[test]
    fn length_counter_halt_and_disable() {
        let mut lc = LengthCounter { counter: 20 };
        for _ in 0..50 {
            lc.clock(true, true);
        }
        assert_eq!(lc.counter, 20);

        lc.clock(true, false);
        assert_eq!(lc.counter, 19);

        assert_eq!(lc.clock(false, true), 0);
    }

    #[test]
    fn envelope_decay_steps_every_volume_plus_one_clocks() {
        let volume = 3u8;
        let mut env = Envelope {
            start: true,
            volume,
            ..Envelope::default()
        };
        env.clock(true);
        assert_eq!(env.decay_count, 15);

        let mut levels = Vec::new();
        for _ in 0..(volume as usize + 1) * 16 {
            env.clock(true);
            levels.push(env.decay_count);
        }
        for (level, chunk) in levels.chunks(volume as usize + 1).enumerate() {
            let expected = if level == 15 { 15 } else { 14 - level as u8 };
            assert!(chunk.iter().skip(volume as usize).all(|&d| d == expected));
        }
        assert!(levels.iter().all(|&d| d <= 15));
        assert_eq!(env.output, env.decay_count);
    }

    #[test]
    fn envelope_constant_volume_outputs_volume() {
        let mut env = Envelope {
            disable: true,
            volume: 9,
            ..Envelope::default()
        };
        env.clock(false);
        assert_eq!(env.output, 9);
    }

    #[test]
    fn sweep_mutes_out_of_range_targets_even_when_disabled() {
        let mut sweep = Sweep {
            shift: 1,
            ..Sweep::default()
        };
        sweep.track(7, false);
        assert!(sweep.mute);

        sweep.track(0x700, false);
        assert!(sweep.mute);

        sweep.track(0x100, false);
        assert!(!sweep.mute);
        assert_eq!(sweep.change, 0x80);
    }

    #[test]
    fn sweep_clock_returns_adjusted_period() {
        let mut sweep = Sweep {
            enabled: true,
            down: true,
            shift: 2,
            period: 0,
            ..Sweep::default()
        };
        sweep.track(0x100, true);
        // Pulse 1 negates with ones' complement.
        assert_eq!(sweep.clock(0x100, true), Some(0x100 - 0x40 - 1));

        let mut sweep = Sweep {
            enabled: true,
            shift: 2,
            ..Sweep::default()
        };
        sweep.track(0x100, false);
        assert_eq!(sweep.clock(0x100, false), Some(0x140));

        sweep.enabled = false;
        assert_eq!(sweep.clock(0x140, false), None);
    }

    #[test]
    fn frame_sequencer_fires_at_expected_ticks() {
        let mut apu = Apu::new();
        let mut quarters = Vec::new();
        let mut halves = Vec::new();
        for tick in 1..=14_916u32 {
            let (quarter, half) = apu.step_frame_sequencer();
            if quarter {
                quarters.push(tick);
            }
            if half {
                halves.push(tick);
            }
        }
        assert_eq!(quarters, vec![3_729, 7_457, 11_186, 14_916]);
        assert_eq!(halves, vec![7_457, 14_916]);
        assert_eq!(apu.frame_clock_counter, 0);
    }

    #[test]
    fn frame_sequencer_advances_every_sixth_system_tick() {
        let mut apu = Apu::new();
        clock_system_ticks(&mut apu, 60);
        assert_eq!(apu.frame_clock_counter, 10);
    }

    #[test]
    fn pulse1_end_to_end_produces_sound() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4015, 0x01);
        apu.cpu_write(0x4000, 0x00);
        apu.cpu_write(0x4001, 0x00);
        apu.cpu_write(0x4002, 0xF8);
        apu.cpu_write(0x4003, 0xF8);

        assert_eq!(apu.pulse1.duty_cycle, 0.125);
        assert_eq!(apu.pulse1.seq.reload, 0xF8);
        assert_eq!(apu.pulse1.length.counter, 30);

        // Envelope output only becomes valid on the first quarter frame.
        clock_system_ticks(&mut apu, FC_QUARTER_1 as usize * 6);
        assert_eq!(apu.pulse1.env.output, 15);

        let mut heard = false;
        for _ in 0..64 {
            clock_system_ticks(&mut apu, 6);
            if apu.pulse1.seq.timer >= 8 && apu.output_sample() != 0.0 {
                heard = true;
                break;
            }
        }
        assert!(heard);
    }

    #[test]
    fn silent_apu_mixes_to_zero() {
        let mut apu = Apu::new();
        clock_system_ticks(&mut apu, 1_000);
        assert_eq!(apu.output_sample(), 0.0);
    }

    fn noise_only(apu: &mut Apu) {
        for channel in [Channel::Pulse1, Channel::Pulse2, Channel::Triangle, Channel::Dmc] {
            apu.set_channel_enabled(channel, false);
        }
        apu.cpu_write(0x4015, 0x08);
        apu.cpu_write(0x400C, 0x1F);
        apu.cpu_write(0x400E, 0x00);
        apu.cpu_write(0x400F, 0xF8);
        assert_eq!(apu.noise.length.counter, 30);
        clock_system_ticks(apu, FC_QUARTER_1 as usize * 6);
        assert_eq!(apu.noise.env.output, 15);
    }

    #[test]
    fn noise_mixes_through_tnd_curve() {
        let mut apu = Apu::new();
        noise_only(&mut apu);

        let expected = (159.79 / (1.0 / ((14.0 / 16.0) / 12241.0) + 100.0) * 10.0) as f32;
        let mut heard = 0;
        for _ in 0..2_000 {
            clock_system_ticks(&mut apu, 6);
            let sample = apu.output_sample();
            if sample != 0.0 {
                assert!((sample - expected).abs() < 1e-6, "sample {sample}");
                heard += 1;
            }
        }
        assert!(heard > 0);
        assert_eq!(apu.noise.length.counter, 30);
    }

    #[test]
    fn noise_is_silent_below_length_eight() {
        let mut apu = Apu::new();
        noise_only(&mut apu);
        apu.noise.length.counter = 7;

        for _ in 0..2_000 {
            clock_system_ticks(&mut apu, 6);
            assert_eq!(apu.output_sample(), 0.0);
        }
        assert_eq!(apu.noise.length.counter, 7);
    }

    #[test]
    fn dmc_level_mixes_through_tnd_curve() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4011, 0x7F);
        assert_eq!(apu.dmc.output_level, 0x7F);

        let expected = (159.79 / (22_638.0 + 100.0) * 10.0) as f32;
        assert!((apu.output_sample() - expected).abs() < 1e-6);

        apu.set_channel_enabled(Channel::Dmc, false);
        assert_eq!(apu.output_sample(), 0.0);
    }

    #[test]
    fn user_mute_silences_channel_and_waveform_tap() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4015, 0x01);
        apu.cpu_write(0x4000, 0x1F);
        apu.cpu_write(0x4002, 0xF8);
        apu.cpu_write(0x4003, 0xF8);
        clock_system_ticks(&mut apu, FC_QUARTER_1 as usize * 6 + 60);

        apu.set_channel_enabled(Channel::Pulse1, false);
        assert_eq!(apu.output_sample(), 0.0);
        assert_eq!(apu.drain_waveform(Channel::Pulse1), vec![0.0]);
        assert!(apu.drain_waveform(Channel::Pulse1).is_empty());
    }

    #[test]
    fn waveform_tap_is_bounded() {
        let mut apu = Apu::with_waveform_capacity(4);
        for _ in 0..10 {
            apu.output_sample();
        }
        assert_eq!(apu.drain_waveform(Channel::Noise).len(), 4);
    }

    #[test]
    fn status_disable_clears_length_counters() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4015, 0x0F);
        apu.cpu_write(0x4003, 0x08);
        apu.cpu_write(0x4007, 0x08);
        apu.cpu_write(0x400B, 0x08);
        apu.cpu_write(0x400F, 0x08);
        assert_eq!(apu.read_status() & 0x0F, 0x0F);

        apu.cpu_write(0x4015, 0x05);
        assert_eq!(apu.read_status() & 0x0F, 0x05);
        apu.cpu_write(0x4015, 0x00);
        assert_eq!(apu.read_status(), 0x00);
    }

    #[test]
    fn length_load_ignored_while_channel_disabled() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4003, 0xF8);
        assert_eq!(apu.pulse1.length.counter, 0);
    }

    #[test]
    fn triangle_guard_keeps_previous_sample() {
        assert_eq!(guard_sample(f64::NAN, 0.25), 0.25);
        assert_eq!(guard_sample(1.5, -0.5), -0.5);
        assert_eq!(guard_sample(0.75, 0.0), 0.75);
    }

    #[test]
    fn approx_sin_tracks_sine_shape() {
        assert!(approx_sin(0.0).abs() < 1e-9);
        assert!(approx_sin(PI / 2.0) > 0.9);
        assert!(approx_sin(3.0 * PI / 2.0) < -0.9);
    }

    #[test]
    fn triangle_needs_linear_and_length_counters() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4015, 0x04);
        apu.cpu_write(0x4008, 0x7F);
        apu.cpu_write(0x400A, 0x40);
        apu.cpu_write(0x400B, 0xF8);
        assert_eq!(apu.triangle.length.counter, 30);
        assert_eq!(apu.triangle.linear_counter, 0);

        clock_system_ticks(&mut apu, FC_QUARTER_1 as usize * 6);
        assert_eq!(apu.triangle.linear_counter, 0x7F);

        let mut saw_signal = false;
        for _ in 0..200 {
            clock_system_ticks(&mut apu, 6);
            let out = apu.triangle.output;
            assert!((-1.0..=1.0).contains(&out));
            saw_signal |= out != 0.0;
        }
        assert!(saw_signal);
    }

    #[test]
    fn noise_period_maps_cpu_cycles_to_sequencer_reload() {
        let mut apu = Apu::new();
        apu.cpu_write(0x400E, 0x8F);
        assert!(apu.noise.mode);
        assert_eq!(apu.noise.seq.reload, 4068 / 2 - 2);
        apu.cpu_write(0x400E, 0x00);
        assert_eq!(apu.noise.seq.reload, 0);
    }

    #[test]
    fn dmc_fetches_plays_and_raises_irq() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4010, 0x8F);
        apu.cpu_write(0x4012, 0x00);
        apu.cpu_write(0x4013, 0x00);
        assert_eq!(apu.pending_dmc_fetch(), None);

        apu.cpu_write(0x4015, 0x10);
        assert_eq!(apu.read_status() & 0x10, 0x10);
        assert_eq!(apu.pending_dmc_fetch(), Some(0xC000));

        apu.complete_dmc_fetch(0xFF);
        assert_eq!(apu.pending_dmc_fetch(), None);
        assert!(apu.irq_pending());
        assert_eq!(apu.read_status() & 0x90, 0x80);

        // The first output clock still runs off the power-on period; the
        // loaded byte plays on clocks 9 through 16.
        clock_system_ticks(&mut apu, (428 + 20 * 54) * 3);
        assert_eq!(apu.dmc.output_level, 16);

        apu.cpu_write(0x4015, 0x00);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn dmc_loop_restarts_sample() {
        let mut apu = Apu::new();
        apu.cpu_write(0x4010, 0x40);
        apu.cpu_write(0x4012, 0x01);
        apu.cpu_write(0x4015, 0x10);
        assert_eq!(apu.pending_dmc_fetch(), Some(0xC040));
        apu.complete_dmc_fetch(0x00);
        assert_eq!(apu.dmc.bytes_remaining, 1);
        assert_eq!(apu.dmc.current_addr, 0xC040);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn reset_keeps_user_mutes() {
        let mut apu = Apu::new();
        apu.set_channel_enabled(Channel::Noise, false);
        apu.cpu_write(0x4015, 0x0F);
        apu.reset();
        assert!(!apu.channel_enabled(Channel::Noise));
        assert_eq!(apu.read_status(), 0);
    }
}
