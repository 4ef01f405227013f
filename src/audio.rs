use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::nes::{Bus, cpu::Cpu, ppu::Ppu};

/// Default output stream that pulls samples straight from the emulator.
/// The device callback holds the Bus lock for one buffer at a time, so the
/// emulator thread must take the same lock for any register poke.
pub struct AudioOutput {
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl AudioOutput {
    pub fn start<C, P>(bus: Arc<Mutex<Bus<C, P>>>) -> Result<Self>
    where
        C: Cpu + Send + 'static,
        P: Ppu + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        bus.lock()
            .map_err(|_| anyhow!("emulator bus lock poisoned"))?
            .set_sample_frequency(sample_rate);

        let err_fn = |err| {
            tracing::warn!("audio stream error: {err}");
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let bus = Arc::clone(&bus);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| fill_output(data, channels, &bus, |s| s),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let bus = Arc::clone(&bus);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| {
                        fill_output(data, channels, &bus, |s| (s * i16::MAX as f32) as i16)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let bus = Arc::clone(&bus);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_output(data, channels, &bus, |s| {
                            ((s * 0.5 + 0.5) * u16::MAX as f32) as u16
                        })
                    },
                    err_fn,
                    None,
                )?
            }
            other => {
                return Err(anyhow!("unsupported audio sample format: {other:?}"));
            }
        };

        stream
            .play()
            .context("failed to start audio output stream")?;
        tracing::info!(sample_rate, channels, "audio output started");

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// One emulator sample per output frame, copied into every channel. A
/// poisoned lock yields silence.
fn fill_output<T, C, P>(
    data: &mut [T],
    channels: usize,
    bus: &Arc<Mutex<Bus<C, P>>>,
    convert: impl Fn(f32) -> T,
) where
    T: Copy,
    C: Cpu,
    P: Ppu,
{
    let Ok(mut bus) = bus.lock() else {
        let silence = convert(0.0);
        data.iter_mut().for_each(|out| *out = silence);
        return;
    };

    for frame in data.chunks_mut(channels.max(1)) {
        let sample = convert(bus.next_sample().clamp(-1.0, 1.0));
        for out in frame {
            *out = sample;
        }
    }
}
