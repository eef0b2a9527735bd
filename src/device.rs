//! CPAL device discovery and output streams.
//!
//! An [`OutputDevice`] plays whatever the engine pushed into its output ring.
//! The device callback pulls from the [`SampleConsumer`] and pads any
//! shortfall with silence, so a late engine is heard as a dropout rather than
//! a stall.
//!
//! ```no_run
//! use trackcore::device::OutputDevice;
//! use trackcore::engine::Engine;
//! use trackcore::EngineConfig;
//!
//! let device = OutputDevice::default_output().unwrap();
//! let config = EngineConfig { sample_rate: device.sample_rate(), ..EngineConfig::default() };
//! let (mut engine, _handle, output) = Engine::new(config.clone()).unwrap();
//! let stream = device.play(output, &config).unwrap();
//!
//! loop {
//!     engine.fill();
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! #   break;
//! }
//! # drop(stream);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::error::DeviceError;
use crate::ring::SampleConsumer;

/// Samples converted per pass for integer formats.
const CONVERT_CHUNK: usize = 256;

/// A discovered audio output device.
pub struct OutputDevice {
    device: cpal::Device,
    sample_format: SampleFormat,
    name: String,
    sample_rate: u32,
    channels: u16,
}

impl OutputDevice {
    /// The system's default output device, if there is one.
    pub fn default_output() -> Option<Self> {
        let host = cpal::default_host();
        Self::from_device(host.default_output_device()?)
    }

    /// Every output device that reports a usable default config.
    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(Self::from_device).collect())
            .unwrap_or_default()
    }

    fn from_device(device: cpal::Device) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            sample_format: config.sample_format(),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            name,
            device,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Default channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Open a stream at the engine's rate and channel count and start
    /// pulling from `output`.
    ///
    /// The stream stops when the returned [`OutputStream`] is dropped.
    pub fn play(
        &self,
        output: SampleConsumer<f32>,
        config: &EngineConfig,
    ) -> Result<OutputStream, DeviceError> {
        let stream_config = StreamConfig {
            channels: config.channels as u16,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let stats = Arc::new(StreamStats::default());
        let stream =
            build_stream(&self.device, self.sample_format, &stream_config, output, stats.clone())?;
        stream.play()?;
        debug!(
            device = %self.name,
            sample_rate = config.sample_rate,
            channels = config.channels,
            "output stream started"
        );
        Ok(OutputStream { _stream: stream, stats })
    }
}

#[derive(Default)]
struct StreamStats {
    played: AtomicU64,
    underruns: AtomicU64,
}

/// A running device stream.
pub struct OutputStream {
    _stream: cpal::Stream,
    stats: Arc<StreamStats>,
}

impl OutputStream {
    /// Samples handed to the device so far, silence included.
    pub fn samples_played(&self) -> u64 {
        self.stats.played.load(Ordering::Relaxed)
    }

    /// Callbacks that found fewer samples queued than the device asked for.
    pub fn underruns(&self) -> u64 {
        self.stats.underruns.load(Ordering::Relaxed)
    }
}

/// Pull `out.len()` samples, padding with silence, and record the pass.
fn pull(output: &mut SampleConsumer<f32>, out: &mut [f32], stats: &StreamStats) {
    let read = output.read_or_silence(out);
    if read < out.len() {
        stats.underruns.fetch_add(1, Ordering::Relaxed);
    }
    stats.played.fetch_add(out.len() as u64, Ordering::Relaxed);
}

/// Pull into a stack buffer and convert each sample to the device format.
fn pull_converted<S>(
    output: &mut SampleConsumer<f32>,
    data: &mut [S],
    stats: &StreamStats,
    convert: impl Fn(f32) -> S,
) {
    let mut scratch = [0.0f32; CONVERT_CHUNK];
    let mut short = false;
    for chunk in data.chunks_mut(CONVERT_CHUNK) {
        let scratch = &mut scratch[..chunk.len()];
        short |= output.read_or_silence(scratch) < chunk.len();
        for (dst, src) in chunk.iter_mut().zip(scratch.iter()) {
            *dst = convert(*src);
        }
    }
    if short {
        stats.underruns.fetch_add(1, Ordering::Relaxed);
    }
    stats.played.fetch_add(data.len() as u64, Ordering::Relaxed);
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    config: &StreamConfig,
    mut output: SampleConsumer<f32>,
    stats: Arc<StreamStats>,
) -> Result<cpal::Stream, DeviceError> {
    let on_error = |err: cpal::StreamError| error!(%err, "output stream error");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _| pull(&mut output, data, &stats),
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _| {
                pull_converted(&mut output, data, &stats, |s| {
                    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                })
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_output_stream(
            config,
            move |data: &mut [u16], _| {
                pull_converted(&mut output, data, &stats, |s| {
                    ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16
                })
            },
            on_error,
            None,
        )?,
        other => return Err(DeviceError::SampleFormat(format!("{other:?}"))),
    };
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::sample_ring;

    #[test]
    fn short_reads_are_padded_and_counted() {
        let (mut tx, mut rx) = sample_ring::<f32>(16);
        tx.write(&[0.5, -0.5]);
        let stats = StreamStats::default();

        let mut out = [1.0; 4];
        pull(&mut rx, &mut out, &stats);
        assert_eq!(out, [0.5, -0.5, 0.0, 0.0]);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 1);

        tx.write(&[1.0; 4]);
        let mut ints = [0i16; 4];
        pull_converted(&mut rx, &mut ints, &stats, |s| (s * i16::MAX as f32) as i16);
        assert_eq!(ints, [i16::MAX; 4]);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 1);
        assert_eq!(stats.played.load(Ordering::Relaxed), 8);
    }
}
