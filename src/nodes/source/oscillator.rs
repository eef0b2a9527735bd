//! Basic waveform oscillator

use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

/// Oscillator wave shapes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
    Noise,
}

impl Waveform {
    pub const ALL: [Waveform; 5] = [
        Waveform::Sine,
        Waveform::Square,
        Waveform::Sawtooth,
        Waveform::Triangle,
        Waveform::Noise,
    ];

    /// Parameter value to shape; out-of-range values clamp.
    pub fn from_param(value: f32) -> Self {
        let index = value.round().clamp(0.0, (Self::ALL.len() - 1) as f32) as usize;
        Self::ALL[index]
    }

    pub fn as_param(self) -> f32 {
        Self::ALL.iter().position(|w| *w == self).unwrap_or(0) as f32
    }

    /// One sample at `phase` cycles (0..1).
    #[inline]
    pub fn sample(self, phase: f32, noise: &mut Noise) -> f32 {
        match self {
            Waveform::Sine => (phase * core::f32::consts::TAU).sin(),
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Sawtooth => 2.0 * (phase + 0.5).fract() - 1.0,
            Waveform::Triangle => 1.0 - 4.0 * ((phase + 0.25).fract() - 0.5).abs(),
            Waveform::Noise => noise.next(),
        }
    }
}

/// Cheap white noise (xorshift32).
#[derive(Clone, Copy, Debug)]
pub struct Noise(u32);

impl Default for Noise {
    fn default() -> Self {
        Noise(0x9e37_79b9)
    }
}

impl Noise {
    #[inline]
    pub fn next(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

static PARAMS: [ParamInfo; 3] = [
    ParamInfo::new("shape", 0.0, 4.0, 0.0),
    ParamInfo::new("frequency", 0.0, 20_000.0, 440.0),
    ParamInfo::new("amplitude", 0.0, 1.0, 0.25),
];

/// A free-running oscillator, same signal on every channel.
pub struct Oscillator {
    waveform: Waveform,
    frequency: f32,
    amplitude: f32,
    phase: f32,
    noise: Noise,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: f32) -> Self {
        Self {
            waveform,
            frequency: frequency.max(0.0),
            amplitude: 0.25, // -12dB, safe default
            phase: 0.0,
            noise: Noise::default(),
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    #[inline]
    pub fn frequency(&self) -> f32 {
        self.frequency
    }
}

impl ProcessingUnit for Oscillator {
    fn id(&self) -> &str {
        "source.oscillator"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        _inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        let phase_inc = self.frequency / ctx.sample_rate as f32;

        for frame in output.chunks_exact_mut(ctx.channels) {
            let sample = self.waveform.sample(self.phase, &mut self.noise) * self.amplitude;
            frame.fill(sample);

            self.phase += phase_inc;
            self.phase -= self.phase.floor();
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        match index {
            0 => self.waveform.as_param(),
            1 => self.frequency,
            2 => self.amplitude,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        match index {
            0 => self.waveform = Waveform::from_param(value),
            1 => self.frequency = PARAMS[1].clamp(value),
            2 => self.amplitude = PARAMS[2].clamp(value),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_hit_expected_points() {
        let mut noise = Noise::default();
        assert!(Waveform::Sine.sample(0.25, &mut noise) > 0.999);
        assert_eq!(Waveform::Square.sample(0.1, &mut noise), 1.0);
        assert_eq!(Waveform::Square.sample(0.6, &mut noise), -1.0);
        assert!(Waveform::Sawtooth.sample(0.0, &mut noise).abs() < 1e-6);
        assert!((Waveform::Triangle.sample(0.25, &mut noise) - 1.0).abs() < 1e-6);
        assert!(Waveform::Triangle.sample(0.0, &mut noise).abs() < 1e-6);
        for _ in 0..1000 {
            let n = Waveform::Noise.sample(0.0, &mut noise);
            assert!((-1.0..=1.0).contains(&n));
        }
    }

    #[test]
    fn fills_every_channel_with_the_same_signal() {
        let mut osc = Oscillator::new(Waveform::Sine, 1_000.0).with_amplitude(0.5);
        let mut out = vec![0.0; 64 * 2];
        osc.process(&mut ProcessContext::new(48_000, 64, 2), Inputs::none(), &mut out)
            .unwrap();
        for frame in out.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0].abs() <= 0.5);
        }
        assert!(out.iter().any(|s| s.abs() > 0.4));
    }

    #[test]
    fn params_clamp() {
        let mut osc = Oscillator::new(Waveform::Sine, 440.0);
        osc.set_param(0, 9.0);
        osc.set_param(2, 3.0);
        assert_eq!(osc.param(0), Waveform::Noise.as_param());
        assert_eq!(osc.param(2), 1.0);
    }
}
