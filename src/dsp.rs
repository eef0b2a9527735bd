//! Small DSP building blocks shared by the built-in units.

use std::f32::consts::PI;

/// dB to linear amplitude factor, `10^(db/10)`.
#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 10.0)
}

/// Frequency of `key` in 12-tone equal temperament, key 57 = A 440 Hz.
#[inline]
pub fn key_to_freq(key: u8) -> f32 {
    440.0 * 2f32.powf((key as f32 - 57.0) / 12.0)
}

/// Constant-sum pan law: `pan` in -1..=1 to (left, right) multipliers.
#[inline]
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let right = (pan.clamp(-1.0, 1.0) + 1.0) * 0.5;
    (1.0 - right, right)
}

/// Split interleaved stereo into planar ports.
///
/// One port receives L+R; two ports receive L and R. Any other port count is
/// zeroed.
pub fn deinterleave_stereo(src: &[f32], ports: &mut [Vec<f32>], frames: usize) {
    match ports {
        [mono] => {
            for (i, out) in mono.iter_mut().take(frames).enumerate() {
                *out = src[i * 2] + src[i * 2 + 1];
            }
        }
        [left, right] => {
            for i in 0..frames {
                left[i] = src[i * 2];
                right[i] = src[i * 2 + 1];
            }
        }
        _ => ports.iter_mut().for_each(|p| p.fill(0.0)),
    }
}

/// Interleave planar ports into stereo. One port is duplicated to both
/// channels; any other count than one or two writes silence.
pub fn interleave_stereo(ports: &[Vec<f32>], dest: &mut [f32], frames: usize) {
    match ports {
        [mono] => {
            for i in 0..frames {
                dest[i * 2] = mono[i];
                dest[i * 2 + 1] = mono[i];
            }
        }
        [left, right] => {
            for i in 0..frames {
                dest[i * 2] = left[i];
                dest[i * 2 + 1] = right[i];
            }
        }
        _ => dest.fill(0.0),
    }
}

/// Response shapes for [`Biquad`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterMode {
    LowPass,
    HighPass,
    BandPass,
    Peak,
    LowShelf,
    HighShelf,
    AllPass,
}

impl FilterMode {
    pub const ALL: [FilterMode; 7] = [
        FilterMode::LowPass,
        FilterMode::HighPass,
        FilterMode::BandPass,
        FilterMode::Peak,
        FilterMode::LowShelf,
        FilterMode::HighShelf,
        FilterMode::AllPass,
    ];

    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|m| *m == self).unwrap_or(0)
    }
}

/// Second-order IIR section using the RBJ Audio EQ Cookbook formulas.
///
/// Transposed direct form II; one instance filters one channel.
#[derive(Clone, Copy, Debug)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Default for Biquad {
    /// A pass-through filter.
    fn default() -> Self {
        Self { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0, z1: 0.0, z2: 0.0 }
    }
}

impl Biquad {
    pub fn new(mode: FilterMode, sample_rate: f32, freq: f32, q: f32, gain_db: f32) -> Self {
        let mut filter = Self::default();
        filter.set(mode, sample_rate, freq, q, gain_db);
        filter
    }

    /// Recompute coefficients, keeping the filter history.
    ///
    /// `gain_db` only affects peak and shelf modes.
    pub fn set(&mut self, mode: FilterMode, sample_rate: f32, freq: f32, q: f32, gain_db: f32) {
        let freq = freq.clamp(10.0, sample_rate * 0.49);
        let q = q.max(0.01);
        let w0 = 2.0 * PI * freq / sample_rate;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        let a = 10f32.powf(gain_db / 40.0);

        let (b0, b1, b2, a0, a1, a2) = match mode {
            FilterMode::LowPass => {
                let b = (1.0 - cos) / 2.0;
                (b, 1.0 - cos, b, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            FilterMode::HighPass => {
                let b = (1.0 + cos) / 2.0;
                (b, -(1.0 + cos), b, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            FilterMode::BandPass => (alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha),
            FilterMode::Peak => (
                1.0 + alpha * a,
                -2.0 * cos,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos,
                1.0 - alpha / a,
            ),
            FilterMode::LowShelf => {
                let sq = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos + sq),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                    a * ((a + 1.0) - (a - 1.0) * cos - sq),
                    (a + 1.0) + (a - 1.0) * cos + sq,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                    (a + 1.0) + (a - 1.0) * cos - sq,
                )
            }
            FilterMode::HighShelf => {
                let sq = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos + sq),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                    a * ((a + 1.0) + (a - 1.0) * cos - sq),
                    (a + 1.0) - (a - 1.0) * cos + sq,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos),
                    (a + 1.0) - (a - 1.0) * cos - sq,
                )
            }
            FilterMode::AllPass => (
                1.0 - alpha,
                -2.0 * cos,
                1.0 + alpha,
                1.0 + alpha,
                -2.0 * cos,
                1.0 - alpha,
            ),
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// One-pole smoothing coefficient that covers 99% of a step in `ms`
/// milliseconds.
#[inline]
pub fn time_coeff(ms: f32, sample_rate: f32) -> f32 {
    0.01f32.powf(1.0 / (ms * sample_rate * 0.001).max(1.0))
}

/// Follows a level with separate attack and release coefficients, as made
/// by [`time_coeff`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeFollower {
    level: f32,
}

impl EnvelopeFollower {
    /// Move towards `target` and return the new level.
    #[inline]
    pub fn follow(&mut self, target: f32, attack: f32, release: f32) -> f32 {
        let coeff = if target > self.level { attack } else { release };
        self.level = coeff * (self.level - target) + target;
        self.level
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

/// Fixed-length circular delay line.
pub struct DelayLine {
    buffer: Vec<f32>,
    write_pos: usize,
}

impl DelayLine {
    /// A line that can delay by up to `max_samples - 1` samples.
    pub fn new(max_samples: usize) -> Self {
        Self { buffer: vec![0.0; max_samples.max(1)], write_pos: 0 }
    }

    /// The sample written `delay` samples ago, without advancing.
    #[inline]
    pub fn read(&self, delay: usize) -> f32 {
        let len = self.buffer.len();
        let delay = delay.clamp(1, len);
        self.buffer[(self.write_pos + len - delay) % len]
    }

    /// Store `sample` and advance.
    #[inline]
    pub fn write(&mut self, sample: f32) {
        self.buffer[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}
