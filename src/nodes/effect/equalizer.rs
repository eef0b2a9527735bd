//! Multi-band equalizer

use crate::dsp::{Biquad, FilterMode};
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

/// Peaking bands after the low- and high-pass stages.
pub const BANDS: usize = 8;

pub const LOW_PASS_FREQUENCY: usize = 0;
pub const LOW_PASS_Q: usize = 1;
pub const HIGH_PASS_FREQUENCY: usize = 2;
pub const HIGH_PASS_Q: usize = 3;

const PARAM_COUNT: usize = 4 + BANDS * 3;

static PARAMS: [ParamInfo; PARAM_COUNT] = [
    ParamInfo::new("low_pass_frequency", 20.0, 20_000.0, 19_200.0),
    ParamInfo::new("low_pass_q", 0.1, 10.0, 1.0),
    ParamInfo::new("high_pass_frequency", 10.0, 20_000.0, 10.0),
    ParamInfo::new("high_pass_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band1_frequency", 20.0, 20_000.0, 100.0),
    ParamInfo::new("band1_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band1_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band2_frequency", 20.0, 20_000.0, 200.0),
    ParamInfo::new("band2_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band2_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band3_frequency", 20.0, 20_000.0, 400.0),
    ParamInfo::new("band3_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band3_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band4_frequency", 20.0, 20_000.0, 800.0),
    ParamInfo::new("band4_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band4_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band5_frequency", 20.0, 20_000.0, 1_600.0),
    ParamInfo::new("band5_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band5_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band6_frequency", 20.0, 20_000.0, 3_200.0),
    ParamInfo::new("band6_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band6_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band7_frequency", 20.0, 20_000.0, 6_400.0),
    ParamInfo::new("band7_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band7_gain", -24.0, 24.0, 0.0),
    ParamInfo::new("band8_frequency", 20.0, 20_000.0, 12_800.0),
    ParamInfo::new("band8_q", 0.1, 10.0, 1.0),
    ParamInfo::new("band8_gain", -24.0, 24.0, 0.0),
];

/// Index of the frequency parameter of peaking band `band`. Its q and gain
/// follow at the next two indices.
#[inline]
pub const fn band_param(band: usize) -> usize {
    4 + band * 3
}

/// Low-pass, high-pass and [`BANDS`] peaking filters in series.
///
/// A band with 0 dB gain is skipped.
pub struct Equalizer {
    values: [f32; PARAM_COUNT],
    low_pass: [Biquad; 2],
    high_pass: [Biquad; 2],
    bands: [[Biquad; 2]; BANDS],
    /// Rate the coefficients were computed for, 0 when they are stale.
    tuned_for: u32,
}

impl Default for Equalizer {
    fn default() -> Self {
        let mut values = [0.0; PARAM_COUNT];
        for (value, info) in values.iter_mut().zip(PARAMS.iter()) {
            *value = info.default;
        }
        Self {
            values,
            low_pass: [Biquad::default(); 2],
            high_pass: [Biquad::default(); 2],
            bands: [[Biquad::default(); 2]; BANDS],
            tuned_for: 0,
        }
    }
}

impl Equalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set peaking band `band` to `gain_db` around `frequency`.
    pub fn with_band(mut self, band: usize, frequency: f32, q: f32, gain_db: f32) -> Self {
        if band < BANDS {
            let at = band_param(band);
            self.set_param(at, frequency);
            self.set_param(at + 1, q);
            self.set_param(at + 2, gain_db);
        }
        self
    }

    fn band_gain(&self, band: usize) -> f32 {
        self.values[band_param(band) + 2]
    }

    fn retune(&mut self, sample_rate: u32) {
        let rate = sample_rate as f32;
        let v = self.values;
        for filter in &mut self.low_pass {
            filter.set(FilterMode::LowPass, rate, v[LOW_PASS_FREQUENCY], v[LOW_PASS_Q], 0.0);
        }
        for filter in &mut self.high_pass {
            filter.set(FilterMode::HighPass, rate, v[HIGH_PASS_FREQUENCY], v[HIGH_PASS_Q], 0.0);
        }
        for (band, filters) in self.bands.iter_mut().enumerate() {
            let at = band_param(band);
            for filter in filters {
                filter.set(FilterMode::Peak, rate, v[at], v[at + 1], v[at + 2]);
            }
        }
        self.tuned_for = sample_rate;
    }
}

impl ProcessingUnit for Equalizer {
    fn id(&self) -> &str {
        "effect.eq"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        if self.tuned_for != ctx.sample_rate {
            self.retune(ctx.sample_rate);
        }
        inputs.sum_into(output);

        let active: [bool; BANDS] = std::array::from_fn(|band| self.band_gain(band) != 0.0);
        for frame in output.chunks_exact_mut(ctx.channels) {
            for (ch, sample) in frame.iter_mut().enumerate().take(2) {
                let mut x = self.low_pass[ch].process(*sample);
                x = self.high_pass[ch].process(x);
                for (filters, _) in self.bands.iter_mut().zip(active).filter(|(_, on)| *on) {
                    x = filters[ch].process(x);
                }
                *sample = x;
            }
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        self.values.get(index).copied().unwrap_or(0.0)
    }

    fn set_param(&mut self, index: usize, value: f32) {
        let Some(info) = PARAMS.get(index) else {
            return;
        };
        self.values[index] = info.clamp(value);
        self.tuned_for = 0;
    }

    fn reset(&mut self) {
        self.low_pass.iter_mut().chain(&mut self.high_pass).for_each(Biquad::reset);
        self.bands.iter_mut().flatten().for_each(Biquad::reset);
    }
}
