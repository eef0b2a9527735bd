//! Downward compressor

use crate::dsp::{db_to_gain, time_coeff, EnvelopeFollower};
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

pub const INPUT_GAIN: usize = 0;
pub const OUTPUT_GAIN: usize = 1;
pub const THRESHOLD: usize = 2;
pub const RATIO: usize = 3;
pub const ATTACK: usize = 4;
pub const RELEASE: usize = 5;

static PARAMS: [ParamInfo; 6] = [
    ParamInfo::new("input_gain", -20.0, 20.0, 0.0),
    ParamInfo::new("output_gain", -20.0, 20.0, 0.0),
    ParamInfo::new("threshold", -20.0, 0.0, -0.5),
    ParamInfo::new("ratio", 1.0, 10.0, 1.0),
    ParamInfo::new("attack", 1.0, 1_000.0, 100.0),
    ParamInfo::new("release", 1.0, 1_000.0, 500.0),
];

/// Compresses levels above the threshold by `ratio`.
///
/// Works like [`Limiter`](super::Limiter), except the followed level is the
/// one the compression curve allows rather than the raw peak. At ratio 1 the
/// signal passes unchanged; large ratios approach limiting.
pub struct Compressor {
    values: [f32; 6],
    envelopes: [EnvelopeFollower; 2],
}

impl Default for Compressor {
    fn default() -> Self {
        let mut values = [0.0; 6];
        for (value, info) in values.iter_mut().zip(PARAMS.iter()) {
            *value = info.default;
        }
        Self { values, envelopes: [EnvelopeFollower::default(); 2] }
    }
}

impl Compressor {
    pub fn new(threshold_db: f32, ratio: f32) -> Self {
        let mut compressor = Self::default();
        compressor.set_param(THRESHOLD, threshold_db);
        compressor.set_param(RATIO, ratio);
        compressor
    }
}

impl ProcessingUnit for Compressor {
    fn id(&self) -> &str {
        "effect.compressor"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);

        let rate = ctx.sample_rate as f32;
        let input_gain = db_to_gain(self.values[INPUT_GAIN]);
        let output_gain = db_to_gain(self.values[OUTPUT_GAIN]);
        let threshold = db_to_gain(self.values[THRESHOLD]);
        let exponent = 1.0 - 1.0 / self.values[RATIO];
        let attack = time_coeff(self.values[ATTACK], rate);
        let release = time_coeff(self.values[RELEASE], rate);

        for frame in output.chunks_exact_mut(ctx.channels) {
            for (env, sample) in self.envelopes.iter_mut().zip(frame.iter_mut()) {
                let mut x = *sample * input_gain;
                let target = threshold * (x.abs() / threshold).powf(exponent);
                let level = env.follow(target, attack, release);
                if level > threshold {
                    x = x / level * threshold;
                }
                *sample = x * output_gain;
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
        if let Some(info) = PARAMS.get(index) {
            self.values[index] = info.clamp(value);
        }
    }

    fn reset(&mut self) {
        self.envelopes.iter_mut().for_each(EnvelopeFollower::reset);
    }
}
