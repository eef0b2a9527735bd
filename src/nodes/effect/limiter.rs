//! Peak limiter

use crate::dsp::{db_to_gain, time_coeff, EnvelopeFollower};
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

pub const INPUT_GAIN: usize = 0;
pub const OUTPUT_GAIN: usize = 1;
pub const THRESHOLD: usize = 2;
pub const ATTACK: usize = 3;
pub const RELEASE: usize = 4;

static PARAMS: [ParamInfo; 5] = [
    ParamInfo::new("input_gain", -20.0, 20.0, 0.0),
    ParamInfo::new("output_gain", -20.0, 20.0, 0.0),
    ParamInfo::new("threshold", -20.0, 0.0, -0.5),
    ParamInfo::new("attack", 1.0, 1_000.0, 10.0),
    ParamInfo::new("release", 1.0, 1_000.0, 500.0),
];

/// Scales each channel down whenever its followed peak level passes the
/// threshold. Gains and threshold are in dB, times in milliseconds.
pub struct Limiter {
    values: [f32; 5],
    envelopes: [EnvelopeFollower; 2],
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            values: [
                PARAMS[0].default,
                PARAMS[1].default,
                PARAMS[2].default,
                PARAMS[3].default,
                PARAMS[4].default,
            ],
            envelopes: [EnvelopeFollower::default(); 2],
        }
    }
}

impl Limiter {
    pub fn new(threshold_db: f32) -> Self {
        let mut limiter = Self::default();
        limiter.set_param(THRESHOLD, threshold_db);
        limiter
    }

    /// Current followed level per channel, as a linear amplitude.
    pub fn levels(&self) -> [f32; 2] {
        [self.envelopes[0].level(), self.envelopes[1].level()]
    }
}

impl ProcessingUnit for Limiter {
    fn id(&self) -> &str {
        "effect.limiter"
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
        let attack = time_coeff(self.values[ATTACK], rate);
        let release = time_coeff(self.values[RELEASE], rate);

        for frame in output.chunks_exact_mut(ctx.channels) {
            for (env, sample) in self.envelopes.iter_mut().zip(frame.iter_mut()) {
                let mut x = *sample * input_gain;
                let level = env.follow(x.abs(), attack, release);
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
