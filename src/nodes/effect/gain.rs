//! Gain effect

use crate::dsp::db_to_gain;
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

static PARAMS: [ParamInfo; 1] = [ParamInfo::new("gain", -60.0, 24.0, 0.0)];

/// Sums its inputs and scales them by a gain in dB.
///
/// Gain changes are smoothed to prevent clicks.
pub struct Gain {
    gain_db: f32,
    /// Smoothed linear factor, tracks `db_to_gain(gain_db)`
    smoothed: f32,
    /// Smoothing coefficient (0.0 = instant, 1.0 = no change)
    smooth_coeff: f32,
}

impl Gain {
    pub fn new(gain_db: f32) -> Self {
        let gain_db = PARAMS[0].clamp(gain_db);
        Self {
            gain_db,
            smoothed: db_to_gain(gain_db),
            smooth_coeff: 0.995, // ~7ms at 48kHz
        }
    }

    /// Disable smoothing for instant gain changes
    pub fn without_smoothing(mut self) -> Self {
        self.smooth_coeff = 0.0;
        self
    }

    #[inline]
    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }
}

impl ProcessingUnit for Gain {
    fn id(&self) -> &str {
        "effect.gain"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);

        let target = db_to_gain(self.gain_db);
        let coeff = self.smooth_coeff;
        let mut gain = self.smoothed;
        for frame in output.chunks_exact_mut(ctx.channels) {
            gain = target + coeff * (gain - target);
            frame.iter_mut().for_each(|s| *s *= gain);
        }
        self.smoothed = gain;
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, _index: usize) -> f32 {
        self.gain_db
    }

    fn set_param(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.gain_db = PARAMS[0].clamp(value);
        }
    }

    fn reset(&mut self) {
        self.smoothed = db_to_gain(self.gain_db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_the_sum_of_inputs() {
        let mut gain = Gain::new(10.0).without_smoothing();
        let inputs = vec![vec![0.1; 8], vec![0.2; 8]];
        let mut out = vec![0.0; 8];
        gain.process(&mut ProcessContext::new(48_000, 4, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        for s in out {
            assert!((s - 3.0).abs() < 1e-5);
        }
    }

    #[test]
    fn changes_are_smoothed() {
        let mut gain = Gain::new(0.0);
        gain.set_param(0, -60.0);
        let inputs = vec![vec![1.0; 2]];
        let mut out = vec![0.0; 2];
        gain.process(&mut ProcessContext::new(48_000, 1, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        // one frame in, the gain has barely moved
        assert!(out[0] > 0.99);
    }
}
