//! Biquad filter effect

use crate::dsp::{Biquad, FilterMode};
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

static PARAMS: [ParamInfo; 4] = [
    ParamInfo::new("mode", 0.0, 6.0, 0.0),
    ParamInfo::new("frequency", 10.0, 20_000.0, 1_000.0),
    ParamInfo::new("q", 0.1, 20.0, 0.707),
    ParamInfo::new("gain", -24.0, 24.0, 0.0),
];

/// Sums its inputs through one [`Biquad`] per channel.
pub struct Filter {
    mode: FilterMode,
    frequency: f32,
    q: f32,
    gain_db: f32,
    channels: [Biquad; 2],
    /// Rate the coefficients were computed for, 0 when they are stale.
    tuned_for: u32,
}

impl Filter {
    pub fn new(mode: FilterMode, frequency: f32) -> Self {
        Self {
            mode,
            frequency: PARAMS[1].clamp(frequency),
            q: PARAMS[2].default,
            gain_db: PARAMS[3].default,
            channels: [Biquad::default(); 2],
            tuned_for: 0,
        }
    }

    pub fn with_q(mut self, q: f32) -> Self {
        self.q = PARAMS[2].clamp(q);
        self
    }

    pub fn with_gain(mut self, gain_db: f32) -> Self {
        self.gain_db = PARAMS[3].clamp(gain_db);
        self
    }

    #[inline]
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    fn retune(&mut self, sample_rate: u32) {
        let (mode, freq, q, gain) = (self.mode, self.frequency, self.q, self.gain_db);
        for filter in &mut self.channels {
            filter.set(mode, sample_rate as f32, freq, q, gain);
        }
        self.tuned_for = sample_rate;
    }
}

impl ProcessingUnit for Filter {
    fn id(&self) -> &str {
        "effect.filter"
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
        for frame in output.chunks_exact_mut(ctx.channels) {
            for (filter, sample) in self.channels.iter_mut().zip(frame.iter_mut()) {
                *sample = filter.process(*sample);
            }
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        match index {
            0 => self.mode.index() as f32,
            1 => self.frequency,
            2 => self.q,
            3 => self.gain_db,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        let Some(info) = PARAMS.get(index) else {
            return;
        };
        let value = info.clamp(value);
        match index {
            0 => self.mode = FilterMode::from_index(value.round() as usize),
            1 => self.frequency = value,
            2 => self.q = value,
            _ => self.gain_db = value,
        }
        self.tuned_for = 0;
    }

    fn reset(&mut self) {
        self.channels.iter_mut().for_each(Biquad::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    const SR: u32 = 48_000;

    fn sine_peak(filter: &mut Filter, freq: f32) -> f32 {
        let frames = 4_096;
        let input: Vec<f32> = (0..frames)
            .flat_map(|n| {
                let s = (TAU * freq * n as f32 / SR as f32).sin();
                [s, s]
            })
            .collect();
        let inputs = vec![input];
        let mut out = vec![0.0; frames * 2];
        filter
            .process(&mut ProcessContext::new(SR, frames, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        // skip the transient
        out[frames..].iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn low_pass_keeps_lows_and_cuts_highs() {
        let mut filter = Filter::new(FilterMode::LowPass, 500.0);
        assert!(sine_peak(&mut filter, 100.0) > 0.9);
        filter.reset();
        assert!(sine_peak(&mut filter, 10_000.0) < 0.05);
    }

    #[test]
    fn mode_param_switches_response() {
        let mut filter = Filter::new(FilterMode::LowPass, 500.0);
        filter.set_param(0, 1.0);
        assert_eq!(filter.mode(), FilterMode::HighPass);
        assert!(sine_peak(&mut filter, 10_000.0) > 0.9);
    }

    #[test]
    fn frequency_clamps_to_range() {
        let mut filter = Filter::new(FilterMode::Peak, 1_000.0).with_gain(6.0);
        filter.set_param(1, 1.0e6);
        assert_eq!(filter.param(1), 20_000.0);
        assert_eq!(filter.param(3), 6.0);
    }
}
