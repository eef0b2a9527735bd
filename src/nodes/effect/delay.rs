//! Feedback delay

use crate::dsp::DelayLine;
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

/// Longest delay the lines are allocated for, in seconds.
pub const MAX_DELAY_SECS: f32 = 5.0;

static PARAMS: [ParamInfo; 4] = [
    ParamInfo::new("time", 0.001, 2.0, 0.25),
    ParamInfo::new("feedback", 0.0, 0.99, 0.6),
    ParamInfo::new("mix", -1.0, 1.0, 0.0),
    ParamInfo::new("stereo_offset", -1.0, 1.0, 0.0),
];

/// Stereo feedback delay.
///
/// `mix` runs from fully dry (-1) to fully wet (1). A positive stereo offset
/// delays the right side further, a negative one the left.
pub struct Delay {
    time: f32,
    feedback: f32,
    mix: f32,
    stereo_offset: f32,
    lines: [DelayLine; 2],
}

impl Delay {
    /// Allocates the delay lines; build on the control thread.
    pub fn new(sample_rate: u32) -> Self {
        let len = (MAX_DELAY_SECS * sample_rate as f32) as usize;
        Self {
            time: PARAMS[0].default,
            feedback: PARAMS[1].default,
            mix: PARAMS[2].default,
            stereo_offset: PARAMS[3].default,
            lines: [DelayLine::new(len), DelayLine::new(len)],
        }
    }

    pub fn with_time(mut self, secs: f32) -> Self {
        self.time = PARAMS[0].clamp(secs);
        self
    }

    pub fn with_feedback(mut self, feedback: f32) -> Self {
        self.feedback = PARAMS[1].clamp(feedback);
        self
    }

    pub fn with_mix(mut self, mix: f32) -> Self {
        self.mix = PARAMS[2].clamp(mix);
        self
    }
}

impl ProcessingUnit for Delay {
    fn id(&self) -> &str {
        "effect.delay"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);

        let (left, right) = if self.stereo_offset > 0.0 {
            (self.time, self.time + self.stereo_offset)
        } else {
            (self.time - self.stereo_offset, self.time)
        };
        let rate = ctx.sample_rate as f32;
        let delays = [(left * rate).round() as usize, (right * rate).round() as usize];
        let wet = (self.mix + 1.0) / 2.0;
        let dry = 1.0 - wet;

        for frame in output.chunks_exact_mut(ctx.channels) {
            for (ch, sample) in frame.iter_mut().enumerate().take(2) {
                let line = &mut self.lines[ch];
                let delayed = line.read(delays[ch]);
                let input = *sample;
                *sample = input * dry + delayed * wet;
                line.write(self.feedback * (delayed + input));
            }
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        match index {
            0 => self.time,
            1 => self.feedback,
            2 => self.mix,
            3 => self.stereo_offset,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        let Some(info) = PARAMS.get(index) else {
            return;
        };
        let value = info.clamp(value);
        match index {
            0 => self.time = value,
            1 => self.feedback = value,
            2 => self.mix = value,
            _ => self.stereo_offset = value,
        }
    }

    fn reset(&mut self) {
        self.lines.iter_mut().for_each(DelayLine::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 1_000;

    fn impulse_response(delay: &mut Delay, frames: usize) -> Vec<f32> {
        let mut input = vec![0.0; frames * 2];
        input[0] = 1.0;
        input[1] = 1.0;
        let inputs = vec![input];
        let mut out = vec![0.0; frames * 2];
        delay
            .process(&mut ProcessContext::new(SR, frames, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        out
    }

    #[test]
    fn echoes_after_the_delay_time() {
        // 10 frames at 1 kHz, fully wet, half feedback
        let mut delay = Delay::new(SR).with_time(0.01).with_feedback(0.5).with_mix(1.0);
        let out = impulse_response(&mut delay, 32);
        let left: Vec<f32> = out.iter().step_by(2).copied().collect();
        assert_eq!(left[0], 0.0);
        assert!((left[10] - 0.5).abs() < 1e-6);
        assert!((left[20] - 0.25).abs() < 1e-6);
        assert!(left[11..20].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn stereo_offset_delays_one_side() {
        let mut delay = Delay::new(SR).with_time(0.01).with_feedback(0.5).with_mix(1.0);
        delay.set_param(3, 0.005);
        let out = impulse_response(&mut delay, 32);
        assert!((out[10 * 2] - 0.5).abs() < 1e-6);
        assert_eq!(out[10 * 2 + 1], 0.0);
        assert!((out[15 * 2 + 1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn reset_clears_the_tail() {
        let mut delay = Delay::new(SR).with_time(0.01).with_mix(1.0);
        let mut input = vec![0.0; 10];
        input[0] = 1.0;
        let inputs = vec![input];
        let mut out = vec![0.0; 10];
        delay
            .process(&mut ProcessContext::new(SR, 5, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        delay.reset();
        let silent = vec![vec![0.0; 64]];
        let mut out = vec![1.0; 64];
        delay
            .process(&mut ProcessContext::new(SR, 32, 2), Inputs::new(&silent), &mut out)
            .unwrap();
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
