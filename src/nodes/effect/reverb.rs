//! Feedback delay network reverb

use crate::dsp::DelayLine;
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

/// Internal delay lines, alternating between left and right input.
const LINES: usize = 4;
/// Line lengths at size 1, in seconds.
const BASE_LENGTHS: [f32; LINES] = [0.1, 0.11, 0.12, 0.13];
const MAX_SIZE: f32 = 2.0;

static PARAMS: [ParamInfo; 3] = [
    ParamInfo::new("mix", 0.0, 1.0, 0.3),
    ParamInfo::new("feedback", 0.0, 0.95, 0.5),
    ParamInfo::new("size", 0.25, MAX_SIZE, 1.0),
];

/// Four delay lines fed back through a Householder matrix.
///
/// `mix` runs from fully dry (0) to fully wet (1); `size` scales every line
/// length.
pub struct Reverb {
    mix: f32,
    feedback: f32,
    size: f32,
    lines: [DelayLine; LINES],
}

impl Reverb {
    /// Allocates the delay lines; build on the control thread.
    pub fn new(sample_rate: u32) -> Self {
        let longest = BASE_LENGTHS[LINES - 1] * MAX_SIZE * sample_rate as f32;
        let len = longest.ceil() as usize + 1;
        Self {
            mix: PARAMS[0].default,
            feedback: PARAMS[1].default,
            size: PARAMS[2].default,
            lines: std::array::from_fn(|_| DelayLine::new(len)),
        }
    }

    pub fn with_mix(mut self, mix: f32) -> Self {
        self.mix = PARAMS[0].clamp(mix);
        self
    }

    pub fn with_feedback(mut self, feedback: f32) -> Self {
        self.feedback = PARAMS[1].clamp(feedback);
        self
    }
}

/// Reflect `values` through the plane orthogonal to all-ones. Keeps energy,
/// so feedback below one always decays.
#[inline]
fn householder(values: &mut [f32; LINES]) {
    let shift = values.iter().sum::<f32>() * (-2.0 / LINES as f32);
    values.iter_mut().for_each(|v| *v += shift);
}

impl ProcessingUnit for Reverb {
    fn id(&self) -> &str {
        "effect.reverb"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);

        let rate = ctx.sample_rate as f32;
        let lengths = BASE_LENGTHS.map(|secs| (secs * self.size * rate).round() as usize);
        let wet = self.mix;
        let dry = 1.0 - wet;

        for frame in output.chunks_exact_mut(ctx.channels) {
            let input = [frame[0], frame.get(1).copied().unwrap_or(frame[0])];
            let taps: [f32; LINES] = std::array::from_fn(|i| self.lines[i].read(lengths[i]));
            let mut fed = taps.map(|tap| tap * self.feedback);
            householder(&mut fed);

            let mut tail = [0.0; 2];
            for (i, line) in self.lines.iter_mut().enumerate() {
                line.write(input[i % 2] + fed[i]);
                tail[i % 2] += taps[i];
            }
            for (ch, sample) in frame.iter_mut().enumerate().take(2) {
                *sample = input[ch] * dry + tail[ch] * 0.5 * wet;
            }
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        match index {
            0 => self.mix,
            1 => self.feedback,
            2 => self.size,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        let Some(info) = PARAMS.get(index) else {
            return;
        };
        let value = info.clamp(value);
        match index {
            0 => self.mix = value,
            1 => self.feedback = value,
            _ => self.size = value,
        }
    }

    fn reset(&mut self) {
        self.lines.iter_mut().for_each(DelayLine::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    /// Left channel of `frames` frames following a unit impulse.
    fn impulse_response(reverb: &mut Reverb, frames: usize) -> Vec<f32> {
        let mut input = vec![0.0; frames * 2];
        input[0] = 1.0;
        input[1] = 1.0;
        let inputs = vec![input];
        let mut out = vec![0.0; frames * 2];
        reverb
            .process(&mut ProcessContext::new(SR, frames, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        out.iter().step_by(2).copied().collect()
    }

    fn energy(samples: &[f32]) -> f32 {
        samples.iter().map(|s| s * s).sum()
    }

    #[test]
    fn tail_starts_after_the_shortest_line_and_decays() {
        let mut reverb = Reverb::new(SR).with_mix(1.0);
        let left = impulse_response(&mut reverb, SR as usize * 2);

        // fully wet: nothing until the first line comes around
        assert!(left[..4_800].iter().all(|s| *s == 0.0));
        assert!(left[4_800..6_400].iter().any(|s| s.abs() > 0.01));

        let early = energy(&left[4_800..24_000]);
        let late = energy(&left[72_000..]);
        assert!(late < early * 0.1, "early {early} late {late}");
    }

    #[test]
    fn dry_mix_passes_the_input() {
        let mut reverb = Reverb::new(SR).with_mix(0.0);
        let left = impulse_response(&mut reverb, 1_024);
        assert_eq!(left[0], 1.0);
        assert!(left[1..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn zero_feedback_echoes_once_per_line() {
        let mut reverb = Reverb::new(SR).with_mix(1.0).with_feedback(0.0);
        let left = impulse_response(&mut reverb, 12_000);
        // lines one and three carry the left input
        let echoes: Vec<usize> = (0..left.len()).filter(|&n| left[n] != 0.0).collect();
        assert_eq!(echoes, vec![4_800, 5_760]);
        assert_eq!(left[4_800], 0.5);
    }
}
