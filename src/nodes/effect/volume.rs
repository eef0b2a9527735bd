//! Channel volume, pan and mute

use crate::dsp::pan_gains;
use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};

static PARAMS: [ParamInfo; 3] = [
    ParamInfo::new("volume", 0.0, 1.0, 0.5),
    ParamInfo::new("pan", -1.0, 1.0, 0.0),
    ParamInfo::new("mute", 0.0, 1.0, 0.0),
];

pub const VOLUME: usize = 0;
pub const PAN: usize = 1;
pub const MUTE: usize = 2;

#[inline]
fn is_zero_crossing(prev: f32, next: f32) -> bool {
    (prev == 0.0 && next == 0.0) || (prev >= 0.0) != (next >= 0.0)
}

/// Sums its inputs and applies volume, pan and mute.
///
/// A new gain takes effect on each side at that side's next zero crossing,
/// so changes never click.
pub struct Volume {
    volume: f32,
    pan: f32,
    mute: bool,
    current: [f32; 2],
    last: [f32; 2],
}

impl Default for Volume {
    fn default() -> Self {
        Self::new(0.5, 0.0)
    }
}

impl Volume {
    pub fn new(volume: f32, pan: f32) -> Self {
        let mut unit = Self {
            volume: PARAMS[VOLUME].clamp(volume),
            pan: PARAMS[PAN].clamp(pan),
            mute: false,
            current: [0.0; 2],
            last: [0.0; 2],
        };
        unit.current = unit.targets();
        unit
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.mute
    }

    fn targets(&self) -> [f32; 2] {
        if self.mute {
            return [0.0; 2];
        }
        let (left, right) = pan_gains(self.pan);
        [self.volume * left, self.volume * right]
    }
}

impl ProcessingUnit for Volume {
    fn id(&self) -> &str {
        "effect.volume"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);
        let targets = self.targets();

        for frame in output.chunks_exact_mut(ctx.channels) {
            for (ch, sample) in frame.iter_mut().enumerate().take(2) {
                if is_zero_crossing(self.last[ch], *sample) {
                    self.current[ch] = targets[ch];
                }
                self.last[ch] = *sample;
                *sample *= self.current[ch];
            }
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        match index {
            VOLUME => self.volume,
            PAN => self.pan,
            MUTE => self.mute as u8 as f32,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        match index {
            VOLUME => self.volume = PARAMS[VOLUME].clamp(value),
            PAN => self.pan = PARAMS[PAN].clamp(value),
            MUTE => self.mute = value >= 0.5,
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.current = self.targets();
        self.last = [0.0; 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(unit: &mut Volume, input: Vec<f32>) -> Vec<f32> {
        let frames = input.len() / 2;
        let inputs = vec![input];
        let mut out = vec![0.0; frames * 2];
        unit.process(&mut ProcessContext::new(48_000, frames, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        out
    }

    #[test]
    fn pans_and_scales() {
        let mut unit = Volume::new(1.0, 1.0);
        let out = run(&mut unit, vec![0.5, 0.5, 0.5, 0.5]);
        assert_eq!(out, vec![0.0, 0.5, 0.0, 0.5]);
    }

    #[test]
    fn gain_change_waits_for_zero_crossing() {
        let mut unit = Volume::new(1.0, 0.0);
        unit.set_param(VOLUME, 0.0);
        // positive run: no crossing, old gain kept
        let out = run(&mut unit, vec![0.4, 0.4, 0.4, 0.4]);
        assert!(out.iter().all(|s| (*s - 0.2).abs() < 1e-6));
        // sign flip: new gain applies
        let out = run(&mut unit, vec![-0.4, -0.4]);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn mute_silences_after_crossing() {
        let mut unit = Volume::new(1.0, 0.0);
        unit.set_param(MUTE, 1.0);
        assert_eq!(unit.param(MUTE), 1.0);
        let out = run(&mut unit, vec![0.0, 0.0, 0.3, -0.3]);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0]);
    }
}
