//! Polyphonic three-oscillator synthesizer

use crate::dsp::{key_to_freq, pan_gains};
use crate::error::UnitError;
use crate::node::{Inputs, NoteEvent, NoteEventKind, ParamInfo, ProcessContext, ProcessingUnit};

use super::oscillator::{Noise, Waveform};

/// Voices that can sound at once. A note-on with all voices busy steals the
/// first one.
pub const MAX_VOICES: usize = 16;
pub const OSCILLATORS: usize = 3;

const PARAMS_PER_OSC: usize = 5;
const ENVELOPE: usize = OSCILLATORS * PARAMS_PER_OSC;

static PARAMS: [ParamInfo; ENVELOPE + 4] = [
    ParamInfo::new("osc1.shape", 0.0, 4.0, 3.0),
    ParamInfo::new("osc1.volume", 0.0, 1.0, 0.5),
    ParamInfo::new("osc1.pan", -1.0, 1.0, 0.0),
    ParamInfo::new("osc1.coarse", -24.0, 24.0, 0.0),
    ParamInfo::new("osc1.fine", -100.0, 100.0, 0.0),
    ParamInfo::new("osc2.shape", 0.0, 4.0, 2.0),
    ParamInfo::new("osc2.volume", 0.0, 1.0, 0.5),
    ParamInfo::new("osc2.pan", -1.0, 1.0, 0.0),
    ParamInfo::new("osc2.coarse", -24.0, 24.0, 0.0),
    ParamInfo::new("osc2.fine", -100.0, 100.0, 6.0),
    ParamInfo::new("osc3.shape", 0.0, 4.0, 0.0),
    ParamInfo::new("osc3.volume", 0.0, 1.0, 0.0),
    ParamInfo::new("osc3.pan", -1.0, 1.0, 0.0),
    ParamInfo::new("osc3.coarse", -24.0, 24.0, 0.0),
    ParamInfo::new("osc3.fine", -100.0, 100.0, 0.0),
    ParamInfo::new("attack", 0.0, 10.0, 0.0),
    ParamInfo::new("decay", 0.0, 10.0, 0.0),
    ParamInfo::new("sustain", 0.0, 1.0, 1.0),
    ParamInfo::new("release", 0.001, 10.0, 0.001),
];

#[derive(Clone, Copy, Debug)]
struct OscSettings {
    waveform: Waveform,
    volume: f32,
    pan: f32,
    coarse: f32,
    fine: f32,
}

impl OscSettings {
    /// Frequency multiplier from coarse semitones and fine cents.
    #[inline]
    fn detune(&self) -> f32 {
        2f32.powf((self.coarse + self.fine / 100.0) / 12.0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Voice {
    active: bool,
    key: u8,
    freq: f32,
    volume: f32,
    phase: [f32; OSCILLATORS],
    time: f32,
    /// Time the note was released and the envelope level at that moment.
    release: Option<(f32, f32)>,
}

/// 16-voice synthesizer with three detunable oscillators and an ADSR
/// envelope. Stereo output; in mono the two pan sides are summed.
pub struct WaveformSynth {
    oscs: [OscSettings; OSCILLATORS],
    attack: f32,
    decay: f32,
    sustain: f32,
    release: f32,
    voices: [Voice; MAX_VOICES],
    noise: Noise,
}

impl Default for WaveformSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveformSynth {
    pub fn new() -> Self {
        let mut synth = Self {
            oscs: [OscSettings { waveform: Waveform::Sine, volume: 0.0, pan: 0.0, coarse: 0.0, fine: 0.0 };
                OSCILLATORS],
            attack: 0.0,
            decay: 0.0,
            sustain: 1.0,
            release: 0.001,
            voices: [Voice::default(); MAX_VOICES],
            noise: Noise::default(),
        };
        for (i, info) in PARAMS.iter().enumerate() {
            synth.set_param(i, info.default);
        }
        synth
    }

    /// Voices currently producing sound, releasing ones included.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    /// Envelope level `time` seconds into a note that has not been released.
    #[inline]
    fn held_level(&self, time: f32) -> f32 {
        if time < self.attack {
            time / self.attack
        } else if time < self.attack + self.decay {
            let t = (time - self.attack) / self.decay;
            1.0 + (self.sustain - 1.0) * t
        } else {
            self.sustain
        }
    }

    fn note_on(&mut self, key: u8, volume: f32) {
        let slot = self.voices.iter().position(|v| !v.active).unwrap_or(0);
        self.voices[slot] = Voice {
            active: true,
            key,
            freq: key_to_freq(key),
            volume,
            phase: [0.0; OSCILLATORS],
            time: 0.0,
            release: None,
        };
    }

    fn note_off(&mut self, key: u8) {
        if let Some(i) = self
            .voices
            .iter()
            .position(|v| v.active && v.key == key && v.release.is_none())
        {
            let time = self.voices[i].time;
            self.voices[i].release = Some((time, self.held_level(time)));
        }
    }
}

impl ProcessingUnit for WaveformSynth {
    fn id(&self) -> &str {
        "synth.waveform"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        _inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        output.fill(0.0);
        let dt = 1.0 / ctx.sample_rate as f32;
        let oscs = self.oscs;
        let detune = oscs.map(|o| o.detune());
        let pans = oscs.map(|o| pan_gains(o.pan));

        for v in 0..MAX_VOICES {
            if !self.voices[v].active {
                continue;
            }

            for frame in output.chunks_exact_mut(ctx.channels) {
                let voice = self.voices[v];
                let env = match voice.release {
                    Some((at, level)) => {
                        let t = (voice.time - at) / self.release;
                        if t > 1.0 {
                            self.voices[v].active = false;
                            break;
                        }
                        (1.0 - t) * level
                    }
                    None => self.held_level(voice.time),
                };

                let (mut left, mut right) = (0.0, 0.0);
                for o in 0..OSCILLATORS {
                    let sample = oscs[o].waveform.sample(voice.phase[o], &mut self.noise)
                        * env
                        * voice.volume
                        * oscs[o].volume;
                    left += sample * pans[o].0;
                    right += sample * pans[o].1;

                    let phase = &mut self.voices[v].phase[o];
                    *phase += voice.freq * detune[o] * dt;
                    *phase -= phase.floor();
                }

                match frame {
                    [mono] => *mono += left + right,
                    [l, r, ..] => {
                        *l += left;
                        *r += right;
                    }
                    [] => {}
                }
                self.voices[v].time += dt;
            }
        }
        Ok(())
    }

    fn note_event(&mut self, event: NoteEvent) {
        match event.kind {
            NoteEventKind::NoteOn => self.note_on(event.key, event.volume),
            NoteEventKind::NoteOff => self.note_off(event.key),
        }
    }

    fn params(&self) -> &[ParamInfo] {
        &PARAMS
    }

    fn param(&self, index: usize) -> f32 {
        if index < ENVELOPE {
            let osc = &self.oscs[index / PARAMS_PER_OSC];
            return match index % PARAMS_PER_OSC {
                0 => osc.waveform.as_param(),
                1 => osc.volume,
                2 => osc.pan,
                3 => osc.coarse,
                _ => osc.fine,
            };
        }
        match index - ENVELOPE {
            0 => self.attack,
            1 => self.decay,
            2 => self.sustain,
            3 => self.release,
            _ => 0.0,
        }
    }

    fn set_param(&mut self, index: usize, value: f32) {
        let Some(info) = PARAMS.get(index) else {
            return;
        };
        let value = info.clamp(value);
        if index < ENVELOPE {
            let osc = &mut self.oscs[index / PARAMS_PER_OSC];
            match index % PARAMS_PER_OSC {
                0 => osc.waveform = Waveform::from_param(value),
                1 => osc.volume = value,
                2 => osc.pan = value,
                3 => osc.coarse = value.round(),
                _ => osc.fine = value,
            }
            return;
        }
        match index - ENVELOPE {
            0 => self.attack = value,
            1 => self.decay = value,
            2 => self.sustain = value,
            _ => self.release = value,
        }
    }

    fn reset(&mut self) {
        for voice in &mut self.voices {
            voice.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 48_000;

    fn render(synth: &mut WaveformSynth, blocks: usize) -> Vec<f32> {
        let mut ctx = ProcessContext::new(SR, 256, 2);
        let mut all = Vec::new();
        let mut out = vec![0.0; 512];
        for _ in 0..blocks {
            synth.process(&mut ctx, Inputs::none(), &mut out).unwrap();
            all.extend_from_slice(&out);
        }
        all
    }

    #[test]
    fn silent_until_a_note_arrives() {
        let mut synth = WaveformSynth::new();
        assert!(render(&mut synth, 2).iter().all(|s| *s == 0.0));

        synth.note_event(NoteEvent::note_on(57, 0.8));
        assert_eq!(synth.active_voices(), 1);
        assert!(render(&mut synth, 2).iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn release_ends_the_voice() {
        let mut synth = WaveformSynth::new();
        synth.set_param(ENVELOPE + 3, 0.01);
        synth.note_event(NoteEvent::note_on(60, 1.0));
        render(&mut synth, 1);

        synth.note_event(NoteEvent::note_off(60));
        // 10 ms release is under three blocks of 256 frames
        render(&mut synth, 3);
        assert_eq!(synth.active_voices(), 0);
        assert!(render(&mut synth, 1).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn note_off_releases_one_matching_voice() {
        let mut synth = WaveformSynth::new();
        synth.note_event(NoteEvent::note_on(60, 1.0));
        synth.note_event(NoteEvent::note_on(60, 1.0));
        synth.note_event(NoteEvent::note_off(60));
        let released = synth.voices.iter().filter(|v| v.release.is_some()).count();
        assert_eq!(released, 1);
    }

    #[test]
    fn voice_stealing_reuses_the_first_slot() {
        let mut synth = WaveformSynth::new();
        for key in 0..MAX_VOICES as u8 + 1 {
            synth.note_event(NoteEvent::note_on(40 + key, 1.0));
        }
        assert_eq!(synth.active_voices(), MAX_VOICES);
        assert_eq!(synth.voices[0].key, 40 + MAX_VOICES as u8);
    }

    #[test]
    fn attack_ramps_in() {
        let mut synth = WaveformSynth::new();
        synth.set_param(ENVELOPE, 1.0);
        synth.note_event(NoteEvent::note_on(57, 1.0));
        let start = render(&mut synth, 1);
        let start_peak = start.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(start_peak < 0.01, "peak {start_peak}");
    }

    #[test]
    fn pan_moves_energy_between_sides() {
        let mut synth = WaveformSynth::new();
        for osc in 0..OSCILLATORS {
            synth.set_param(osc * PARAMS_PER_OSC + 2, -1.0);
        }
        synth.note_event(NoteEvent::note_on(57, 1.0));
        let out = render(&mut synth, 1);
        let right: f32 = out.iter().skip(1).step_by(2).map(|s| s.abs()).sum();
        let left: f32 = out.iter().step_by(2).map(|s| s.abs()).sum();
        assert_eq!(right, 0.0);
        assert!(left > 1.0);
    }
}
