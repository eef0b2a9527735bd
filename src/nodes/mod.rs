//! Built-in processing units.
//!
//! ## Sources ([`source`])
//!
//! Generate audio and ignore their inputs:
//! - [`Oscillator`] - free-running waveform oscillator
//! - [`WaveformSynth`] - 16-voice, three-oscillator synthesizer driven by note events
//!
//! ## Effects ([`effect`])
//!
//! Sum their inputs and process the result:
//! - [`Gain`] - level in dB with smoothing
//! - [`Volume`] - channel volume, pan and mute with zero-crossing updates
//! - [`Delay`] - stereo feedback delay
//! - [`Filter`] - biquad filter
//! - [`Analyzer`] - pass-through peak meter
//! - [`Equalizer`] - low-pass, high-pass and eight peaking bands
//! - [`Limiter`] - peak limiter
//! - [`Compressor`] - downward compressor with ratio
//! - [`Reverb`] - four-line feedback delay network
//!
//! Every unit exposes its controls as parameters, so they are driven through
//! [`NodeHandle::set_param`](crate::graph::NodeHandle::set_param) rather than
//! per-node message types.

pub mod effect;
pub mod source;

pub use effect::{
    Analyzer, AnalyzerReader, Compressor, Delay, Equalizer, Filter, Gain, Limiter, PeakReading,
    Reverb, Volume,
};
pub use source::{Oscillator, Waveform, WaveformSynth};
