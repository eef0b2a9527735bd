mod oscillator;
mod synth;

pub use oscillator::*;
pub use synth::*;
