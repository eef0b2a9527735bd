mod analyzer;
pub mod compressor;
mod delay;
pub mod equalizer;
mod filter;
mod gain;
pub mod limiter;
mod reverb;
pub mod volume;

pub use analyzer::*;
pub use compressor::Compressor;
pub use delay::*;
pub use equalizer::Equalizer;
pub use filter::*;
pub use gain::*;
pub use limiter::Limiter;
pub use reverb::*;
pub use volume::Volume;
