//! Engine configuration.
//!
//! ```
//! use trackcore::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     sample_rate = 44100
//!     block_size = 128
//! "#).unwrap();
//! assert_eq!(config.channels, 2);
//! ```

use serde::Deserialize;

use crate::error::ConfigError;

/// Sizes and rates fixed for the lifetime of an [`Engine`](crate::Engine).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per block (one tick).
    pub block_size: usize,
    /// Interleaved output channels. Only mono and stereo are supported.
    pub channels: usize,
    /// Output ring size, in blocks.
    pub output_buffer_blocks: usize,
    /// Note events each node can queue between ticks.
    pub event_queue_depth: usize,
    /// Commands the control side can queue between ticks.
    pub command_queue_depth: usize,
    /// Objects the audio side can hand back for dropping between collections.
    pub retire_queue_depth: usize,
    /// Diagnostics records buffered between collections.
    pub diagnostics_depth: usize,
    /// Upper bound on ticks run by a single `fill` or export step.
    pub max_catch_up_ticks: usize,
    /// Spare scratch buffers each graph keeps for new connections.
    pub spare_buffers: usize,
    /// Nodes a document's graph can hold before it has to grow.
    pub max_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 256,
            channels: 2,
            output_buffer_blocks: 8,
            event_queue_depth: 64,
            command_queue_depth: 256,
            retire_queue_depth: 256,
            diagnostics_depth: 64,
            max_catch_up_ticks: 64,
            spare_buffers: 32,
            max_nodes: 256,
        }
    }
}

impl EngineConfig {
    /// Parse a config from TOML, filling unspecified fields with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("sample_rate", self.sample_rate as usize),
            ("block_size", self.block_size),
            ("output_buffer_blocks", self.output_buffer_blocks),
            ("event_queue_depth", self.event_queue_depth),
            ("command_queue_depth", self.command_queue_depth),
            ("retire_queue_depth", self.retire_queue_depth),
            ("diagnostics_depth", self.diagnostics_depth),
            ("max_catch_up_ticks", self.max_catch_up_ticks),
            ("max_nodes", self.max_nodes),
        ];
        if let Some((field, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field });
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::Channels(self.channels));
        }
        Ok(())
    }

    /// Samples in one interleaved block.
    #[inline]
    pub fn block_len(&self) -> usize {
        self.block_size * self.channels
    }

    /// Duration of one block in seconds.
    #[inline]
    pub fn block_seconds(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }
}
