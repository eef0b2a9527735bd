//! Creates units from the string ids stored in documents.

use std::sync::Arc;

use hashbrown::HashMap;
use itertools::Itertools;
use tracing::debug;

use crate::config::EngineConfig;
use crate::dsp::FilterMode;
use crate::error::PluginError;
use crate::node::ProcessingUnit;
use crate::nodes::{
    Analyzer, Compressor, Delay, Equalizer, Filter, Gain, Limiter, Oscillator, Reverb, Volume,
    Waveform, WaveformSynth,
};
use crate::plugin::{PluginAdapter, PluginFactory, PluginHost, PluginInfo};

/// Constructor for a built-in unit.
pub type BuiltinFn = fn(&EngineConfig) -> Box<dyn ProcessingUnit>;

/// Maps unit ids to built-in constructors and plugin factories.
#[derive(Default)]
pub struct UnitRegistry {
    builtins: HashMap<&'static str, BuiltinFn>,
    plugins: HashMap<String, Arc<dyn PluginFactory>>,
}

impl UnitRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in unit.
    ///
    /// An analyzer created here has no reader attached; build one directly
    /// with [`Analyzer::new`] to read its levels.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin("synth.waveform", |_| Box::new(WaveformSynth::new()));
        registry.register_builtin("source.oscillator", |_| {
            Box::new(Oscillator::new(Waveform::Sine, 440.0))
        });
        registry.register_builtin("effect.gain", |_| Box::new(Gain::new(0.0)));
        registry.register_builtin("effect.volume", |_| Box::new(Volume::new(0.5, 0.0)));
        registry.register_builtin("effect.delay", |config| Box::new(Delay::new(config.sample_rate)));
        registry.register_builtin("effect.filter", |_| {
            Box::new(Filter::new(FilterMode::LowPass, 1_000.0))
        });
        registry.register_builtin("effect.analyzer", |_| Box::new(Analyzer::new().0));
        registry.register_builtin("effect.eq", |_| Box::new(Equalizer::new()));
        registry.register_builtin("effect.limiter", |_| Box::new(Limiter::default()));
        registry.register_builtin("effect.compressor", |_| Box::new(Compressor::default()));
        registry.register_builtin("effect.reverb", |config| {
            Box::new(Reverb::new(config.sample_rate))
        });
        registry
    }

    pub fn register_builtin(&mut self, id: &'static str, create: BuiltinFn) {
        self.builtins.insert(id, create);
    }

    /// Make a plugin available under the id its info reports.
    pub fn register_plugin(&mut self, factory: Arc<dyn PluginFactory>) {
        let info = factory.info();
        debug!(id = %info.id, name = %info.name, "plugin registered");
        self.plugins.insert(info.id, factory);
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.builtins.contains_key(id) || self.plugins.contains_key(id)
    }

    /// Every registered id, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.builtins
            .keys()
            .copied()
            .chain(self.plugins.keys().map(String::as_str))
            .sorted_unstable()
            .collect()
    }

    /// Descriptions of the registered plugins, sorted by id.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(|f| f.info()).sorted_by(|a, b| a.id.cmp(&b.id)).collect()
    }

    /// Create a fresh unit for `id` with default settings.
    pub fn create(
        &self,
        id: &str,
        host: &mut PluginHost,
        config: &EngineConfig,
    ) -> Result<Box<dyn ProcessingUnit>, PluginError> {
        if let Some(create) = self.builtins.get(id) {
            return Ok(create(config));
        }
        let factory = self.plugins.get(id).ok_or_else(|| PluginError::NotFound(id.to_owned()))?;
        let adapter =
            PluginAdapter::instantiate(factory.as_ref(), host, config.sample_rate, config.block_size)?;
        Ok(Box::new(adapter))
    }
}
