//! Runtime contract for externally loaded plugins.
//!
//! A plugin format shim (LADSPA, LV2 and the like) implements [`Plugin`] for
//! an instance and [`PluginFactory`] to create instances. [`PluginAdapter`]
//! then presents any instance as a [`ProcessingUnit`]: control ports become
//! parameters, the interleaved block is split into planar ports and joined
//! back, and note events arrive through a per-instance event buffer.
//!
//! Discovery and metadata scanning happen elsewhere; this module only covers
//! what an already discovered plugin must provide.

use std::borrow::Cow;
use std::io::Write;

use hashbrown::HashMap;
use tracing::{debug, error};

use crate::dsp::{deinterleave_stereo, interleave_stereo};
use crate::error::{PluginError, ScheduleError, StateError, UnitError};
use crate::node::{Inputs, NoteEvent, ParamInfo, ProcessContext, ProcessingUnit, MAX_PARAMS};
use crate::queue::{message_queue, MessageReceiver, MessageSender};
use crate::work::{WorkId, WorkScheduler};

/// Note events a plugin instance can receive per block.
pub const PLUGIN_EVENT_DEPTH: usize = 128;
/// Leading byte of an adapter's saved state.
pub const PLUGIN_STATE_VERSION: u8 = 1;

/// Interned URI handle. Zero is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Urid(u32);

impl Urid {
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// URI interning table, owned by one engine's [`PluginHost`].
#[derive(Debug, Default)]
pub struct UriMap {
    ids: HashMap<String, Urid>,
    uris: Vec<String>,
}

impl UriMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `uri`, assigning the next free one on first use.
    pub fn map(&mut self, uri: &str) -> Urid {
        if let Some(id) = self.ids.get(uri) {
            return *id;
        }
        self.uris.push(uri.to_owned());
        let id = Urid(self.uris.len() as u32);
        self.ids.insert(uri.to_owned(), id);
        id
    }

    pub fn unmap(&self, id: Urid) -> Option<&str> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.uris.get(index).map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.uris.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// Per-engine state handed to plugin factories.
///
/// Created with the engine's control handle and dropped with it; nothing here
/// is global.
#[derive(Debug, Default)]
pub struct PluginHost {
    uris: UriMap,
}

impl PluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn map(&mut self, uri: &str) -> Urid {
        self.uris.map(uri)
    }

    #[inline]
    pub fn unmap(&self, id: Urid) -> Option<&str> {
        self.uris.unmap(id)
    }

    #[inline]
    pub fn uris(&self) -> &UriMap {
        &self.uris
    }
}

/// One control input of a plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlPort {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ControlPort {
    pub fn new(name: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self { name: name.into(), min, max, default }
    }

    fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min <= self.max
            && (self.min..=self.max).contains(&self.default)
    }
}

/// Static description of a plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginInfo {
    /// Registry id, written to documents.
    pub id: String,
    pub name: String,
    pub audio_inputs: usize,
    pub audio_outputs: usize,
    pub controls: Vec<ControlPort>,
}

/// Everything a plugin sees during one [`Plugin::run`].
pub struct PluginIo<'a> {
    /// Planar input ports, `frames` samples each.
    pub inputs: &'a [Vec<f32>],
    /// Planar output ports, to be fully written.
    pub outputs: &'a mut [Vec<f32>],
    /// Current value of each control port.
    pub controls: &'a [f32],
    events: &'a mut MessageReceiver,
    work: Option<&'a mut WorkScheduler>,
}

impl PluginIo<'_> {
    /// Next note event queued for this block.
    pub fn next_event(&mut self) -> Option<NoteEvent> {
        let mut bytes = [0u8; NoteEvent::ENCODED_LEN];
        let msg = self.events.read()?;
        msg.copy_to(&mut bytes);
        drop(msg);
        NoteEvent::decode(&bytes)
    }

    /// Hand blocking work to the non-realtime worker.
    pub fn schedule_work(&mut self, id: WorkId, payload: &[u8]) -> Result<(), ScheduleError> {
        match self.work.as_deref_mut() {
            Some(work) => work.schedule(id, payload),
            None => Err(ScheduleError::Full),
        }
    }
}

/// A running plugin instance.
pub trait Plugin: Send + 'static {
    fn info(&self) -> &PluginInfo;

    /// Called once before the first `run`.
    fn activate(&mut self) {}

    /// Called once before the instance is dropped.
    fn deactivate(&mut self) {}

    /// Process `frames` samples on every port.
    fn run(&mut self, io: PluginIo<'_>, frames: usize) -> Result<(), UnitError>;

    /// Write state beyond the control values.
    fn save(&self, _out: &mut dyn Write) -> Result<(), StateError> {
        Ok(())
    }

    /// Restore state written by [`save`](Self::save).
    fn load(&mut self, _data: &[u8]) -> Result<(), StateError> {
        Ok(())
    }
}

/// Creates instances of one plugin.
pub trait PluginFactory: Send + Sync {
    fn info(&self) -> PluginInfo;

    fn instantiate(
        &self,
        host: &mut PluginHost,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Presents a [`Plugin`] as a [`ProcessingUnit`].
pub struct PluginAdapter {
    plugin: Box<dyn Plugin>,
    params: Vec<ParamInfo>,
    controls: Vec<f32>,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
    events_tx: MessageSender,
    events_rx: MessageReceiver,
    block_size: usize,
}

impl PluginAdapter {
    /// Instantiate `factory` and wrap the instance.
    ///
    /// Errors are logged here and returned; they never reach the audio
    /// thread.
    pub fn instantiate(
        factory: &dyn PluginFactory,
        host: &mut PluginHost,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Self, PluginError> {
        let result = factory
            .instantiate(host, sample_rate, block_size)
            .and_then(|plugin| Self::new(plugin, block_size));
        match &result {
            Ok(adapter) => debug!(id = %adapter.plugin.info().id, "plugin instantiated"),
            Err(err) => error!(%err, "plugin instantiation failed"),
        }
        result
    }

    /// Wrap an instance, validating its ports and activating it.
    pub fn new(mut plugin: Box<dyn Plugin>, block_size: usize) -> Result<Self, PluginError> {
        let info = plugin.info();
        if info.audio_outputs == 0 {
            return Err(PluginError::PortLayout {
                id: info.id.clone(),
                inputs: info.audio_inputs,
                outputs: info.audio_outputs,
            });
        }
        if info.controls.len() > MAX_PARAMS {
            return Err(PluginError::TooManyControls {
                id: info.id.clone(),
                count: info.controls.len(),
                max: MAX_PARAMS,
            });
        }
        if let Some(port) = info.controls.iter().find(|p| !p.is_valid()) {
            return Err(PluginError::ControlRange { id: info.id.clone(), port: port.name.clone() });
        }

        let params: Vec<ParamInfo> = info
            .controls
            .iter()
            .map(|p| ParamInfo {
                name: Cow::Owned(p.name.clone()),
                min: p.min,
                max: p.max,
                default: p.default,
            })
            .collect();
        let controls = params.iter().map(|p| p.default).collect();
        let inputs = vec![vec![0.0; block_size]; info.audio_inputs];
        let outputs = vec![vec![0.0; block_size]; info.audio_outputs];
        let (events_tx, events_rx) = message_queue(NoteEvent::ENCODED_LEN, PLUGIN_EVENT_DEPTH);

        plugin.activate();
        Ok(Self { plugin, params, controls, inputs, outputs, events_tx, events_rx, block_size })
    }

    #[inline]
    pub fn info(&self) -> &PluginInfo {
        self.plugin.info()
    }
}

impl Drop for PluginAdapter {
    fn drop(&mut self) {
        self.plugin.deactivate();
    }
}

impl ProcessingUnit for PluginAdapter {
    fn id(&self) -> &str {
        &self.plugin.info().id
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        let frames = ctx.block_size.min(self.block_size);
        let stereo = match ctx.channels {
            1 => false,
            2 => true,
            // no port mapping for wider layouts
            _ => {
                output.fill(0.0);
                self.events_rx.clear();
                return Ok(());
            }
        };
        inputs.sum_into(output);
        if stereo {
            deinterleave_stereo(output, &mut self.inputs, frames);
        } else {
            for port in &mut self.inputs {
                port[..frames].copy_from_slice(&output[..frames]);
            }
        }

        let io = PluginIo {
            inputs: &self.inputs,
            outputs: &mut self.outputs,
            controls: &self.controls,
            events: &mut self.events_rx,
            work: ctx.work(),
        };
        let result = self.plugin.run(io, frames);
        // events the plugin did not read belong to this block only
        self.events_rx.clear();
        result?;

        output.fill(0.0);
        if stereo {
            interleave_stereo(&self.outputs, output, frames);
        } else if let [first, ..] = self.outputs.as_slice() {
            output[..frames].copy_from_slice(&first[..frames]);
        }
        Ok(())
    }

    fn note_event(&mut self, event: NoteEvent) {
        // a full buffer drops the event, like any other capacity error
        let _ = self.events_tx.post(&event.encode());
    }

    fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    fn param(&self, index: usize) -> f32 {
        self.controls.get(index).copied().unwrap_or(0.0)
    }

    fn set_param(&mut self, index: usize, value: f32) {
        if let (Some(control), Some(info)) = (self.controls.get_mut(index), self.params.get(index)) {
            *control = info.clamp(value);
        }
    }

    fn save_state(&self, out: &mut dyn Write) -> Result<(), StateError> {
        out.write_all(&[PLUGIN_STATE_VERSION, self.controls.len() as u8])?;
        for value in &self.controls {
            out.write_all(&value.to_le_bytes())?;
        }
        self.plugin.save(out)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let (&version, rest) = data.split_first().ok_or(StateError::Truncated)?;
        if version != PLUGIN_STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let (&count, rest) = rest.split_first().ok_or(StateError::Truncated)?;
        let count = count as usize;
        if count != self.controls.len() {
            return Err(StateError::ParamCount { expected: self.controls.len(), got: count });
        }
        if rest.len() < count * 4 {
            return Err(StateError::Truncated);
        }
        let (values, extra) = rest.split_at(count * 4);
        for (i, bytes) in values.chunks_exact(4).enumerate() {
            self.set_param(i, f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        self.plugin.load(extra)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::work::work_queue;

    /// Scales each input port by a `gain` control and counts note events.
    pub(crate) struct Amp {
        info: PluginInfo,
        pub(crate) notes: Arc<AtomicUsize>,
        pub(crate) active: Arc<AtomicUsize>,
        blob: Vec<u8>,
        work: Option<WorkId>,
    }

    pub(crate) fn amp_info(ports: usize) -> PluginInfo {
        PluginInfo {
            id: format!("test.amp{ports}"),
            name: "Amp".into(),
            audio_inputs: ports,
            audio_outputs: ports,
            controls: vec![ControlPort::new("gain", 0.0, 2.0, 1.0)],
        }
    }

    impl Amp {
        pub(crate) fn new(ports: usize) -> Self {
            Self {
                info: amp_info(ports),
                notes: Arc::default(),
                active: Arc::default(),
                blob: Vec::new(),
                work: None,
            }
        }
    }

    impl Plugin for Amp {
        fn info(&self) -> &PluginInfo {
            &self.info
        }

        fn activate(&mut self) {
            self.active.fetch_add(1, Ordering::Relaxed);
        }

        fn deactivate(&mut self) {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }

        fn run(&mut self, mut io: PluginIo<'_>, frames: usize) -> Result<(), UnitError> {
            while io.next_event().is_some() {
                self.notes.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(id) = self.work {
                io.schedule_work(id, b"amp").map_err(|_| UnitError::Inactive)?;
            }
            let gain = io.controls[0];
            for (out, input) in io.outputs.iter_mut().zip(io.inputs) {
                for i in 0..frames {
                    out[i] = input[i] * gain;
                }
            }
            Ok(())
        }

        fn save(&self, out: &mut dyn Write) -> Result<(), StateError> {
            out.write_all(&self.blob)?;
            Ok(())
        }

        fn load(&mut self, data: &[u8]) -> Result<(), StateError> {
            self.blob = data.to_vec();
            Ok(())
        }
    }

    pub(crate) struct AmpFactory(pub(crate) usize);

    impl PluginFactory for AmpFactory {
        fn info(&self) -> PluginInfo {
            amp_info(self.0)
        }

        fn instantiate(
            &self,
            host: &mut PluginHost,
            _sample_rate: u32,
            _block_size: usize,
        ) -> Result<Box<dyn Plugin>, PluginError> {
            host.map("urn:test:amp");
            Ok(Box::new(Amp::new(self.0)))
        }
    }

    struct Broken;

    impl PluginFactory for Broken {
        fn info(&self) -> PluginInfo {
            amp_info(1)
        }

        fn instantiate(
            &self,
            _host: &mut PluginHost,
            _sample_rate: u32,
            _block_size: usize,
        ) -> Result<Box<dyn Plugin>, PluginError> {
            Err(PluginError::Instantiate { id: "test.broken".into(), reason: "no library".into() })
        }
    }

    fn run(adapter: &mut PluginAdapter, input: Vec<f32>) -> Vec<f32> {
        let inputs = vec![input];
        let mut out = vec![9.0; 8];
        adapter
            .process(&mut ProcessContext::new(48_000, 4, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        out
    }

    #[test]
    fn mono_plugin_gets_the_downmix_on_both_sides() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(1)), 4).unwrap();
        let out = run(&mut adapter, vec![0.25, 0.5, 0.1, 0.2, 0.0, 0.0, 1.0, -1.0]);
        let expected = [0.75, 0.75, 0.3, 0.3, 0.0, 0.0, 0.0, 0.0];
        for (o, e) in out.iter().zip(expected) {
            assert!((o - e).abs() < 1e-6, "{out:?}");
        }
    }

    #[test]
    fn stereo_plugin_keeps_sides_apart() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(2)), 4).unwrap();
        adapter.set_param(0, 2.0);
        let out = run(&mut adapter, vec![0.25, 0.5, 0.1, 0.2, 0.0, 0.0, 1.0, -1.0]);
        assert_eq!(out, vec![0.5, 1.0, 0.2, 0.4, 0.0, 0.0, 2.0, -2.0]);
    }

    #[test]
    fn unsupported_port_count_is_silent() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(3)), 4).unwrap();
        let out = run(&mut adapter, vec![1.0; 8]);
        assert_eq!(out, vec![0.0; 8]);
    }

    #[test]
    fn wide_engine_layouts_are_silent() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(1)), 4).unwrap();
        let inputs = vec![vec![1.0; 16]];
        let mut out = vec![9.0; 16];
        adapter
            .process(&mut ProcessContext::new(48_000, 4, 4), Inputs::new(&inputs), &mut out)
            .unwrap();
        assert_eq!(out, vec![0.0; 16]);
    }

    #[test]
    fn mono_engine_feeds_every_port() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(1)), 4).unwrap();
        let inputs = vec![vec![0.5, -0.5, 0.25, 0.0]];
        let mut out = vec![9.0; 4];
        adapter
            .process(&mut ProcessContext::new(48_000, 4, 1), Inputs::new(&inputs), &mut out)
            .unwrap();
        assert_eq!(out, vec![0.5, -0.5, 0.25, 0.0]);
    }

    #[test]
    fn controls_become_clamped_params() {
        let mut adapter = PluginAdapter::new(Box::new(Amp::new(1)), 4).unwrap();
        assert_eq!(adapter.params().len(), 1);
        assert_eq!(adapter.params()[0].name, "gain");
        adapter.set_param(0, 10.0);
        assert_eq!(adapter.param(0), 2.0);
        adapter.set_param(5, 1.0);
        assert_eq!(adapter.param(5), 0.0);
    }

    #[test]
    fn note_events_reach_the_plugin() {
        let plugin = Amp::new(1);
        let notes = plugin.notes.clone();
        let mut adapter = PluginAdapter::new(Box::new(plugin), 4).unwrap();
        adapter.note_event(NoteEvent::note_on(60, 0.8));
        adapter.note_event(NoteEvent::note_off(60));
        run(&mut adapter, vec![0.0; 8]);
        assert_eq!(notes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn lifecycle_brackets_the_adapter() {
        let plugin = Amp::new(1);
        let active = plugin.active.clone();
        let adapter = PluginAdapter::new(Box::new(plugin), 4).unwrap();
        assert_eq!(active.load(Ordering::Relaxed), 1);
        drop(adapter);
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn state_round_trips_controls_and_plugin_data() {
        let mut plugin = Amp::new(1);
        plugin.blob = vec![7, 8, 9];
        let mut adapter = PluginAdapter::new(Box::new(plugin), 4).unwrap();
        adapter.set_param(0, 0.5);
        let mut state = Vec::new();
        adapter.save_state(&mut state).unwrap();
        assert_eq!(state[0], PLUGIN_STATE_VERSION);

        let mut other = PluginAdapter::new(Box::new(Amp::new(1)), 4).unwrap();
        other.load_state(&state).unwrap();
        assert_eq!(other.param(0), 0.5);
        let mut again = Vec::new();
        other.save_state(&mut again).unwrap();
        assert_eq!(again, state);

        assert!(matches!(other.load_state(&[0, 1]), Err(StateError::UnsupportedVersion(0))));
    }

    #[test]
    fn plugins_can_defer_work() {
        let (mut scheduler, mut runner) = work_queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let id = runner.register(move |payload| {
            assert_eq!(payload, b"amp");
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let mut plugin = Amp::new(1);
        plugin.work = Some(id);
        let mut adapter = PluginAdapter::new(Box::new(plugin), 4).unwrap();

        let inputs = vec![vec![0.0; 8]];
        let mut out = vec![0.0; 8];
        let mut ctx = ProcessContext::new(48_000, 4, 2).with_work(&mut scheduler);
        adapter.process(&mut ctx, Inputs::new(&inputs), &mut out).unwrap();
        assert_eq!(runner.run(), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn instantiation_errors_stay_on_the_control_side() {
        let mut host = PluginHost::new();
        let err = PluginAdapter::instantiate(&Broken, &mut host, 48_000, 64).err().unwrap();
        assert!(matches!(err, PluginError::Instantiate { .. }));

        let adapter = PluginAdapter::instantiate(&AmpFactory(2), &mut host, 48_000, 64).unwrap();
        assert_eq!(adapter.id(), "test.amp2");
        assert_eq!(host.uris().len(), 1);
    }

    #[test]
    fn bad_control_ranges_are_rejected() {
        let mut plugin = Amp::new(1);
        plugin.info.controls[0] = ControlPort::new("gain", 1.0, 0.0, 0.5);
        let err = PluginAdapter::new(Box::new(plugin), 4).err().unwrap();
        assert!(matches!(err, PluginError::ControlRange { port, .. } if port == "gain"));

        let mut plugin = Amp::new(1);
        plugin.info.audio_outputs = 0;
        assert!(matches!(
            PluginAdapter::new(Box::new(plugin), 4),
            Err(PluginError::PortLayout { outputs: 0, .. })
        ));
    }

    #[test]
    fn uri_map_is_stable_and_reversible() {
        let mut map = UriMap::new();
        let a = map.map("urn:a");
        let b = map.map("urn:b");
        assert_ne!(a, b);
        assert_eq!(map.map("urn:a"), a);
        assert_eq!(map.unmap(b), Some("urn:b"));
        assert_eq!(map.unmap(Urid(0)), None);
        assert_ne!(a.get(), 0);
    }
}
