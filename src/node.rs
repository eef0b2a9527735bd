//! Core unit trait and the types that flow through it.

use std::borrow::Cow;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{ScheduleError, StateError, UnitError};
use crate::work::{WorkId, WorkScheduler};

/// Information available during audio processing.
///
/// Built fresh for every [`ProcessingUnit::process`] call. All buffers a unit
/// sees are interleaved and hold `block_size * channels` samples.
pub struct ProcessContext<'a> {
    /// Sample rate of the engine in Hz.
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    /// Interleaved channel count.
    pub channels: usize,
    pub(crate) work: Option<&'a mut WorkScheduler>,
}

impl<'a> ProcessContext<'a> {
    pub fn new(sample_rate: u32, block_size: usize, channels: usize) -> Self {
        Self { sample_rate, block_size, channels, work: None }
    }

    /// Attach a deferred-work scheduler for units that need to hand off
    /// blocking work.
    pub fn with_work(mut self, work: &'a mut WorkScheduler) -> Self {
        self.work = Some(work);
        self
    }

    /// Samples in one interleaved block.
    #[inline]
    pub fn block_len(&self) -> usize {
        self.block_size * self.channels
    }

    /// Hand `payload` to the non-realtime worker.
    ///
    /// Returns [`ScheduleError::Full`] when no scheduler is attached, so units
    /// treat a missing worker like a busy one.
    pub fn schedule_work(&mut self, id: WorkId, payload: &[u8]) -> Result<(), ScheduleError> {
        match self.work.as_deref_mut() {
            Some(work) => work.schedule(id, payload),
            None => Err(ScheduleError::Full),
        }
    }

    pub(crate) fn work(&mut self) -> Option<&mut WorkScheduler> {
        self.work.as_deref_mut()
    }
}

/// Stable identifier of a node within an engine.
///
/// Ids are never reused, so a stale id simply stops resolving once its node
/// is removed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Id allocator shared by every graph an engine builds, so nodes created for a
/// replacement document never collide with live ones.
#[derive(Clone, Debug, Default)]
pub struct NodeIds(Arc<AtomicU32>);

impl NodeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> NodeId {
        NodeId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether a note starts or ends.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NoteEventKind {
    NoteOn,
    NoteOff,
}

/// A note event delivered to a unit before its next `process` call.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct NoteEvent {
    pub kind: NoteEventKind,
    pub key: u8,
    /// 0.0..=1.0, ignored for note-off.
    pub volume: f32,
}

impl NoteEvent {
    /// Size of the wire encoding.
    pub const ENCODED_LEN: usize = 3;

    pub fn note_on(key: u8, volume: f32) -> Self {
        Self { kind: NoteEventKind::NoteOn, key, volume }
    }

    pub fn note_off(key: u8) -> Self {
        Self { kind: NoteEventKind::NoteOff, key, volume: 0.0 }
    }

    /// Encode as a MIDI channel-1 note message.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let key = self.key & 0x7f;
        match self.kind {
            NoteEventKind::NoteOn => {
                let velocity = (self.volume.clamp(0.0, 1.0) * 127.0).round() as u8;
                [0x90, key, velocity]
            }
            NoteEventKind::NoteOff => [0x80, key, 0],
        }
    }

    /// Decode a MIDI note message. Other status bytes are ignored.
    ///
    /// A note-on with zero velocity decodes as note-off, as in MIDI.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let [status, key, velocity] = *bytes.get(..Self::ENCODED_LEN)? else {
            return None;
        };
        match status & 0xf0 {
            0x90 if velocity > 0 => Some(Self::note_on(key & 0x7f, velocity as f32 / 127.0)),
            0x80 | 0x90 => Some(Self::note_off(key & 0x7f)),
            _ => None,
        }
    }
}

/// Maximum number of parameters a unit can expose through its mailbox.
pub const MAX_PARAMS: usize = 32;

/// Description of one automatable parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamInfo {
    pub name: Cow<'static, str>,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ParamInfo {
    pub const fn new(name: &'static str, min: f32, max: f32, default: f32) -> Self {
        Self { name: Cow::Borrowed(name), min, max, default }
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// A full set of parameter values, posted through a node's mailbox.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamSnapshot {
    values: [f32; MAX_PARAMS],
    len: usize,
}

impl ParamSnapshot {
    /// Capture the current values of `unit`.
    pub fn of(unit: &dyn ProcessingUnit) -> Self {
        let len = unit.params().len().min(MAX_PARAMS);
        let mut values = [0.0; MAX_PARAMS];
        for (i, value) in values.iter_mut().enumerate().take(len) {
            *value = unit.param(i);
        }
        Self { values, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.as_slice().get(index).copied()
    }

    /// Set one value. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, value: f32) {
        if index < self.len {
            self.values[index] = value;
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values[..self.len]
    }
}

/// Read-only view of a node's scratch inputs, one interleaved buffer per
/// upstream node, in connection order.
#[derive(Clone, Copy)]
pub struct Inputs<'a> {
    buffers: &'a [Vec<f32>],
}

impl<'a> Inputs<'a> {
    pub fn new(buffers: &'a [Vec<f32>]) -> Self {
        Self { buffers }
    }

    /// No inputs, for sources.
    pub fn none() -> Self {
        Self { buffers: &[] }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&'a [f32]> {
        self.buffers.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [f32]> + 'a {
        self.buffers.iter().map(Vec::as_slice)
    }

    /// Overwrite `out` with the sample-wise sum of all inputs.
    pub fn sum_into(&self, out: &mut [f32]) {
        out.fill(0.0);
        for input in self.iter() {
            for (o, i) in out.iter_mut().zip(input) {
                *o += *i;
            }
        }
    }
}

/// Version byte written first by the default parameter state encoding.
pub const STATE_VERSION: u8 = 0;

/// The capability every graph node's payload implements.
///
/// A unit is a built-in effect, a built-in synthesizer, or a
/// [`PluginAdapter`](crate::plugin::PluginAdapter) around an external plugin.
/// The graph calls [`process`](Self::process) exactly once per block after
/// delivering any queued note events and parameter changes.
///
/// # Example
///
/// ```
/// use trackcore::{Inputs, ParamInfo, ProcessContext, ProcessingUnit, UnitError};
///
/// static PARAMS: [ParamInfo; 1] = [ParamInfo::new("level", 0.0, 1.0, 0.5)];
///
/// struct Dc {
///     level: f32,
/// }
///
/// impl ProcessingUnit for Dc {
///     fn id(&self) -> &str {
///         "example.dc"
///     }
///
///     fn process(
///         &mut self,
///         _ctx: &mut ProcessContext<'_>,
///         _inputs: Inputs<'_>,
///         output: &mut [f32],
///     ) -> Result<(), UnitError> {
///         output.fill(self.level);
///         Ok(())
///     }
///
///     fn params(&self) -> &[ParamInfo] {
///         &PARAMS
///     }
///
///     fn param(&self, _index: usize) -> f32 {
///         self.level
///     }
///
///     fn set_param(&mut self, _index: usize, value: f32) {
///         self.level = PARAMS[0].clamp(value);
///     }
/// }
/// ```
pub trait ProcessingUnit: Send + 'static {
    /// Registry id, written to documents so the unit can be recreated.
    fn id(&self) -> &str;

    /// Process one block.
    ///
    /// `output` arrives with stale contents and must be fully written. An
    /// `Err` silences the node for this block and is reported asynchronously;
    /// it never aborts the tick.
    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError>;

    /// Accept a note event. Units that are not instruments ignore it.
    fn note_event(&mut self, _event: NoteEvent) {}

    /// Parameters exposed for automation and persistence.
    fn params(&self) -> &[ParamInfo] {
        &[]
    }

    fn param(&self, _index: usize) -> f32 {
        0.0
    }

    fn set_param(&mut self, _index: usize, _value: f32) {}

    /// Clear internal state such as delay tails and voices.
    fn reset(&mut self) {}

    /// Write persistent state, starting with a version byte.
    ///
    /// The default encoding is `[STATE_VERSION, count, count × f32 LE]` of the
    /// unit's parameters.
    fn save_state(&self, out: &mut dyn Write) -> Result<(), StateError> {
        let count = self.params().len().min(MAX_PARAMS);
        out.write_all(&[STATE_VERSION, count as u8])?;
        for i in 0..count {
            out.write_all(&self.param(i).to_le_bytes())?;
        }
        Ok(())
    }

    /// Restore state written by [`save_state`](Self::save_state).
    fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let values = read_param_state(data)?;
        let expected = self.params().len().min(MAX_PARAMS);
        if values.len() != expected {
            return Err(StateError::ParamCount { expected, got: values.len() });
        }
        for (i, value) in values.as_slice().iter().enumerate() {
            self.set_param(i, *value);
        }
        Ok(())
    }
}

/// Decode the default parameter state encoding.
pub fn read_param_state(data: &[u8]) -> Result<ParamSnapshot, StateError> {
    let (&version, rest) = data.split_first().ok_or(StateError::Truncated)?;
    if version != STATE_VERSION {
        return Err(StateError::UnsupportedVersion(version));
    }
    let (&count, rest) = rest.split_first().ok_or(StateError::Truncated)?;
    let count = count as usize;
    if count > MAX_PARAMS || rest.len() < count * 4 {
        return Err(StateError::Truncated);
    }

    let mut values = [0.0; MAX_PARAMS];
    for (value, bytes) in values.iter_mut().zip(rest.chunks_exact(4)).take(count) {
        *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(ParamSnapshot { values, len: count })
}
