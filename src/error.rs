//! Error types.
//!
//! Every fallible operation in the crate returns one of these. Capacity
//! errors ([`PostError`], [`ScheduleError`]) are expected in normal operation
//! and are cheap to construct on the audio thread; the rest only ever occur on
//! the control side.

use thiserror::Error;

use crate::node::NodeId;

/// Why a [`MessageSender::post`](crate::queue::MessageSender::post) was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("payload of {size} bytes exceeds the queue maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("queue is full")]
    Full,
}

/// Why a deferred work request was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("work payload of {size} bytes exceeds the inline capacity of {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("work queue is full")]
    Full,
}

/// Topology errors raised by [`Graph`](crate::graph::Graph) mutators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {0:?} is not part of this graph")]
    UnknownNode(NodeId),
    #[error("connecting {from:?} to {to:?} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
    #[error("no spare scratch buffer for another connection")]
    NoSpareBuffer,
    #[error("node {0:?} cannot take another input")]
    TooManyInputs(NodeId),
    #[error("graph has no room for another node")]
    Full,
}

/// A processing unit could not produce valid output for a block.
///
/// The executor silences the node's output and reports the error
/// asynchronously; it never aborts the tick.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnitError {
    #[error("unit expected {expected} input channels, got {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("unit produced a non-finite sample")]
    NonFinite,
    #[error("unit is not active")]
    Inactive,
}

/// Errors from a unit's `save_state` / `load_state`.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u8),
    #[error("state blob is truncated")]
    Truncated,
    #[error("state blob holds {got} values, unit has {expected} parameters")]
    ParamCount { expected: usize, got: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Plugin instantiation and configuration errors.
///
/// These are fatal to the creation of one unit only and are surfaced to the
/// control context.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin `{0}` not found")]
    NotFound(String),
    #[error("failed to instantiate plugin `{id}`: {reason}")]
    Instantiate { id: String, reason: String },
    #[error("plugin `{id}` has an unsupported port layout: {inputs} in, {outputs} out")]
    PortLayout { id: String, inputs: usize, outputs: usize },
    #[error("plugin `{id}` control port `{port}` has an invalid range")]
    ControlRange { id: String, port: String },
    #[error("plugin `{id}` has {count} control ports, at most {max} are supported")]
    TooManyControls { id: String, count: usize, max: usize },
}

/// Song and channel edits that refer to something that does not exist or do
/// not fit.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SongError {
    #[error("no channel at index {0}")]
    Channel(usize),
    #[error("no pattern at index {0}")]
    Pattern(usize),
    #[error("no effect at index {0}")]
    Effect(usize),
    #[error("bar {0} is outside the song")]
    Bar(usize),
    #[error("a song needs at least one bar")]
    Empty,
    #[error("no room for another {0} without allocating")]
    Capacity(&'static str),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors while encoding or decoding a [`Document`](crate::document::Document).
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("not a song document")]
    BadMagic,
    #[error("unsupported document version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown unit id `{0}`")]
    UnknownUnit(String),
    #[error("document is malformed: {0}")]
    Malformed(&'static str),
    #[error("unit `{id}` rejected its saved state")]
    UnitState {
        id: String,
        #[source]
        source: StateError,
    },
    #[error("node {node:?} could not save its state")]
    SaveState {
        node: NodeId,
        #[source]
        source: StateError,
    },
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Song(#[from] SongError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invalid [`EngineConfig`](crate::config::EngineConfig) values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{field}` must be non-zero")]
    Zero { field: &'static str },
    #[error("channel count {0} is not supported (1 or 2)")]
    Channels(usize),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failures opening an output device.
#[cfg(feature = "cpal_sink")]
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device sample format {0} is not supported")]
    SampleFormat(String),
    #[error(transparent)]
    Build(#[from] cpal::BuildStreamError),
    #[error(transparent)]
    Play(#[from] cpal::PlayStreamError),
}

/// Errors surfaced by [`EngineHandle`](crate::engine::EngineHandle).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("command queue is full")]
    CommandQueueFull,
    #[error("engine has been dropped")]
    Disconnected,
    #[error(transparent)]
    Config(#[from] ConfigError),
}
