//! trackcore - real-time audio core for a multitrack sequencer
//!
//! Design principles:
//! - One [`Engine`] tick renders one fixed-size block on the audio thread
//! - Units live in an arena [`Graph`](graph::Graph) and are linked by id
//! - Control data crosses threads through SPSC queues and mailboxes only
//! - The audio thread never waits on a lock and never frees memory
//! - Devices pull finished samples from a ring buffer
//!
//! ```
//! use trackcore::engine::{Command, Engine};
//! use trackcore::sequencer::Pattern;
//! use trackcore::EngineConfig;
//!
//! let (mut engine, mut handle, mut output) = Engine::new(EngineConfig::default()).unwrap();
//!
//! let (channel, nodes) = handle.new_channel("lead", 16, "synth.waveform").unwrap();
//! handle.send(Command::InsertChannel { index: 0, channel, nodes }).unwrap();
//!
//! let pattern: Pattern = [trackcore::sequencer::Note::new(0.0, 57, 1.0)].into_iter().collect();
//! handle.send(Command::ReplacePattern { channel: 0, index: 0, pattern }).unwrap();
//! handle.send(Command::SetBar { channel: 0, bar: 0, pattern: Some(0) }).unwrap();
//! handle.play().unwrap();
//!
//! engine.fill();
//! let mut samples = vec![0.0; 1024];
//! output.read_or_silence(&mut samples);
//! handle.collect();
//! ```

pub mod config;
#[cfg(feature = "cpal_sink")]
pub mod device;
pub mod document;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod mailbox;
pub mod node;
pub mod nodes;
pub mod plugin;
pub mod queue;
pub mod registry;
pub mod ring;
pub mod sequencer;
pub mod work;

pub use config::EngineConfig;
pub use document::Document;
pub use engine::{Command, Engine, EngineHandle, ExportProgress, Exporter};
pub use error::{
    ConfigError, DocumentError, EngineError, GraphError, PluginError, PostError, ScheduleError,
    SongError, StateError, UnitError,
};
pub use node::{Inputs, NodeId, NodeIds, NoteEvent, ParamInfo, ProcessContext, ProcessingUnit};
