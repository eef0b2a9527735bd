//! The engine: one tick per block on the audio thread, driven by commands
//! from a control thread.
//!
//! [`Engine::new`] returns three pieces:
//!
//! * [`Engine`] lives on the audio thread. [`Engine::tick`] renders one block
//!   into the output ring; [`Engine::fill`] ticks until the ring is full.
//! * [`EngineHandle`] lives on the control thread. It sends [`Command`]s,
//!   stages replacement documents, and collects whatever the audio side hands
//!   back: retired objects, diagnostics, and finished snapshots.
//! * A [`SampleConsumer`] for the device, which pulls interleaved samples.
//!
//! Nothing on the audio side waits for the control side. The only lock is the
//! document slot, which the audio thread only ever `try_lock`s. Objects the
//! audio thread is done with travel back over the retire queue so they are
//! freed on the control thread.
//!
//! ```
//! use trackcore::engine::{Command, Engine};
//! use trackcore::EngineConfig;
//!
//! let (mut engine, mut handle, mut output) = Engine::new(EngineConfig::default()).unwrap();
//! handle.send(Command::SetTempo(140.0)).unwrap();
//! engine.fill();
//!
//! let mut block = vec![0.0; 512];
//! output.read_or_silence(&mut block);
//! handle.collect();
//! ```

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::document::Document;
use crate::error::{DocumentError, EngineError, GraphError, PluginError, SongError, UnitError};
use crate::graph::{GraphNode, NodeBuilder, NodeHandle, Target};
use crate::mailbox::{mailbox, MailboxReader, MailboxWriter};
use crate::node::{NodeId, NodeIds, NoteEvent, ProcessContext, ProcessingUnit};
use crate::plugin::PluginHost;
use crate::queue::{message_queue, MessageReceiver, MessageSender};
use crate::registry::UnitRegistry;
use crate::ring::{sample_ring, SampleConsumer, SampleProducer};
use crate::sequencer::{Channel, ChannelNodes, Pattern};
use crate::work::{work_queue, WorkRunner, WorkScheduler};

/// The one lock shared by both sides: a document waiting to be swapped in.
pub type DocumentSlot = Arc<Mutex<Option<Box<Document>>>>;

/// A change to the live document, applied at the start of the next tick.
///
/// Everything a command carries was allocated on the control thread; the
/// audio thread only moves it into place.
#[allow(clippy::large_enum_variant)]
pub enum Command {
    Play,
    Stop,
    /// Move the playhead to the start of a bar.
    Seek(usize),
    SetTempo(f32),
    SetLooping(bool),
    SetBeatsPerBar(u32),
    /// Set a parameter on any node in the graph.
    SetParam { node: NodeId, index: usize, value: f32 },
    /// Deliver a note event straight to a node.
    Note { node: NodeId, event: NoteEvent },
    SetMute { channel: usize, mute: bool },
    SetSolo { channel: usize, solo: bool },
    SetVolume { channel: usize, volume: f32 },
    SetPan { channel: usize, pan: f32 },
    SetBar { channel: usize, bar: usize, pattern: Option<usize> },
    ReplacePattern { channel: usize, index: usize, pattern: Pattern },
    InsertEffect { channel: usize, index: usize, node: GraphNode, handle: NodeHandle },
    RemoveEffect { channel: usize, index: usize },
    InsertChannel { index: usize, channel: Box<Channel>, nodes: ChannelNodes },
    RemoveChannel(usize),
    InsertBar(usize),
    RemoveBar(usize),
    Connect { from: NodeId, to: Target },
    Disconnect(NodeId),
    InsertNode(GraphNode),
    RemoveNode(NodeId),
    /// Serialize the live document into this buffer after the next block.
    Snapshot(Box<[u8]>),
}

static COMMAND_NAMES: [&str; 25] = [
    "play",
    "stop",
    "seek",
    "set_tempo",
    "set_looping",
    "set_beats_per_bar",
    "set_param",
    "note",
    "set_mute",
    "set_solo",
    "set_volume",
    "set_pan",
    "set_bar",
    "replace_pattern",
    "insert_effect",
    "remove_effect",
    "insert_channel",
    "remove_channel",
    "insert_bar",
    "remove_bar",
    "connect",
    "disconnect",
    "insert_node",
    "remove_node",
    "snapshot",
];

impl Command {
    fn code(&self) -> u8 {
        match self {
            Command::Play => 0,
            Command::Stop => 1,
            Command::Seek(_) => 2,
            Command::SetTempo(_) => 3,
            Command::SetLooping(_) => 4,
            Command::SetBeatsPerBar(_) => 5,
            Command::SetParam { .. } => 6,
            Command::Note { .. } => 7,
            Command::SetMute { .. } => 8,
            Command::SetSolo { .. } => 9,
            Command::SetVolume { .. } => 10,
            Command::SetPan { .. } => 11,
            Command::SetBar { .. } => 12,
            Command::ReplacePattern { .. } => 13,
            Command::InsertEffect { .. } => 14,
            Command::RemoveEffect { .. } => 15,
            Command::InsertChannel { .. } => 16,
            Command::RemoveChannel(_) => 17,
            Command::InsertBar(_) => 18,
            Command::RemoveBar(_) => 19,
            Command::Connect { .. } => 20,
            Command::Disconnect(_) => 21,
            Command::InsertNode(_) => 22,
            Command::RemoveNode(_) => 23,
            Command::Snapshot(_) => 24,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        COMMAND_NAMES[self.code() as usize]
    }
}

/// Something the audio thread no longer needs, returned to be dropped or
/// reused on the control thread.
pub enum Retired {
    /// A document replaced by a staged one.
    Document(Box<Document>),
    Node(GraphNode),
    Handle(NodeHandle),
    Channel(Box<Channel>),
    Pattern(Pattern),
    /// A snapshot buffer; `len` is the document's size, or `None` if it did
    /// not fit.
    Snapshot { buffer: Box<[u8]>, len: Option<usize> },
}

/// Something the audio thread noticed, reported asynchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A unit's `process` failed and its output was silenced for a block.
    UnitFailed { node: NodeId, error: UnitError },
    /// Note events the sequencer could not queue since the last report.
    EventsDropped { count: u32 },
    /// The retire queue was full and an object was dropped on the audio
    /// thread.
    RetireOverflow,
    /// A command referred to something that does not exist or did not fit.
    CommandRejected { command: &'static str },
    /// A snapshot buffer was too small for the document.
    SnapshotFailed,
}

const DIAGNOSTIC_LEN: usize = 9;

impl Diagnostic {
    /// `[tag u8][a u32][b u16][c u16]`, little-endian.
    fn encode(&self) -> [u8; DIAGNOSTIC_LEN] {
        let (tag, a, b, c): (u8, u32, u16, u16) = match *self {
            Diagnostic::UnitFailed { node, error } => match error {
                UnitError::NonFinite => (1, node.index(), 0, 0),
                UnitError::Inactive => (2, node.index(), 0, 0),
                UnitError::ChannelMismatch { expected, got } => {
                    (3, node.index(), expected as u16, got as u16)
                }
            },
            Diagnostic::EventsDropped { count } => (4, count, 0, 0),
            Diagnostic::RetireOverflow => (5, 0, 0, 0),
            Diagnostic::CommandRejected { command } => {
                let code = COMMAND_NAMES.iter().position(|n| *n == command).unwrap_or(0);
                (6, 0, code as u16, 0)
            }
            Diagnostic::SnapshotFailed => (7, 0, 0, 0),
        };
        let mut out = [0; DIAGNOSTIC_LEN];
        out[0] = tag;
        out[1..5].copy_from_slice(&a.to_le_bytes());
        out[5..7].copy_from_slice(&b.to_le_bytes());
        out[7..9].copy_from_slice(&c.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DIAGNOSTIC_LEN {
            return None;
        }
        let a = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let b = u16::from_le_bytes([bytes[5], bytes[6]]);
        let c = u16::from_le_bytes([bytes[7], bytes[8]]);
        let node = NodeId(a);
        Some(match bytes[0] {
            1 => Diagnostic::UnitFailed { node, error: UnitError::NonFinite },
            2 => Diagnostic::UnitFailed { node, error: UnitError::Inactive },
            3 => Diagnostic::UnitFailed {
                node,
                error: UnitError::ChannelMismatch { expected: b as usize, got: c as usize },
            },
            4 => Diagnostic::EventsDropped { count: a },
            5 => Diagnostic::RetireOverflow,
            6 => Diagnostic::CommandRejected { command: COMMAND_NAMES.get(b as usize)? },
            7 => Diagnostic::SnapshotFailed,
            _ => return None,
        })
    }

    fn log(&self) {
        match self {
            Diagnostic::UnitFailed { node, error } => {
                warn!(node = node.index(), %error, "unit failed, output silenced")
            }
            Diagnostic::EventsDropped { count } => warn!(count, "note events dropped"),
            Diagnostic::RetireOverflow => {
                error!("retire queue overflowed, object dropped on the audio thread")
            }
            Diagnostic::CommandRejected { command } => warn!(command, "command rejected"),
            Diagnostic::SnapshotFailed => warn!("snapshot buffer too small"),
        }
    }
}

/// Playhead state published by the audio thread after every tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Transport {
    pub playing: bool,
    pub bar: usize,
    /// Beats from the start of the song.
    pub position: f64,
}

/// Audio-to-control traffic: retired objects and diagnostics.
struct Outbox {
    retired: Producer<Retired>,
    diagnostics: MessageSender,
    transport: MailboxWriter<Transport>,
}

impl Outbox {
    fn retire(&mut self, object: Retired) {
        if let Err(PushError::Full(object)) = self.retired.push(object) {
            self.report(Diagnostic::RetireOverflow);
            drop(object);
        }
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        // a full diagnostics queue loses the report, nothing else
        let _ = self.diagnostics.post(&diagnostic.encode());
    }

    fn reject(&mut self, code: u8) {
        let command = COMMAND_NAMES[code as usize];
        self.report(Diagnostic::CommandRejected { command });
    }
}

/// The audio-thread half.
pub struct Engine {
    config: EngineConfig,
    document: Box<Document>,
    slot: DocumentSlot,
    commands: Consumer<Command>,
    outbox: Outbox,
    output: SampleProducer<f32>,
    block: Vec<f32>,
    work: WorkScheduler,
    cancel: Arc<AtomicBool>,
    cancelled: bool,
    snapshot: Option<Box<[u8]>>,
    reported_drops: u64,
    ticks: u64,
}

impl Engine {
    /// Build an engine with an empty document.
    pub fn new(
        config: EngineConfig,
    ) -> Result<(Engine, EngineHandle, SampleConsumer<f32>), EngineError> {
        config.validate()?;

        let ids = NodeIds::new();
        let (command_tx, command_rx) = RingBuffer::new(config.command_queue_depth);
        let (retire_tx, retire_rx) = RingBuffer::new(config.retire_queue_depth);
        let (diag_tx, diag_rx) = message_queue(DIAGNOSTIC_LEN, config.diagnostics_depth);
        let (transport_tx, transport_rx) = mailbox(Transport::default());
        let (output_tx, output_rx) = sample_ring(config.output_buffer_blocks * config.block_len());
        let (scheduler, runner) = work_queue();
        let slot = DocumentSlot::default();
        let cancel = Arc::new(AtomicBool::new(false));

        let engine = Engine {
            document: Box::new(Document::new("untitled", &config, ids.clone())),
            slot: slot.clone(),
            commands: command_rx,
            outbox: Outbox { retired: retire_tx, diagnostics: diag_tx, transport: transport_tx },
            output: output_tx,
            block: vec![0.0; config.block_len()],
            work: scheduler,
            cancel: cancel.clone(),
            cancelled: false,
            snapshot: None,
            reported_drops: 0,
            ticks: 0,
            config: config.clone(),
        };
        let handle = EngineHandle {
            commands: command_tx,
            retired: retire_rx,
            diagnostics: diag_rx,
            transport: transport_rx,
            last_transport: Transport::default(),
            slot,
            cancel,
            ids,
            host: PluginHost::new(),
            registry: UnitRegistry::with_builtins(),
            work: Some(runner),
            pending: Vec::new(),
            config,
        };
        info!(
            sample_rate = handle.config.sample_rate,
            block_size = handle.config.block_size,
            channels = handle.config.channels,
            "engine created"
        );
        Ok((engine, handle, output_rx))
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The live document. Only the audio thread may look at it.
    #[inline]
    pub fn document(&self) -> &Document {
        &self.document
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Blocks rendered so far.
    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Frames the live song plays for, start to end.
    pub fn song_frames(&self) -> u64 {
        (self.document.song.duration_seconds() * self.config.sample_rate as f64).ceil() as u64
    }

    /// Render one block and push it to the output ring.
    ///
    /// Returns `false` once the engine is cancelled. A block that does not
    /// fit in the ring is dropped; use [`fill`](Self::fill) to tick only when
    /// there is room.
    pub fn tick(&mut self) -> bool {
        let mut block = std::mem::take(&mut self.block);
        let running = self.tick_into(&mut block);
        if running {
            self.output.write_all(&block);
        }
        self.block = block;
        running
    }

    /// Tick while the output ring has room for a whole block, at most
    /// `max_catch_up_ticks` times. Returns the number of blocks rendered.
    pub fn fill(&mut self) -> usize {
        let block_len = self.config.block_len();
        let mut ticks = 0;
        while ticks < self.config.max_catch_up_ticks && self.output.free() >= block_len {
            if !self.tick() {
                break;
            }
            ticks += 1;
        }
        ticks
    }

    /// Render one block into `out`, which holds one interleaved block.
    ///
    /// Returns `false` without rendering once cancelled; `out` is then
    /// silent.
    pub fn tick_into(&mut self, out: &mut [f32]) -> bool {
        if self.cancelled || self.cancel.load(Ordering::Acquire) {
            self.cancelled = true;
            out.fill(0.0);
            return false;
        }

        self.swap_document();
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }

        let config = &self.config;
        let document = &mut *self.document;
        document.song.update(config.block_seconds());
        let mut ctx = ProcessContext::new(config.sample_rate, config.block_size, config.channels)
            .with_work(&mut self.work);
        document.graph.process(&mut ctx, out);

        for (node, error) in document.graph.take_failures() {
            self.outbox.report(Diagnostic::UnitFailed { node, error });
        }
        let dropped = document.song.dropped_events();
        if dropped > self.reported_drops {
            let count = (dropped - self.reported_drops).min(u32::MAX as u64) as u32;
            self.outbox.report(Diagnostic::EventsDropped { count });
            self.reported_drops = dropped;
        }
        self.outbox.transport.set(Transport {
            playing: document.song.is_playing(),
            bar: document.song.bar(),
            position: document.song.position(),
        });

        if let Some(buffer) = self.snapshot.take() {
            self.write_snapshot(buffer);
        }
        self.ticks += 1;
        true
    }

    /// Take a staged document if the control side is not holding the slot.
    fn swap_document(&mut self) {
        let Some(mut slot) = self.slot.try_lock() else {
            return;
        };
        let Some(document) = slot.take() else {
            return;
        };
        drop(slot);

        let old = std::mem::replace(&mut self.document, document);
        self.reported_drops = self.document.song.dropped_events();
        self.outbox.retire(Retired::Document(old));
    }

    fn write_snapshot(&mut self, mut buffer: Box<[u8]>) {
        let mut cursor = Cursor::new(&mut buffer[..]);
        let len = match self.document.save(&mut cursor) {
            Ok(()) => Some(cursor.position() as usize),
            Err(_) => {
                self.outbox.report(Diagnostic::SnapshotFailed);
                None
            }
        };
        self.outbox.retire(Retired::Snapshot { buffer, len });
    }

    fn apply(&mut self, command: Command) {
        let code = command.code();
        let outbox = &mut self.outbox;
        let Document { song, graph } = &mut *self.document;

        let result: Result<(), SongError> = match command {
            Command::Play => {
                song.play();
                Ok(())
            }
            Command::Stop => {
                song.stop();
                Ok(())
            }
            Command::Seek(bar) => song.seek(bar),
            Command::SetTempo(tempo) => {
                song.set_tempo(tempo);
                Ok(())
            }
            Command::SetLooping(looping) => {
                song.set_looping(looping);
                Ok(())
            }
            Command::SetBeatsPerBar(beats) => {
                song.set_beats_per_bar(beats);
                Ok(())
            }
            Command::SetParam { node, index, value } => match song.handle_mut(node) {
                // channel nodes keep their value in the handle's mailbox
                Some(handle) => {
                    handle.set_param(index, value);
                    Ok(())
                }
                None => graph
                    .node_mut(node)
                    .map(|n| n.unit_mut().set_param(index, value))
                    .ok_or(SongError::Graph(GraphError::UnknownNode(node))),
            },
            Command::Note { node, event } => match song.handle_mut(node) {
                Some(handle) => {
                    handle.events.send(event).map_err(|_| SongError::Capacity("event"))
                }
                None => graph
                    .node_mut(node)
                    .map(|n| n.unit_mut().note_event(event))
                    .ok_or(SongError::Graph(GraphError::UnknownNode(node))),
            },
            Command::SetMute { channel, mute } => song
                .channel_mut(channel)
                .map(|c| c.set_mute(mute))
                .ok_or(SongError::Channel(channel)),
            Command::SetSolo { channel, solo } => song
                .channel_mut(channel)
                .map(|c| c.set_solo(solo))
                .ok_or(SongError::Channel(channel)),
            Command::SetVolume { channel, volume } => song
                .channel_mut(channel)
                .map(|c| c.set_volume(volume))
                .ok_or(SongError::Channel(channel)),
            Command::SetPan { channel, pan } => song
                .channel_mut(channel)
                .map(|c| c.set_pan(pan))
                .ok_or(SongError::Channel(channel)),
            Command::SetBar { channel, bar, pattern } => song
                .channel_mut(channel)
                .ok_or(SongError::Channel(channel))
                .and_then(|c| c.set_bar(bar, pattern)),
            Command::ReplacePattern { channel, index, pattern } => {
                match song.channel_mut(channel) {
                    Some(c) if c.pattern(index).is_some() => {
                        let old = c.replace_pattern(index, pattern);
                        old.map(|old| outbox.retire(Retired::Pattern(old)))
                    }
                    found => {
                        outbox.retire(Retired::Pattern(pattern));
                        Err(match found {
                            Some(_) => SongError::Pattern(index),
                            None => SongError::Channel(channel),
                        })
                    }
                }
            }
            Command::InsertEffect { channel, index, node, handle } => {
                let check = song
                    .channel(channel)
                    .ok_or(SongError::Channel(channel))
                    .and_then(|c| c.check_effect_slot(graph, index));
                match check {
                    Ok(()) => song
                        .channel_mut(channel)
                        .ok_or(SongError::Channel(channel))
                        .and_then(|c| c.insert_effect(graph, index, node, handle)),
                    Err(err) => {
                        outbox.retire(Retired::Node(node));
                        outbox.retire(Retired::Handle(handle));
                        Err(err)
                    }
                }
            }
            Command::RemoveEffect { channel, index } => song
                .channel_mut(channel)
                .ok_or(SongError::Channel(channel))
                .and_then(|c| c.remove_effect(graph, index))
                .map(|(node, handle)| {
                    outbox.retire(Retired::Node(node));
                    outbox.retire(Retired::Handle(handle));
                }),
            Command::InsertChannel { index, channel, nodes } => {
                match song.check_channel_slot(graph, index, &channel) {
                    Ok(()) => song.insert_channel(graph, index, channel, nodes),
                    Err(err) => {
                        outbox.retire(Retired::Channel(channel));
                        outbox.retire(Retired::Node(nodes.instrument));
                        outbox.retire(Retired::Node(nodes.volume));
                        Err(err)
                    }
                }
            }
            Command::RemoveChannel(index) => song
                .remove_channel(graph, index, |node| outbox.retire(Retired::Node(node)))
                .map(|channel| outbox.retire(Retired::Channel(channel))),
            Command::InsertBar(at) => {
                if song.has_bar_capacity() {
                    song.insert_bar(at)
                } else {
                    Err(SongError::Capacity("bar"))
                }
            }
            Command::RemoveBar(at) => song.remove_bar(at),
            Command::Connect { from, to } => graph.connect(from, to).map_err(SongError::from),
            Command::Disconnect(id) => graph.disconnect(id).map_err(SongError::from),
            Command::InsertNode(node) => {
                if graph.can_insert(&node) {
                    graph.insert(node);
                    Ok(())
                } else {
                    outbox.retire(Retired::Node(node));
                    Err(GraphError::Full.into())
                }
            }
            Command::RemoveNode(id) => graph
                .remove(id)
                .map(|node| outbox.retire(Retired::Node(node)))
                .map_err(SongError::from),
            Command::Snapshot(buffer) => {
                if let Some(previous) = self.snapshot.replace(buffer) {
                    outbox.retire(Retired::Snapshot { buffer: previous, len: None });
                }
                Ok(())
            }
        };

        if result.is_err() {
            outbox.reject(code);
        }
    }
}

/// The control-thread half.
pub struct EngineHandle {
    config: EngineConfig,
    commands: Producer<Command>,
    retired: Consumer<Retired>,
    diagnostics: MessageReceiver,
    transport: MailboxReader<Transport>,
    last_transport: Transport,
    slot: DocumentSlot,
    cancel: Arc<AtomicBool>,
    ids: NodeIds,
    host: PluginHost,
    registry: UnitRegistry,
    work: Option<WorkRunner>,
    pending: Vec<Diagnostic>,
}

impl EngineHandle {
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue `command` for the next tick.
    pub fn send(&mut self, command: Command) -> Result<(), EngineError> {
        if self.commands.is_abandoned() {
            return Err(EngineError::Disconnected);
        }
        self.commands.push(command).map_err(|PushError::Full(command)| {
            debug!(command = command.name(), "command queue full");
            EngineError::CommandQueueFull
        })
    }

    pub fn play(&mut self) -> Result<(), EngineError> {
        self.send(Command::Play)
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.send(Command::Stop)
    }

    /// Place a fully built document in the slot. The audio thread swaps it
    /// in at its next tick; a document staged earlier and not yet taken is
    /// dropped here.
    pub fn stage_document(&mut self, document: Document) {
        let replaced = self.slot.lock().replace(Box::new(document));
        if replaced.is_some() {
            debug!("staged document replaced before the engine took it");
        }
    }

    /// Read a document and stage it. The live document keeps playing if
    /// loading fails.
    pub fn load_document<R: std::io::Read>(&mut self, r: &mut R) -> Result<(), DocumentError> {
        let document =
            Document::load(r, &self.registry, &mut self.host, &self.config, self.ids.clone())?;
        self.stage_document(document);
        Ok(())
    }

    /// An empty document whose node ids cannot collide with the live one.
    pub fn new_document(&self, name: impl Into<String>) -> Document {
        Document::new(name, &self.config, self.ids.clone())
    }

    /// Ask for a copy of the live document, returned by
    /// [`collect`](Self::collect) as [`Retired::Snapshot`].
    pub fn request_snapshot(&mut self, capacity: usize) -> Result<(), EngineError> {
        self.send(Command::Snapshot(vec![0; capacity].into_boxed_slice()))
    }

    /// Drain everything the audio thread handed back.
    ///
    /// Diagnostics are logged and kept for
    /// [`take_diagnostics`](Self::take_diagnostics); queued deferred work is
    /// run unless the runner was taken.
    pub fn collect(&mut self) -> Vec<Retired> {
        let mut retired = Vec::new();
        while let Ok(object) = self.retired.pop() {
            retired.push(object);
        }

        let mut record = [0u8; DIAGNOSTIC_LEN];
        while let Some(len) = self.diagnostics.read_into(&mut record) {
            match Diagnostic::decode(&record[..len.min(DIAGNOSTIC_LEN)]) {
                Some(diagnostic) => {
                    diagnostic.log();
                    self.pending.push(diagnostic);
                }
                None => warn!(len, "malformed diagnostics record"),
            }
        }

        if let Some(runner) = &mut self.work {
            runner.run();
        }
        retired
    }

    /// Diagnostics collected so far.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.pending)
    }

    /// Latest playhead state published by the engine.
    pub fn transport(&mut self) -> Transport {
        if let Some(transport) = self.transport.latest() {
            self.last_transport = transport;
        }
        self.last_transport
    }

    /// Stop the engine for good. Seen at the start of the next tick.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// The id allocator shared by every graph of this engine.
    #[inline]
    pub fn node_ids(&self) -> &NodeIds {
        &self.ids
    }

    /// Builds nodes that fit the live graph.
    pub fn node_builder(&self) -> NodeBuilder {
        NodeBuilder::new(self.ids.clone(), self.config.block_len(), self.config.event_queue_depth)
    }

    /// Create a unit by registry id.
    pub fn create_unit(&mut self, id: &str) -> Result<Box<dyn ProcessingUnit>, PluginError> {
        self.registry.create(id, &mut self.host, &self.config)
    }

    /// Build a channel around the unit `instrument`, ready for
    /// [`Command::InsertChannel`].
    pub fn new_channel(
        &mut self,
        name: impl Into<String>,
        length: usize,
        instrument: &str,
    ) -> Result<(Box<Channel>, ChannelNodes), PluginError> {
        let unit = self.create_unit(instrument)?;
        let (channel, nodes) = Channel::new(&self.node_builder(), name, length, unit);
        Ok((Box::new(channel), nodes))
    }

    #[inline]
    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    #[inline]
    pub fn registry_mut(&mut self) -> &mut UnitRegistry {
        &mut self.registry
    }

    #[inline]
    pub fn plugin_host(&mut self) -> &mut PluginHost {
        &mut self.host
    }

    /// Register deferred work before the engine may schedule it.
    pub fn work_runner(&mut self) -> Option<&mut WorkRunner> {
        self.work.as_mut()
    }

    /// Take the work runner to drive it from a worker thread instead of
    /// [`collect`](Self::collect).
    pub fn take_work_runner(&mut self) -> Option<WorkRunner> {
        self.work.take()
    }
}

/// How far an export has come.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportProgress {
    Running { rendered: u64, total: u64 },
    Finished,
    Cancelled,
}

/// Renders a fixed number of frames as fast as possible, in bounded steps.
///
/// Each [`step`](Self::step) runs a catch-up loop of at most `max_ticks`
/// blocks and then returns, so the caller can yield between steps.
pub struct Exporter<'a> {
    engine: &'a mut Engine,
    block: Vec<f32>,
    rendered: u64,
    total: u64,
    /// Looping flag to put back once a song export is dropped.
    looping: Option<bool>,
}

impl<'a> Exporter<'a> {
    pub fn new(engine: &'a mut Engine, frames: u64) -> Self {
        let block = vec![0.0; engine.config.block_len()];
        Self { engine, block, rendered: 0, total: frames, looping: None }
    }

    /// Export the whole song once from its first bar.
    ///
    /// The song is played from bar 0 with looping off. When the exporter is
    /// dropped the transport is stopped and the looping flag restored.
    pub fn song(engine: &'a mut Engine) -> Self {
        let song = &mut engine.document.song;
        let looping = song.is_looping();
        song.set_looping(false);
        if song.seek(0).is_ok() {
            song.play();
        }
        let frames = engine.song_frames();
        info!(frames, "song export started");
        let mut exporter = Self::new(engine, frames);
        exporter.looping = Some(looping);
        exporter
    }

    /// Render up to `max_ticks` blocks, passing each to `sink`. The last
    /// block is cut to the requested length.
    pub fn step(&mut self, max_ticks: usize, mut sink: impl FnMut(&[f32])) -> ExportProgress {
        let channels = self.engine.config.channels;
        let block_size = self.engine.config.block_size as u64;

        for _ in 0..max_ticks {
            if self.rendered >= self.total {
                return ExportProgress::Finished;
            }
            if !self.engine.tick_into(&mut self.block) {
                info!(rendered = self.rendered, total = self.total, "export cancelled");
                return ExportProgress::Cancelled;
            }
            let frames = block_size.min(self.total - self.rendered);
            sink(&self.block[..frames as usize * channels]);
            self.rendered += frames;
        }
        if self.rendered >= self.total {
            ExportProgress::Finished
        } else {
            ExportProgress::Running { rendered: self.rendered, total: self.total }
        }
    }

    #[inline]
    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

impl Drop for Exporter<'_> {
    fn drop(&mut self) {
        if let Some(looping) = self.looping.take() {
            let song = &mut self.engine.document.song;
            song.stop();
            song.set_looping(looping);
        }
    }
}
