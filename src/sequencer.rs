//! Song model and playhead.
//!
//! A [`Song`] is an ordered list of [`Channel`]s. Each channel owns a bank of
//! [`Pattern`]s, a per-bar sequence choosing which pattern plays in that bar,
//! and handles to its part of the graph: an instrument, an effect chain and a
//! volume node feeding the sink.
//!
//! [`Song::update`] advances the playhead and sends note-ons and note-offs to
//! the instruments by comparing the notes active now with those active on the
//! previous tick. Active notes are kept sorted by `(channel, key, start,
//! length)`, so the comparison is a single merge and a key can never be
//! switched on twice without a note-off in between.
//!
//! Everything reachable from [`Song::update`] and the in-place edits runs on
//! the audio thread once the song is live, so none of it allocates as long as
//! the reserved capacities hold.

use std::cmp::Ordering;

use itertools::{EitherOrBoth, Itertools};

use crate::error::{GraphError, PostError, SongError};
use crate::graph::{Graph, GraphNode, NodeBuilder, NodeHandle, Target};
use crate::node::{NodeId, NoteEvent, ProcessingUnit};
use crate::nodes::effect::volume::{self, Volume};

pub const DEFAULT_TEMPO: f32 = 120.0;
pub const DEFAULT_BEATS_PER_BAR: u32 = 8;
pub const DEFAULT_LENGTH: usize = 16;
/// Volume of every note-on the sequencer sends.
pub const NOTE_ON_VOLUME: f32 = 0.8;
/// Highest playable key.
pub const MAX_KEY: i32 = 127;

/// Bars that can be inserted into a live song before its sequences must grow.
pub const BAR_HEADROOM: usize = 64;
/// Effects a channel can hold.
pub const MAX_EFFECTS: usize = 16;
/// Channels a live song can hold.
pub const MAX_CHANNELS: usize = 64;
/// Notes tracked as sounding at once across the song; more are ignored.
pub const MAX_ACTIVE_NOTES: usize = 256;

/// One note in a pattern. Positions are in beats from the start of the bar.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Note {
    pub start: f32,
    pub key: i32,
    pub length: f32,
}

impl Note {
    pub fn new(start: f32, key: i32, length: f32) -> Self {
        Self { start, key, length }
    }

    /// True while `beat` lies in `[start, start + length)`.
    #[inline]
    pub fn is_active_at(&self, beat: f32) -> bool {
        beat >= self.start && beat < self.start + self.length
    }

    #[inline]
    fn is_playable(&self) -> bool {
        (0..=MAX_KEY).contains(&self.key)
    }
}

/// An ordered bar's worth of notes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pattern {
    notes: Vec<Note>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_note(&mut self, start: f32, key: i32, length: f32) -> &mut Note {
        self.notes.push(Note::new(start, key, length));
        let last = self.notes.len() - 1;
        &mut self.notes[last]
    }

    /// Remove the first note equal to `note`, keeping the others in order.
    pub fn remove_note(&mut self, note: &Note) -> bool {
        match self.notes.iter().position(|n| n == note) {
            Some(pos) => {
                self.notes.remove(pos);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.notes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

impl FromIterator<Note> for Pattern {
    fn from_iter<I: IntoIterator<Item = Note>>(iter: I) -> Self {
        Self { notes: iter.into_iter().collect() }
    }
}

/// Graph nodes created along with a [`Channel`], inserted by
/// [`Song::insert_channel`].
pub struct ChannelNodes {
    pub instrument: GraphNode,
    pub volume: GraphNode,
}

/// One instrument track.
pub struct Channel {
    pub name: String,
    sequence: Vec<Option<usize>>,
    patterns: Vec<Pattern>,
    instrument: NodeHandle,
    effects: Vec<NodeHandle>,
    volume: NodeHandle,
    mute: bool,
    solo: bool,
}

impl Channel {
    /// Build a channel of `length` empty bars around `instrument`.
    ///
    /// The nodes are returned separately so they can be built on the control
    /// thread and moved into a live graph later.
    pub fn new(
        builder: &NodeBuilder,
        name: impl Into<String>,
        length: usize,
        instrument: Box<dyn ProcessingUnit>,
    ) -> (Self, ChannelNodes) {
        let (instrument_node, instrument) = builder.build(instrument);
        let (volume_node, volume) = builder.build(Box::new(Volume::default()));

        let mut sequence = Vec::with_capacity(length + BAR_HEADROOM);
        sequence.resize(length, None);
        let channel = Self {
            name: name.into(),
            sequence,
            patterns: vec![Pattern::new()],
            instrument,
            effects: Vec::with_capacity(MAX_EFFECTS),
            volume,
            mute: false,
            solo: false,
        };
        (channel, ChannelNodes { instrument: instrument_node, volume: volume_node })
    }

    /// Pattern index scheduled at each bar.
    #[inline]
    pub fn sequence(&self) -> &[Option<usize>] {
        &self.sequence
    }

    /// Schedule `pattern` at `bar`, or clear the bar with `None`.
    pub fn set_bar(&mut self, bar: usize, pattern: Option<usize>) -> Result<(), SongError> {
        if let Some(p) = pattern {
            if p >= self.patterns.len() {
                return Err(SongError::Pattern(p));
            }
        }
        let slot = self.sequence.get_mut(bar).ok_or(SongError::Bar(bar))?;
        *slot = pattern;
        Ok(())
    }

    #[inline]
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    #[inline]
    pub fn pattern(&self, index: usize) -> Option<&Pattern> {
        self.patterns.get(index)
    }

    #[inline]
    pub fn pattern_mut(&mut self, index: usize) -> Option<&mut Pattern> {
        self.patterns.get_mut(index)
    }

    /// Index of the first empty pattern, adding one if all are in use.
    pub fn new_pattern(&mut self) -> usize {
        match self.patterns.iter().position(Pattern::is_empty) {
            Some(index) => index,
            None => {
                self.patterns.push(Pattern::new());
                self.patterns.len() - 1
            }
        }
    }

    /// Append `pattern` to the bank and return its index.
    pub fn push_pattern(&mut self, pattern: Pattern) -> usize {
        self.patterns.push(pattern);
        self.patterns.len() - 1
    }

    /// Swap in a whole pattern, returning the old one.
    pub fn replace_pattern(&mut self, index: usize, pattern: Pattern) -> Result<Pattern, SongError> {
        let slot = self.patterns.get_mut(index).ok_or(SongError::Pattern(index))?;
        Ok(std::mem::replace(slot, pattern))
    }

    #[inline]
    pub fn instrument(&self) -> NodeId {
        self.instrument.id
    }

    #[inline]
    pub fn volume_node(&self) -> NodeId {
        self.volume.id
    }

    /// Effect node ids in signal order.
    pub fn effects(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.effects.iter().map(NodeHandle::id)
    }

    #[inline]
    pub fn effect_count(&self) -> usize {
        self.effects.len()
    }

    /// Control handles of any node this channel owns.
    pub fn handle_mut(&mut self, id: NodeId) -> Option<&mut NodeHandle> {
        if self.instrument.id == id {
            return Some(&mut self.instrument);
        }
        if self.volume.id == id {
            return Some(&mut self.volume);
        }
        self.effects.iter_mut().find(|h| h.id == id)
    }

    /// Send a note event straight to the instrument, e.g. for previews.
    pub fn send_event(&mut self, event: NoteEvent) -> Result<(), PostError> {
        self.instrument.events.send(event)
    }

    pub fn volume(&self) -> f32 {
        self.volume.params.get().get(volume::VOLUME).unwrap_or(0.0)
    }

    pub fn set_volume(&mut self, value: f32) {
        self.volume.set_param(volume::VOLUME, value);
    }

    pub fn pan(&self) -> f32 {
        self.volume.params.get().get(volume::PAN).unwrap_or(0.0)
    }

    pub fn set_pan(&mut self, value: f32) {
        self.volume.set_param(volume::PAN, value);
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.mute
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    #[inline]
    pub fn is_solo(&self) -> bool {
        self.solo
    }

    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }

    /// Insert an effect at `index` in the chain and rewire its neighbours.
    pub fn insert_effect(
        &mut self,
        graph: &mut Graph,
        index: usize,
        node: GraphNode,
        handle: NodeHandle,
    ) -> Result<(), SongError> {
        self.check_effect_slot(graph, index)?;
        graph.insert(node);
        self.effects.insert(index, handle);
        self.rewire(graph)?;
        Ok(())
    }

    /// Whether an effect can be inserted at `index` without allocating.
    ///
    /// The effect takes one graph slot and one scratch buffer.
    pub fn check_effect_slot(&self, graph: &Graph, index: usize) -> Result<(), SongError> {
        if index > self.effects.len() {
            return Err(SongError::Effect(index));
        }
        if self.effects.len() == self.effects.capacity() {
            return Err(SongError::Capacity("effect"));
        }
        if graph.free_slots() < 1 {
            return Err(GraphError::Full.into());
        }
        if graph.spare_buffers() < 1 {
            return Err(GraphError::NoSpareBuffer.into());
        }
        Ok(())
    }

    /// Take the effect at `index` out of the chain and the graph.
    pub fn remove_effect(
        &mut self,
        graph: &mut Graph,
        index: usize,
    ) -> Result<(GraphNode, NodeHandle), SongError> {
        if index >= self.effects.len() {
            return Err(SongError::Effect(index));
        }
        let handle = self.effects.remove(index);
        let node = graph.remove(handle.id)?;
        self.rewire(graph)?;
        Ok((node, handle))
    }

    /// Connect instrument, effects and volume in order, the volume node to
    /// the sink.
    fn rewire(&self, graph: &mut Graph) -> Result<(), SongError> {
        let mut from = self.instrument.id;
        for effect in &self.effects {
            graph.connect(from, Target::Node(effect.id))?;
            from = effect.id;
        }
        graph.connect(from, Target::Node(self.volume.id))?;
        graph.connect(self.volume.id, Target::Sink)?;
        Ok(())
    }

    /// Every node id this channel owns, in signal order.
    fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.instrument.id)
            .chain(self.effects())
            .chain(std::iter::once(self.volume.id))
    }
}

/// A note that was active on the last tick, and the channel it belongs to.
#[derive(Clone, Copy, Debug, PartialEq)]
struct ActiveNote {
    channel: usize,
    note: Note,
}

impl ActiveNote {
    fn cmp_by_key(&self, other: &Self) -> Ordering {
        self.channel
            .cmp(&other.channel)
            .then(self.note.key.cmp(&other.note.key))
            .then(self.note.start.total_cmp(&other.note.start))
            .then(self.note.length.total_cmp(&other.note.length))
    }

    #[inline]
    fn same_key(&self, other: &Self) -> bool {
        self.channel == other.channel && self.note.key == other.note.key
    }

    #[inline]
    fn key(&self) -> u8 {
        self.note.key.clamp(0, MAX_KEY) as u8
    }
}

/// A song: channels, tempo and playhead.
pub struct Song {
    pub name: String,
    channels: Vec<Box<Channel>>,
    tempo: f32,
    beats_per_bar: u32,
    length: usize,
    looping: bool,

    position: f64,
    bar: usize,
    playing: bool,

    cur_notes: Vec<ActiveNote>,
    prev_notes: Vec<ActiveNote>,
    dropped_events: u64,
}

impl Song {
    pub fn new(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            channels: Vec::with_capacity(MAX_CHANNELS),
            tempo: DEFAULT_TEMPO,
            beats_per_bar: DEFAULT_BEATS_PER_BAR,
            length: length.max(1),
            looping: true,
            position: 0.0,
            bar: 0,
            playing: false,
            cur_notes: Vec::with_capacity(MAX_ACTIVE_NOTES),
            prev_notes: Vec::with_capacity(MAX_ACTIVE_NOTES),
            dropped_events: 0,
        }
    }

    #[inline]
    pub fn tempo(&self) -> f32 {
        self.tempo
    }

    /// Beats per minute, clamped to 1..=999.
    pub fn set_tempo(&mut self, tempo: f32) {
        self.tempo = tempo.clamp(1.0, 999.0);
    }

    #[inline]
    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    pub fn set_beats_per_bar(&mut self, beats: u32) {
        self.beats_per_bar = beats.max(1);
        self.position = (self.bar * self.beats_per_bar as usize) as f64;
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Length in bars.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn total_beats(&self) -> f64 {
        (self.length * self.beats_per_bar as usize) as f64
    }

    /// Playing time of the whole song in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.total_beats() * 60.0 / self.tempo as f64
    }

    /// Playhead in beats from the start of the song.
    #[inline]
    pub fn position(&self) -> f64 {
        self.position
    }

    #[inline]
    pub fn bar(&self) -> usize {
        self.bar
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Note events that could not be queued because an instrument's event
    /// queue was full.
    #[inline]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Notes currently sounding.
    #[inline]
    pub fn sounding_notes(&self) -> usize {
        self.prev_notes.len()
    }

    pub fn channels(&self) -> impl ExactSizeIterator<Item = &Channel> + '_ {
        self.channels.iter().map(Box::as_ref)
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index).map(Box::as_ref)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(index).map(Box::as_mut)
    }

    /// Control handles of any node owned by any channel.
    pub fn handle_mut(&mut self, id: NodeId) -> Option<&mut NodeHandle> {
        self.channels.iter_mut().find_map(|c| c.handle_mut(id))
    }

    /// Build a channel around `instrument` and append it.
    pub fn add_channel(
        &mut self,
        graph: &mut Graph,
        name: impl Into<String>,
        instrument: Box<dyn ProcessingUnit>,
    ) -> Result<usize, SongError> {
        graph.reserve(2, 1);
        let (channel, nodes) = Channel::new(&graph.builder(), name, self.length, instrument);
        let index = self.channels.len();
        self.insert_channel(graph, index, Box::new(channel), nodes)?;
        Ok(index)
    }

    /// Insert a prepared channel at `index`, moving its nodes into `graph`.
    pub fn insert_channel(
        &mut self,
        graph: &mut Graph,
        index: usize,
        mut channel: Box<Channel>,
        nodes: ChannelNodes,
    ) -> Result<(), SongError> {
        self.check_channel_slot(graph, index, &channel)?;
        channel.sequence.resize(self.length, None);
        graph.insert(nodes.instrument);
        graph.insert(nodes.volume);
        channel.rewire(graph)?;
        self.channels.insert(index, channel);
        for active in &mut self.prev_notes {
            if active.channel >= index {
                active.channel += 1;
            }
        }
        Ok(())
    }

    /// Whether `channel` can be inserted at `index` without allocating.
    ///
    /// Its instrument and volume nodes take two graph slots and the edge
    /// between them one scratch buffer. Its sequence must already hold
    /// every bar of the song.
    pub fn check_channel_slot(
        &self,
        graph: &Graph,
        index: usize,
        channel: &Channel,
    ) -> Result<(), SongError> {
        if index > self.channels.len() {
            return Err(SongError::Channel(index));
        }
        if self.channels.len() == self.channels.capacity() {
            return Err(SongError::Capacity("channel"));
        }
        if channel.sequence.capacity() < self.length {
            return Err(SongError::Capacity("bar"));
        }
        if graph.free_slots() < 2 {
            return Err(GraphError::Full.into());
        }
        if graph.spare_buffers() < 1 {
            return Err(GraphError::NoSpareBuffer.into());
        }
        Ok(())
    }

    /// Remove the channel at `index` and all of its nodes.
    ///
    /// Each removed node is passed to `retire` so the caller decides where it
    /// is dropped.
    pub fn remove_channel(
        &mut self,
        graph: &mut Graph,
        index: usize,
        mut retire: impl FnMut(GraphNode),
    ) -> Result<Box<Channel>, SongError> {
        if index >= self.channels.len() {
            return Err(SongError::Channel(index));
        }
        let channel = self.channels.remove(index);
        for id in channel.node_ids() {
            if let Ok(node) = graph.remove(id) {
                retire(node);
            }
        }
        self.prev_notes.retain(|n| n.channel != index);
        for active in &mut self.prev_notes {
            if active.channel > index {
                active.channel -= 1;
            }
        }
        Ok(channel)
    }

    /// True when every sequence can take another bar in place.
    pub fn has_bar_capacity(&self) -> bool {
        self.channels.iter().all(|c| c.sequence.len() < c.sequence.capacity())
    }

    /// Insert an empty bar before `at`.
    pub fn insert_bar(&mut self, at: usize) -> Result<(), SongError> {
        if at > self.length {
            return Err(SongError::Bar(at));
        }
        for channel in &mut self.channels {
            channel.sequence.insert(at, None);
        }
        self.length += 1;
        Ok(())
    }

    /// Remove bar `at`; the last bar cannot be removed.
    pub fn remove_bar(&mut self, at: usize) -> Result<(), SongError> {
        if at >= self.length {
            return Err(SongError::Bar(at));
        }
        if self.length == 1 {
            return Err(SongError::Empty);
        }
        for channel in &mut self.channels {
            channel.sequence.remove(at);
        }
        self.length -= 1;
        self.clamp_playhead();
        Ok(())
    }

    /// Grow or shrink the song to `length` bars.
    pub fn set_length(&mut self, length: usize) -> Result<(), SongError> {
        if length == 0 {
            return Err(SongError::Empty);
        }
        for channel in &mut self.channels {
            channel.sequence.resize(length, None);
        }
        self.length = length;
        self.clamp_playhead();
        Ok(())
    }

    fn clamp_playhead(&mut self) {
        if self.bar >= self.length {
            self.bar = self.length - 1;
            self.position = (self.bar * self.beats_per_bar as usize) as f64;
        }
    }

    /// Start playing from the beginning of the current bar.
    pub fn play(&mut self) {
        self.release_all();
        self.position = (self.bar * self.beats_per_bar as usize) as f64;
        self.playing = true;
    }

    /// Stop, sending one note-off per sounding note.
    pub fn stop(&mut self) {
        self.release_all();
        self.playing = false;
        self.position = (self.bar * self.beats_per_bar as usize) as f64;
    }

    /// Move the playhead to the start of `bar`. Sounding notes are released.
    pub fn seek(&mut self, bar: usize) -> Result<(), SongError> {
        if bar >= self.length {
            return Err(SongError::Bar(bar));
        }
        self.release_all();
        self.bar = bar;
        self.position = (bar * self.beats_per_bar as usize) as f64;
        Ok(())
    }

    /// Advance by `elapsed` seconds and send the resulting note events.
    pub fn update(&mut self, elapsed: f64) {
        self.apply_mutes();
        if !self.playing {
            return;
        }

        self.position += elapsed * self.tempo as f64 / 60.0;
        let total = self.total_beats();
        if self.position >= total {
            if self.looping {
                self.position %= total;
            } else {
                self.bar = 0;
                self.stop();
                return;
            }
        }
        let beats_per_bar = self.beats_per_bar as f64;
        self.bar = ((self.position / beats_per_bar) as usize).min(self.length - 1);

        let beat_in_bar = (self.position % beats_per_bar) as f32;
        self.collect_active(beat_in_bar);
        self.send_diff();
        std::mem::swap(&mut self.prev_notes, &mut self.cur_notes);
    }

    /// Push each channel's effective mute to its volume node. A soloed
    /// channel anywhere mutes every channel that is not soloed.
    fn apply_mutes(&mut self) {
        let solo_mode = self.channels.iter().any(|c| c.solo);
        for channel in &mut self.channels {
            let mute = channel.mute || (solo_mode && !channel.solo);
            let value = if mute { 1.0 } else { 0.0 };
            if channel.volume.params.get().get(volume::MUTE) != Some(value) {
                channel.volume.set_param(volume::MUTE, value);
            } else {
                channel.volume.params.flush();
            }
        }
    }

    fn collect_active(&mut self, beat_in_bar: f32) {
        self.cur_notes.clear();
        let bar = self.bar;
        'channels: for (index, channel) in self.channels.iter().enumerate() {
            let Some(pattern) = channel
                .sequence
                .get(bar)
                .copied()
                .flatten()
                .and_then(|p| channel.patterns.get(p))
            else {
                continue;
            };
            for note in pattern.notes.iter().filter(|n| n.is_playable()) {
                if !note.is_active_at(beat_in_bar) {
                    continue;
                }
                if self.cur_notes.len() == self.cur_notes.capacity() {
                    break 'channels;
                }
                self.cur_notes.push(ActiveNote { channel: index, note: *note });
            }
        }
        self.cur_notes.sort_unstable_by(ActiveNote::cmp_by_key);
        // overlapping notes on one key sound as the earliest of them
        self.cur_notes.dedup_by(|b, a| a.same_key(b));
    }

    /// Note-offs for notes that ended, then note-ons for notes that started.
    fn send_diff(&mut self) {
        let Self { channels, prev_notes, cur_notes, dropped_events, .. } = self;
        let diff = || prev_notes.iter().merge_join_by(cur_notes.iter(), |a, b| a.cmp_by_key(b));

        for item in diff() {
            if let EitherOrBoth::Left(ended) = item {
                send(channels, dropped_events, ended.channel, NoteEvent::note_off(ended.key()));
            }
        }
        for item in diff() {
            if let EitherOrBoth::Right(started) = item {
                let event = NoteEvent::note_on(started.key(), NOTE_ON_VOLUME);
                send(channels, dropped_events, started.channel, event);
            }
        }
    }

    fn release_all(&mut self) {
        let Self { channels, prev_notes, cur_notes, dropped_events, .. } = self;
        for active in prev_notes.iter() {
            send(channels, dropped_events, active.channel, NoteEvent::note_off(active.key()));
        }
        prev_notes.clear();
        cur_notes.clear();
    }
}

fn send(channels: &mut [Box<Channel>], dropped: &mut u64, channel: usize, event: NoteEvent) {
    let sent = channels.get_mut(channel).map(|c| c.send_event(event));
    if !matches!(sent, Some(Ok(()))) {
        *dropped += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::UnitError;
    use crate::node::{Inputs, NodeIds, NoteEventKind, ProcessContext};
    use crate::nodes::Gain;

    type Log = Arc<Mutex<Vec<(NoteEventKind, u8)>>>;

    /// Records every note event it receives.
    struct Recorder(Log);

    impl ProcessingUnit for Recorder {
        fn id(&self) -> &str {
            "test.recorder"
        }

        fn process(
            &mut self,
            _ctx: &mut ProcessContext<'_>,
            _inputs: Inputs<'_>,
            output: &mut [f32],
        ) -> Result<(), UnitError> {
            output.fill(0.0);
            Ok(())
        }

        fn note_event(&mut self, event: NoteEvent) {
            self.0.lock().unwrap().push((event.kind, event.key));
        }
    }

    struct Rig {
        song: Song,
        graph: Graph,
        logs: Vec<Log>,
    }

    impl Rig {
        /// Tempo 60, so one second is one beat.
        fn new(channels: usize) -> Self {
            let mut graph = Graph::new(4, 2, NodeIds::new());
            let mut song = Song::new("test", 2);
            song.set_tempo(60.0);
            song.set_beats_per_bar(4);
            let mut logs = Vec::new();
            for i in 0..channels {
                let log = Log::default();
                song.add_channel(&mut graph, format!("ch{i}"), Box::new(Recorder(log.clone())))
                    .unwrap();
                logs.push(log);
            }
            Self { song, graph, logs }
        }

        fn pattern(&mut self, channel: usize, notes: &[Note]) {
            let ch = self.song.channel_mut(channel).unwrap();
            ch.replace_pattern(0, notes.iter().copied().collect()).unwrap();
            ch.set_bar(0, Some(0)).unwrap();
        }

        fn step(&mut self, seconds: f64) {
            self.song.update(seconds);
            let mut out = vec![0.0; 8];
            self.graph.process(&mut ProcessContext::new(48_000, 4, 2), &mut out);
        }

        fn events(&self, channel: usize) -> Vec<(NoteEventKind, u8)> {
            self.logs[channel].lock().unwrap().clone()
        }
    }

    use NoteEventKind::{NoteOff, NoteOn};

    #[test]
    fn each_note_gets_one_on_and_one_later_off() {
        let mut rig = Rig::new(1);
        rig.pattern(0, &[Note::new(0.0, 60, 1.0), Note::new(0.5, 64, 2.0)]);
        rig.song.play();
        for _ in 0..16 {
            rig.step(0.25);
        }
        let events = rig.events(0);
        for key in [60, 64] {
            let mine: Vec<_> = events.iter().filter(|(_, k)| *k == key).map(|(kind, _)| *kind).collect();
            assert_eq!(mine, vec![NoteOn, NoteOff], "key {key}");
        }
    }

    #[test]
    fn offs_are_sent_before_ons() {
        let mut rig = Rig::new(1);
        rig.pattern(0, &[Note::new(0.0, 60, 1.0), Note::new(1.0, 60, 1.0)]);
        rig.song.play();
        rig.step(0.5);
        rig.step(1.0);
        assert_eq!(rig.events(0), vec![(NoteOn, 60), (NoteOff, 60), (NoteOn, 60)]);
    }

    #[test]
    fn overlapping_notes_on_one_key_never_double_trigger() {
        let mut rig = Rig::new(1);
        rig.pattern(0, &[Note::new(0.0, 60, 2.0), Note::new(1.0, 60, 2.0)]);
        rig.song.play();
        for _ in 0..12 {
            rig.step(0.25);
        }
        let events = rig.events(0);
        for pair in events.windows(2) {
            assert_ne!(pair[0].0, pair[1].0, "{events:?}");
        }
        assert_eq!(events.first(), Some(&(NoteOn, 60)));
        assert_eq!(events.last(), Some(&(NoteOff, 60)));
    }

    #[test]
    fn stop_releases_each_sounding_note_once() {
        let mut rig = Rig::new(2);
        rig.pattern(0, &[Note::new(0.0, 60, 4.0), Note::new(0.0, 67, 4.0)]);
        rig.pattern(1, &[Note::new(0.0, 48, 4.0)]);
        rig.song.play();
        rig.step(0.5);
        rig.step(0.5);
        assert_eq!(rig.song.sounding_notes(), 3);

        rig.song.stop();
        rig.step(0.5);
        assert!(!rig.song.is_playing());
        assert_eq!(rig.song.sounding_notes(), 0);
        assert_eq!(rig.events(0), vec![(NoteOn, 60), (NoteOn, 67), (NoteOff, 60), (NoteOff, 67)]);
        assert_eq!(rig.events(1), vec![(NoteOn, 48), (NoteOff, 48)]);

        rig.song.stop();
        rig.step(0.5);
        assert_eq!(rig.events(1).len(), 2);
    }

    #[test]
    fn playhead_wraps_when_looping() {
        let mut rig = Rig::new(1);
        rig.step(1.0);
        assert_eq!(rig.song.position(), 0.0);
        rig.song.play();
        rig.step(5.0);
        assert_eq!(rig.song.bar(), 1);
        rig.step(4.0);
        assert!((rig.song.position() - 1.0).abs() < 1e-9);
        assert_eq!(rig.song.bar(), 0);
        assert!(rig.song.is_playing());
    }

    #[test]
    fn song_end_stops_and_releases_without_loop() {
        let mut rig = Rig::new(1);
        rig.pattern(0, &[Note::new(0.0, 60, 4.0)]);
        rig.song.channel_mut(0).unwrap().set_bar(1, Some(0)).unwrap();
        rig.song.set_looping(false);
        rig.song.play();
        rig.step(7.0);
        assert_eq!(rig.song.sounding_notes(), 1);
        rig.step(2.0);
        assert!(!rig.song.is_playing());
        assert_eq!(rig.song.position(), 0.0);
        assert_eq!(rig.events(0), vec![(NoteOn, 60), (NoteOff, 60)]);
    }

    #[test]
    fn solo_mutes_the_other_channels() {
        let mut rig = Rig::new(2);
        rig.song.channel_mut(1).unwrap().set_solo(true);
        rig.step(0.0);
        let mute_of = |song: &Song, i: usize| {
            song.channel(i).unwrap().volume.params.get().get(volume::MUTE).unwrap()
        };
        assert_eq!(mute_of(&rig.song, 0), 1.0);
        assert_eq!(mute_of(&rig.song, 1), 0.0);

        rig.song.channel_mut(1).unwrap().set_solo(false);
        rig.step(0.0);
        assert_eq!(mute_of(&rig.song, 0), 0.0);
    }

    #[test]
    fn effects_are_chained_between_instrument_and_volume() {
        let mut rig = Rig::new(1);
        let builder = rig.graph.builder();
        let (a, ha) = builder.build(Box::new(Gain::new(0.0)));
        let (b, hb) = builder.build(Box::new(Gain::new(0.0)));
        let (a_id, b_id) = (ha.id, hb.id);
        let channel = rig.song.channel_mut(0).unwrap();
        channel.insert_effect(&mut rig.graph, 0, b, hb).unwrap();
        channel.insert_effect(&mut rig.graph, 0, a, ha).unwrap();
        let (instrument, volume_id) = (channel.instrument(), channel.volume_node());

        assert_eq!(channel.effects().collect::<Vec<_>>(), vec![a_id, b_id]);
        assert_eq!(rig.graph.node(instrument).unwrap().downstream(), Some(Target::Node(a_id)));
        assert_eq!(rig.graph.node(a_id).unwrap().downstream(), Some(Target::Node(b_id)));
        assert_eq!(rig.graph.node(b_id).unwrap().downstream(), Some(Target::Node(volume_id)));
        assert_eq!(rig.graph.node(volume_id).unwrap().inputs(), &[b_id]);

        let channel = rig.song.channel_mut(0).unwrap();
        let (removed, _) = channel.remove_effect(&mut rig.graph, 0).unwrap();
        assert_eq!(removed.id(), a_id);
        assert_eq!(rig.graph.node(instrument).unwrap().downstream(), Some(Target::Node(b_id)));
        assert!(rig.graph.node(a_id).is_none());
    }

    #[test]
    fn removing_a_channel_retires_its_nodes() {
        let mut rig = Rig::new(2);
        assert_eq!(rig.graph.len(), 4);
        let mut retired = Vec::new();
        let channel = rig.song.remove_channel(&mut rig.graph, 0, |n| retired.push(n.id())).unwrap();
        assert_eq!(channel.name, "ch0");
        assert_eq!(retired.len(), 2);
        assert_eq!(rig.graph.len(), 2);
        assert_eq!(rig.graph.sink_inputs().len(), 1);
        assert_eq!(rig.song.channel(0).unwrap().name, "ch1");
    }

    #[test]
    fn bar_edits_keep_sequences_in_step() {
        let mut rig = Rig::new(1);
        rig.pattern(0, &[Note::new(0.0, 60, 1.0)]);
        rig.song.insert_bar(0).unwrap();
        assert_eq!(rig.song.length(), 3);
        assert_eq!(rig.song.channel(0).unwrap().sequence(), &[None, Some(0), None]);

        rig.song.seek(2).unwrap();
        rig.song.remove_bar(0).unwrap();
        rig.song.remove_bar(1).unwrap();
        assert_eq!(rig.song.bar(), 0);
        assert_eq!(rig.song.remove_bar(0), Err(SongError::Empty));

        rig.song.set_length(4).unwrap();
        assert_eq!(rig.song.channel(0).unwrap().sequence().len(), 4);
        assert_eq!(rig.song.seek(4), Err(SongError::Bar(4)));
    }

    #[test]
    fn pattern_edits() {
        let mut pattern = Pattern::new();
        pattern.add_note(0.0, 60, 1.0);
        pattern.add_note(1.0, 62, 1.0);
        pattern.add_note(2.0, 64, 1.0);
        assert!(pattern.remove_note(&Note::new(1.0, 62, 1.0)));
        assert!(!pattern.remove_note(&Note::new(1.0, 62, 1.0)));
        let keys: Vec<i32> = pattern.notes().iter().map(|n| n.key).collect();
        assert_eq!(keys, vec![60, 64]);

        let mut rig = Rig::new(1);
        let channel = rig.song.channel_mut(0).unwrap();
        assert_eq!(channel.new_pattern(), 0);
        channel.pattern_mut(0).unwrap().add_note(0.0, 60, 1.0);
        assert_eq!(channel.new_pattern(), 1);
        assert_eq!(channel.set_bar(0, Some(5)), Err(SongError::Pattern(5)));
    }
}
