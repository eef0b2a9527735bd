//! A song together with the graph its channels play through, and the binary
//! format both are saved in.
//!
//! The layout is little-endian throughout:
//!
//! ```text
//! "TRKC" version:u32 name:str tempo:f32 beats_per_bar:u32 length:u32 loop:u8
//! channel_count:u32 channel*
//!
//! channel  = name:str volume:f32 pan:f32 flags:u8 instrument:unit
//!            effect_count:u32 unit* pattern_count:u32 pattern* slot:u32 * length
//! unit     = id:str state:blob
//! pattern  = note_count:u32 (start:f32 key:i32 length:f32)*
//! str/blob = len:u32 bytes
//! ```
//!
//! Flags are `1` for mute and `2` for solo. A sequence slot is `0` for an
//! empty bar and the pattern index plus one otherwise.
//!
//! Saving never allocates, so a live document can be written into a fixed
//! buffer from the audio thread. Loading builds a complete document or fails
//! without side effects.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::info;

use crate::config::EngineConfig;
use crate::error::{DocumentError, PluginError, StateError};
use crate::graph::Graph;
use crate::node::{NodeId, NodeIds, ProcessingUnit};
use crate::plugin::PluginHost;
use crate::registry::UnitRegistry;
use crate::sequencer::{Channel, Pattern, Song, DEFAULT_LENGTH};

pub const MAGIC: [u8; 4] = *b"TRKC";
pub const VERSION: u32 = 1;

/// Largest string or state blob accepted when loading.
const MAX_FIELD_LEN: usize = 1 << 24;

const FLAG_MUTE: u8 = 1;
const FLAG_SOLO: u8 = 2;

/// Everything the engine plays: the song and its graph.
///
/// The two are swapped as one, so no graph node outlives the channel that
/// refers to it.
pub struct Document {
    pub song: Song,
    pub graph: Graph,
}

impl Document {
    /// An empty song of the default length with a graph sized by `config`.
    pub fn new(name: impl Into<String>, config: &EngineConfig, ids: NodeIds) -> Self {
        Self::with_length(name, DEFAULT_LENGTH, config, ids)
    }

    pub fn with_length(
        name: impl Into<String>,
        length: usize,
        config: &EngineConfig,
        ids: NodeIds,
    ) -> Self {
        let graph = Graph::with_capacity(
            config.block_size,
            config.channels,
            ids,
            config.max_nodes,
            config.spare_buffers,
        )
        .with_event_depth(config.event_queue_depth);
        Self { song: Song::new(name, length), graph }
    }

    /// Write the document to `w`.
    pub fn save<W: Write + Seek>(&self, w: &mut W) -> Result<(), DocumentError> {
        let song = &self.song;
        w.write_all(&MAGIC)?;
        put_u32(w, VERSION)?;
        put_str(w, &song.name)?;
        put_f32(w, song.tempo())?;
        put_u32(w, song.beats_per_bar())?;
        put_u32(w, song.length() as u32)?;
        w.write_all(&[song.is_looping() as u8])?;

        put_u32(w, song.channel_count() as u32)?;
        for channel in song.channels() {
            self.save_channel(w, channel)?;
        }
        Ok(())
    }

    fn save_channel<W: Write + Seek>(
        &self,
        w: &mut W,
        channel: &Channel,
    ) -> Result<(), DocumentError> {
        put_str(w, &channel.name)?;
        put_f32(w, channel.volume())?;
        put_f32(w, channel.pan())?;
        let mut flags = 0;
        if channel.is_muted() {
            flags |= FLAG_MUTE;
        }
        if channel.is_solo() {
            flags |= FLAG_SOLO;
        }
        w.write_all(&[flags])?;

        self.save_unit(w, channel.instrument())?;
        put_u32(w, channel.effect_count() as u32)?;
        for effect in channel.effects() {
            self.save_unit(w, effect)?;
        }

        put_u32(w, channel.patterns().len() as u32)?;
        for pattern in channel.patterns() {
            put_u32(w, pattern.len() as u32)?;
            for note in pattern.notes() {
                put_f32(w, note.start)?;
                w.write_all(&note.key.to_le_bytes())?;
                put_f32(w, note.length)?;
            }
        }
        for slot in channel.sequence() {
            put_u32(w, slot.map_or(0, |p| p as u32 + 1))?;
        }
        Ok(())
    }

    /// Unit id and state, with the state length patched in afterwards.
    fn save_unit<W: Write + Seek>(&self, w: &mut W, id: NodeId) -> Result<(), DocumentError> {
        let unit = self
            .graph
            .unit(id)
            .ok_or(DocumentError::Malformed("channel refers to a missing node"))?;
        put_str(w, unit.id())?;

        let len_at = w.stream_position()?;
        put_u32(w, 0)?;
        unit.save_state(&mut *w).map_err(|source| match source {
            StateError::Io(err) => DocumentError::Io(err),
            source => DocumentError::SaveState { node: id, source },
        })?;
        let end = w.stream_position()?;
        w.seek(SeekFrom::Start(len_at))?;
        put_u32(w, (end - len_at - 4) as u32)?;
        w.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Read a document, creating every unit through `registry`.
    ///
    /// Node ids come from `ids`, which should be the engine's allocator so the
    /// new graph's ids cannot collide with live ones.
    pub fn load<R: Read>(
        r: &mut R,
        registry: &UnitRegistry,
        host: &mut PluginHost,
        config: &EngineConfig,
        ids: NodeIds,
    ) -> Result<Self, DocumentError> {
        let mut magic = [0; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(DocumentError::BadMagic);
        }
        let version = get_u32(r)?;
        if version != VERSION {
            return Err(DocumentError::UnsupportedVersion(version));
        }

        let name = get_str(r)?;
        let tempo = get_f32(r)?;
        if !tempo.is_finite() {
            return Err(DocumentError::Malformed("tempo is not finite"));
        }
        let beats_per_bar = get_u32(r)?;
        let length = get_u32(r)? as usize;
        if length == 0 || beats_per_bar == 0 {
            return Err(DocumentError::Malformed("song has no beats"));
        }
        let looping = get_u8(r)? != 0;

        let mut doc = Self::with_length(name, length, config, ids);
        doc.song.set_tempo(tempo);
        doc.song.set_beats_per_bar(beats_per_bar);
        doc.song.set_looping(looping);

        let channels = get_u32(r)? as usize;
        for index in 0..channels {
            doc.load_channel(r, index, registry, host, config)?;
        }
        // loading may have drained the pool live edits draw from
        doc.graph.reserve(0, config.spare_buffers);

        info!(
            name = %doc.song.name,
            channels = doc.song.channel_count(),
            nodes = doc.graph.len(),
            "document loaded"
        );
        Ok(doc)
    }

    fn load_channel<R: Read>(
        &mut self,
        r: &mut R,
        index: usize,
        registry: &UnitRegistry,
        host: &mut PluginHost,
        config: &EngineConfig,
    ) -> Result<(), DocumentError> {
        let name = get_str(r)?;
        let volume = get_f32(r)?;
        let pan = get_f32(r)?;
        let flags = get_u8(r)?;

        let builder = self.graph.builder();
        let instrument = load_unit(r, registry, host, config)?;
        let (mut channel, nodes) = Channel::new(&builder, name, self.song.length(), instrument);
        channel.set_volume(volume);
        channel.set_pan(pan);
        channel.set_mute(flags & FLAG_MUTE != 0);
        channel.set_solo(flags & FLAG_SOLO != 0);
        self.graph.reserve(2, 1);
        self.song.insert_channel(&mut self.graph, index, Box::new(channel), nodes)?;

        let channel = self
            .song
            .channel_mut(index)
            .ok_or(DocumentError::Malformed("channel vanished"))?;
        let effects = get_u32(r)? as usize;
        for i in 0..effects {
            let (node, handle) = builder.build(load_unit(r, registry, host, config)?);
            self.graph.reserve(1, 1);
            channel.insert_effect(&mut self.graph, i, node, handle)?;
        }

        let patterns = get_u32(r)? as usize;
        for i in 0..patterns {
            let count = get_u32(r)? as usize;
            let mut pattern = Pattern::new();
            for _ in 0..count {
                let start = get_f32(r)?;
                let key = get_i32(r)?;
                let length = get_f32(r)?;
                pattern.add_note(start, key, length);
            }
            if i == 0 {
                channel.replace_pattern(0, pattern)?;
            } else {
                channel.push_pattern(pattern);
            }
        }

        for bar in 0..channel.sequence().len() {
            let slot = get_u32(r)?;
            let pattern = slot.checked_sub(1).map(|p| p as usize);
            channel.set_bar(bar, pattern)?;
        }
        Ok(())
    }
}

fn load_unit<R: Read>(
    r: &mut R,
    registry: &UnitRegistry,
    host: &mut PluginHost,
    config: &EngineConfig,
) -> Result<Box<dyn ProcessingUnit>, DocumentError> {
    let id = get_str(r)?;
    let state = get_bytes(r)?;
    let mut unit = registry.create(&id, host, config).map_err(|err| match err {
        PluginError::NotFound(id) => DocumentError::UnknownUnit(id),
        other => DocumentError::Plugin(other),
    })?;
    unit.load_state(&state).map_err(|source| DocumentError::UnitState { id, source })?;
    Ok(unit)
}

fn put_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_f32(w: &mut impl Write, v: f32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn put_str(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    put_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn get_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut b = [0; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn get_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut b = [0; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn get_i32(r: &mut impl Read) -> std::io::Result<i32> {
    let mut b = [0; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

fn get_f32(r: &mut impl Read) -> std::io::Result<f32> {
    let mut b = [0; 4];
    r.read_exact(&mut b)?;
    Ok(f32::from_le_bytes(b))
}

fn get_bytes(r: &mut impl Read) -> Result<Vec<u8>, DocumentError> {
    let len = get_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(DocumentError::Malformed("field is too long"));
    }
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn get_str(r: &mut impl Read) -> Result<String, DocumentError> {
    String::from_utf8(get_bytes(r)?).map_err(|_| DocumentError::Malformed("string is not utf-8"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::node::ProcessContext;
    use crate::nodes::effect::volume;
    use crate::plugin::tests::AmpFactory;
    use crate::sequencer::Note;

    fn config() -> EngineConfig {
        EngineConfig { block_size: 64, ..EngineConfig::default() }
    }

    fn registry() -> UnitRegistry {
        let mut registry = UnitRegistry::with_builtins();
        registry.register_plugin(Arc::new(AmpFactory(2)));
        registry
    }

    fn sample_document(registry: &UnitRegistry, host: &mut PluginHost) -> Document {
        let config = config();
        let mut doc = Document::with_length("demo", 4, &config, NodeIds::new());
        doc.song.set_tempo(96.0);
        doc.song.set_looping(false);

        let synth = registry.create("synth.waveform", host, &config).unwrap();
        let lead = doc.song.add_channel(&mut doc.graph, "lead", synth).unwrap();
        let amp = registry.create("test.amp2", host, &config).unwrap();
        let delay = registry.create("effect.delay", host, &config).unwrap();

        let builder = doc.graph.builder();
        let channel = doc.song.channel_mut(lead).unwrap();
        channel.set_volume(0.7);
        channel.set_pan(-0.25);
        channel.set_solo(true);
        for (i, unit) in [amp, delay].into_iter().enumerate() {
            let (node, handle) = builder.build(unit);
            channel.insert_effect(&mut doc.graph, i, node, handle).unwrap();
        }
        let pattern = channel.pattern_mut(0).unwrap();
        pattern.add_note(0.0, 60, 1.0);
        pattern.add_note(2.5, 64, 0.5);
        let second = channel.new_pattern();
        channel.pattern_mut(second).unwrap().add_note(1.0, 67, 3.0);
        channel.set_bar(0, Some(0)).unwrap();
        channel.set_bar(3, Some(second)).unwrap();

        let amp_id = channel.effects().next().unwrap();
        doc.graph.node_mut(amp_id).unwrap().unit_mut().set_param(0, 1.5);

        let osc = registry.create("source.oscillator", host, &config).unwrap();
        let bass = doc.song.add_channel(&mut doc.graph, "bass", osc).unwrap();
        doc.song.channel_mut(bass).unwrap().set_mute(true);
        doc
    }

    fn save(doc: &Document) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        doc.save(&mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn save_and_load_keep_everything() {
        let registry = registry();
        let mut host = PluginHost::new();
        let doc = sample_document(&registry, &mut host);
        let bytes = save(&doc);
        assert_eq!(&bytes[..4], b"TRKC");

        let loaded =
            Document::load(&mut bytes.as_slice(), &registry, &mut host, &config(), NodeIds::new())
                .unwrap();
        let song = &loaded.song;
        assert_eq!(song.name, "demo");
        assert_eq!(song.tempo(), 96.0);
        assert_eq!(song.length(), 4);
        assert!(!song.is_looping());
        assert_eq!(song.channel_count(), 2);

        let lead = song.channel(0).unwrap();
        assert_eq!(lead.name, "lead");
        assert_eq!(lead.volume(), 0.7);
        assert_eq!(lead.pan(), -0.25);
        assert!(lead.is_solo() && !lead.is_muted());
        assert_eq!(lead.effect_count(), 2);
        assert_eq!(lead.sequence(), &[Some(0), None, None, Some(1)]);
        assert_eq!(lead.pattern(0).unwrap().notes()[1], Note::new(2.5, 64, 0.5));
        let amp = lead.effects().next().unwrap();
        assert_eq!(loaded.graph.unit(amp).unwrap().id(), "test.amp2");
        assert_eq!(loaded.graph.unit(amp).unwrap().param(0), 1.5);
        assert!(song.channel(1).unwrap().is_muted());

        // lead: synth, amp, delay, volume; bass: oscillator, volume
        assert_eq!(loaded.graph.len(), 6);
        assert_eq!(loaded.graph.sink_inputs().len(), 2);

        assert_eq!(save(&loaded), bytes);
    }

    #[test]
    fn volume_reaches_the_node_on_the_first_block() {
        let registry = registry();
        let mut host = PluginHost::new();
        let bytes = save(&sample_document(&registry, &mut host));
        let mut loaded =
            Document::load(&mut bytes.as_slice(), &registry, &mut host, &config(), NodeIds::new())
                .unwrap();
        let volume_node = loaded.song.channel(0).unwrap().volume_node();
        let mut out = vec![0.0; 128];
        loaded.graph.process(&mut ProcessContext::new(48_000, 64, 2), &mut out);
        assert_eq!(loaded.graph.unit(volume_node).unwrap().param(volume::VOLUME), 0.7);
    }

    #[test]
    fn bad_input_is_rejected() {
        let registry = registry();
        let mut host = PluginHost::new();
        let bytes = save(&sample_document(&registry, &mut host));
        let load = |bytes: &[u8], registry: &UnitRegistry, host: &mut PluginHost| {
            Document::load(&mut &bytes[..], registry, host, &config(), NodeIds::new())
        };

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(load(&bad, &registry, &mut host), Err(DocumentError::BadMagic)));

        let mut bad = bytes.clone();
        bad[4] = 9;
        assert!(matches!(
            load(&bad, &registry, &mut host),
            Err(DocumentError::UnsupportedVersion(9))
        ));

        assert!(matches!(
            load(&bytes[..bytes.len() - 3], &registry, &mut host),
            Err(DocumentError::Io(_))
        ));

        let without_plugin = UnitRegistry::with_builtins();
        assert!(matches!(
            load(&bytes, &without_plugin, &mut host),
            Err(DocumentError::UnknownUnit(id)) if id == "test.amp2"
        ));
    }

    #[test]
    fn saving_into_a_small_buffer_fails_cleanly() {
        let registry = registry();
        let mut host = PluginHost::new();
        let doc = sample_document(&registry, &mut host);
        let mut buf = [0u8; 32];
        let err = doc.save(&mut Cursor::new(&mut buf[..])).err().unwrap();
        assert!(matches!(err, DocumentError::Io(_)));

        let needed = save(&doc).len();
        let mut buf = vec![0u8; needed];
        doc.save(&mut Cursor::new(&mut buf[..])).unwrap();
        assert_eq!(buf, save(&doc));
    }

    #[test]
    fn every_short_buffer_is_an_io_error() {
        let registry = registry();
        let mut host = PluginHost::new();
        let doc = sample_document(&registry, &mut host);
        let needed = save(&doc).len();

        // includes every cut inside a unit's state blob
        for len in 0..needed {
            let mut buf = vec![0u8; len];
            match doc.save(&mut Cursor::new(&mut buf[..])) {
                Err(DocumentError::Io(_)) => {}
                other => panic!("buffer of {len} bytes gave {other:?}"),
            }
        }
    }
}
