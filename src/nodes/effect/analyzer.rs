//! Peak metering tap

use crate::error::UnitError;
use crate::node::{Inputs, ParamInfo, ProcessContext, ProcessingUnit};
use crate::queue::{message_queue, MessageReceiver, MessageSender};

/// Blocks of readings that can wait unread before new ones are dropped.
pub const ANALYZER_DEPTH: usize = 32;
const READING_LEN: usize = 8;

/// Per-block peak levels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakReading {
    pub left: f32,
    pub right: f32,
}

impl PeakReading {
    fn encode(&self) -> [u8; READING_LEN] {
        let mut out = [0; READING_LEN];
        out[..4].copy_from_slice(&self.left.to_le_bytes());
        out[4..].copy_from_slice(&self.right.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; READING_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = *bytes;
        Self { left: f32::from_le_bytes([a, b, c, d]), right: f32::from_le_bytes([e, f, g, h]) }
    }
}

/// Passes its summed inputs through untouched and reports each block's peaks.
pub struct Analyzer {
    readings: MessageSender,
    dropped: u64,
}

/// Control-side end of an [`Analyzer`].
pub struct AnalyzerReader {
    readings: MessageReceiver,
}

impl Analyzer {
    pub fn new() -> (Self, AnalyzerReader) {
        let (tx, rx) = message_queue(READING_LEN, ANALYZER_DEPTH);
        (Self { readings: tx, dropped: 0 }, AnalyzerReader { readings: rx })
    }

    /// Readings lost because the reader fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Iterator for AnalyzerReader {
    type Item = PeakReading;

    /// Oldest unread reading.
    fn next(&mut self) -> Option<PeakReading> {
        let mut buf = [0; READING_LEN];
        match self.readings.read_into(&mut buf)? {
            READING_LEN => Some(PeakReading::decode(&buf)),
            _ => None,
        }
    }
}

impl AnalyzerReader {
    /// Drains the queue and returns the loudest reading per side.
    pub fn peak(&mut self) -> Option<PeakReading> {
        let mut peak: Option<PeakReading> = None;
        for reading in self.by_ref() {
            let p = peak.get_or_insert_with(PeakReading::default);
            p.left = p.left.max(reading.left);
            p.right = p.right.max(reading.right);
        }
        peak
    }
}

impl ProcessingUnit for Analyzer {
    fn id(&self) -> &str {
        "effect.analyzer"
    }

    fn process(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        inputs: Inputs<'_>,
        output: &mut [f32],
    ) -> Result<(), UnitError> {
        inputs.sum_into(output);

        let mut reading = PeakReading::default();
        for frame in output.chunks_exact(ctx.channels) {
            let left = frame.first().copied().unwrap_or(0.0).abs();
            let right = frame.get(1).copied().unwrap_or(left).abs();
            reading.left = reading.left.max(left);
            reading.right = reading.right.max(right);
        }
        if self.readings.post(&reading.encode()).is_err() {
            self.dropped += 1;
        }
        Ok(())
    }

    fn params(&self) -> &[ParamInfo] {
        &[]
    }

    fn param(&self, _index: usize) -> f32 {
        0.0
    }

    fn set_param(&mut self, _index: usize, _value: f32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_audio_and_reports_peaks() {
        let (mut analyzer, mut reader) = Analyzer::new();
        let inputs = vec![vec![0.5, -0.25, -0.75, 0.1]];
        let mut out = vec![0.0; 4];
        analyzer
            .process(&mut ProcessContext::new(48_000, 2, 2), Inputs::new(&inputs), &mut out)
            .unwrap();
        assert_eq!(out, inputs[0]);
        assert_eq!(reader.next(), Some(PeakReading { left: 0.75, right: 0.25 }));
        assert_eq!(reader.next(), None);
    }

    #[test]
    fn full_queue_drops_readings() {
        let (mut analyzer, mut reader) = Analyzer::new();
        let mut out = vec![0.0; 4];
        for _ in 0..ANALYZER_DEPTH + 3 {
            analyzer
                .process(&mut ProcessContext::new(48_000, 2, 2), Inputs::none(), &mut out)
                .unwrap();
        }
        assert_eq!(analyzer.dropped(), 3);
        assert_eq!(reader.peak(), Some(PeakReading::default()));
        assert_eq!(reader.next(), None);
    }
}
