//! Single-slot "latest value" mailbox.
//!
//! The writer owns the control-side copy of some state and posts whole
//! snapshots of it; the reader only ever applies the newest one. Every node's
//! parameters travel this way, so units never keep a second copy of their
//! state in sync by hand.
//!
//! The transport is a depth-2 SPSC queue. Posts are not coalesced on the
//! writer side: a post that finds the queue full marks the writer dirty and
//! [`MailboxWriter::flush`] retries it later, so callers rate-limit by
//! flushing once per UI frame.
//!
//! ```
//! use trackcore::mailbox::mailbox;
//!
//! let (mut writer, mut reader) = mailbox(0.5f32);
//! writer.set(0.7);
//! writer.set(0.9);
//! assert_eq!(reader.latest(), Some(0.9));
//! assert_eq!(reader.latest(), None);
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

const DEPTH: usize = 2;

/// Create a mailbox whose control-side copy starts at `initial`.
pub fn mailbox<T: Copy + Send>(initial: T) -> (MailboxWriter<T>, MailboxReader<T>) {
    let (producer, consumer) = RingBuffer::new(DEPTH);
    (
        MailboxWriter { producer, value: initial, dirty: false },
        MailboxReader { consumer },
    )
}

/// Control-side end: holds the current value and posts snapshots of it.
pub struct MailboxWriter<T> {
    producer: Producer<T>,
    value: T,
    dirty: bool,
}

impl<T: Copy + Send> MailboxWriter<T> {
    /// The control-side copy.
    #[inline]
    pub fn get(&self) -> T {
        self.value
    }

    /// Replace the value and try to post it.
    ///
    /// Returns `false` if the reader has not caught up; the value is kept
    /// and sent by the next successful [`flush`](Self::flush).
    pub fn set(&mut self, value: T) -> bool {
        self.value = value;
        self.dirty = true;
        self.flush()
    }

    /// Modify the value in place and try to post it.
    pub fn update(&mut self, f: impl FnOnce(&mut T)) -> bool {
        f(&mut self.value);
        self.dirty = true;
        self.flush()
    }

    /// Post the current value if an earlier post was refused.
    pub fn flush(&mut self) -> bool {
        if !self.dirty {
            return true;
        }
        if self.producer.push(self.value).is_ok() {
            self.dirty = false;
        }
        !self.dirty
    }

    /// True if the last value has not reached the queue yet.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Audio-side end.
pub struct MailboxReader<T> {
    consumer: Consumer<T>,
}

impl<T: Copy + Send> MailboxReader<T> {
    /// Drain the queue and return the newest value, if anything was posted
    /// since the last call.
    #[inline]
    pub fn latest(&mut self) -> Option<T> {
        let mut latest = None;
        while let Ok(value) = self.consumer.pop() {
            latest = Some(value);
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_sees_only_the_newest_value() {
        let (mut writer, mut reader) = mailbox(0u32);
        assert!(writer.set(1));
        assert!(writer.set(2));
        assert_eq!(reader.latest(), Some(2));
        assert_eq!(reader.latest(), None);
    }

    #[test]
    fn refused_post_is_retried_by_flush() {
        let (mut writer, mut reader) = mailbox(0u32);
        assert!(writer.set(1));
        assert!(writer.set(2));
        // queue holds two snapshots; the third is kept back
        assert!(!writer.set(3));
        assert!(writer.is_dirty());
        assert_eq!(writer.get(), 3);

        assert_eq!(reader.latest(), Some(2));
        assert!(writer.flush());
        assert_eq!(reader.latest(), Some(3));
    }

    #[test]
    fn update_edits_the_control_copy() {
        let (mut writer, mut reader) = mailbox([0.0f32; 3]);
        writer.update(|v| v[1] = 0.5);
        writer.update(|v| v[2] = -1.0);
        assert_eq!(reader.latest(), Some([0.0, 0.5, -1.0]));
    }
}
