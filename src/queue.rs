//! Bounded SPSC queue of framed byte messages.
//!
//! Each record is a 4-byte little-endian length followed by the payload,
//! stored in a byte [`sample_ring`](crate::ring::sample_ring). A record is
//! published with a single commit, so the reader never observes a header
//! without its payload.
//!
//! ```
//! use trackcore::queue::message_queue;
//!
//! let (mut tx, mut rx) = message_queue(16, 4);
//! tx.post(b"hello").unwrap();
//!
//! let msg = rx.read().unwrap();
//! assert_eq!(msg.size(), 5);
//! assert_eq!(msg.to_vec(), b"hello");
//! // bytes are retired when `msg` is dropped
//! ```

use rtrb::chunks::ReadChunk;

use crate::error::PostError;
use crate::ring::{sample_ring, SampleConsumer, SampleProducer};

/// Bytes taken by the length prefix of every record.
pub const HEADER_LEN: usize = 4;

/// Create a queue that holds `depth` messages of up to `max_payload` bytes.
///
/// Smaller messages pack tighter, so more than `depth` of them may fit.
pub fn message_queue(max_payload: usize, depth: usize) -> (MessageSender, MessageReceiver) {
    let (producer, consumer) = sample_ring(depth * (HEADER_LEN + max_payload));
    (
        MessageSender { ring: producer, max_payload },
        MessageReceiver { ring: consumer },
    )
}

/// Posting half of a message queue.
pub struct MessageSender {
    ring: SampleProducer<u8>,
    max_payload: usize,
}

impl MessageSender {
    /// Append one message.
    ///
    /// Fails without side effects if `data` exceeds the maximum payload or
    /// the framed record does not fit in the remaining space.
    pub fn post(&mut self, data: &[u8]) -> Result<(), PostError> {
        if data.len() > self.max_payload {
            return Err(PostError::TooLarge { size: data.len(), max: self.max_payload });
        }

        let header = (data.len() as u32).to_le_bytes();
        let Ok(mut chunk) = self.ring.inner_mut().write_chunk(HEADER_LEN + data.len()) else {
            return Err(PostError::Full);
        };

        let (first, second) = chunk.as_mut_slices();
        let record = header.iter().chain(data);
        for (slot, byte) in first.iter_mut().chain(second.iter_mut()).zip(record) {
            *slot = *byte;
        }
        chunk.commit_all();
        Ok(())
    }

    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Bytes still free, including room for headers.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.ring.free()
    }

    /// True if a payload of `size` bytes would be accepted right now.
    #[inline]
    pub fn can_post(&self, size: usize) -> bool {
        size <= self.max_payload && HEADER_LEN + size <= self.ring.free()
    }
}

/// Reading half of a message queue.
pub struct MessageReceiver {
    ring: SampleConsumer<u8>,
}

impl MessageReceiver {
    /// Borrow the oldest message, if any.
    ///
    /// The message stays queued until the returned handle is dropped.
    pub fn read(&mut self) -> Option<MessageHandle<'_>> {
        let consumer = self.ring.inner_mut();

        let size = {
            let header = consumer.read_chunk(HEADER_LEN).ok()?;
            let (first, second) = header.as_slices();
            let mut bytes = [0u8; HEADER_LEN];
            for (dst, src) in bytes.iter_mut().zip(first.iter().chain(second)) {
                *dst = *src;
            }
            u32::from_le_bytes(bytes) as usize
        };

        let chunk = consumer.read_chunk(HEADER_LEN + size).ok()?;
        Some(MessageHandle { chunk: Some(chunk), size })
    }

    /// Copy the oldest message into `out` and retire it.
    ///
    /// Returns the full payload size, which may be larger than what fit.
    pub fn read_into(&mut self, out: &mut [u8]) -> Option<usize> {
        let msg = self.read()?;
        msg.copy_to(out);
        Some(msg.size())
    }

    /// Retire every queued message.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    /// Bytes currently queued, headers included.
    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.ring.queued()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.queued() == 0
    }
}

/// A message borrowed from a [`MessageReceiver`].
///
/// Dropping the handle retires the message's bytes.
pub struct MessageHandle<'a> {
    chunk: Option<ReadChunk<'a, u8>>,
    size: usize,
}

impl MessageHandle<'_> {
    /// Payload size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The payload as up to two contiguous pieces (it may wrap).
    pub fn bytes(&self) -> (&[u8], &[u8]) {
        let Some(chunk) = &self.chunk else {
            return (&[], &[]);
        };
        let (first, second) = chunk.as_slices();
        if first.len() >= HEADER_LEN {
            (&first[HEADER_LEN..], second)
        } else {
            (&second[HEADER_LEN - first.len()..], &[])
        }
    }

    /// Copy the payload into `out`, returning the number of bytes copied.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        let (first, second) = self.bytes();
        let mut copied = 0;
        for (dst, src) in out.iter_mut().zip(first.iter().chain(second)) {
            *dst = *src;
            copied += 1;
        }
        copied
    }

    /// Copy the payload into a new `Vec`. Allocates, control side only.
    pub fn to_vec(&self) -> Vec<u8> {
        let (first, second) = self.bytes();
        let mut out = Vec::with_capacity(self.size);
        out.extend_from_slice(first);
        out.extend_from_slice(second);
        out
    }
}

impl Drop for MessageHandle<'_> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            chunk.commit_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_read_is_byte_identical() {
        let (mut tx, mut rx) = message_queue(32, 4);
        let payload = [7u8, 0, 255, 42, 13];
        tx.post(&payload).unwrap();

        let msg = rx.read().unwrap();
        assert_eq!(msg.size(), payload.len());
        let mut out = [0u8; 32];
        assert_eq!(msg.copy_to(&mut out), payload.len());
        assert_eq!(&out[..payload.len()], &payload);
        drop(msg);

        assert!(rx.read().is_none());
        assert!(rx.is_empty());
    }

    #[test]
    fn third_post_at_depth_two_is_full() {
        let (mut tx, mut rx) = message_queue(4, 2);
        assert_eq!(tx.post(&[1, 2, 3, 4]), Ok(()));
        assert_eq!(tx.post(&[5, 6, 7, 8]), Ok(()));
        assert_eq!(tx.post(&[9, 9, 9, 9]), Err(PostError::Full));

        // the refused post left earlier messages intact
        assert_eq!(rx.read().unwrap().to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(rx.read().unwrap().to_vec(), vec![5, 6, 7, 8]);
        assert!(rx.read().is_none());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (mut tx, mut rx) = message_queue(4, 8);
        assert_eq!(
            tx.post(&[0; 5]),
            Err(PostError::TooLarge { size: 5, max: 4 })
        );
        assert!(rx.read().is_none());
    }

    #[test]
    fn handle_release_retires_bytes() {
        let (mut tx, mut rx) = message_queue(4, 1);
        tx.post(&[1, 2]).unwrap();
        assert!(!tx.can_post(4));
        {
            let msg = rx.read().unwrap();
            assert_eq!(msg.size(), 2);
            // still queued while borrowed
            assert!(!tx.can_post(4));
        }
        assert!(tx.can_post(4));
        tx.post(&[3, 4, 5, 6]).unwrap();
        assert_eq!(rx.read().unwrap().to_vec(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn records_survive_wrapping() {
        // 11-byte ring: headers and payloads will straddle the end
        let (mut tx, mut rx) = message_queue(7, 1);
        for round in 0u8..20 {
            let len = (round % 5 + 1) as usize;
            let payload: Vec<u8> = (0..len as u8).map(|b| b.wrapping_add(round)).collect();
            tx.post(&payload).unwrap();

            let mut out = [0u8; 7];
            assert_eq!(rx.read_into(&mut out), Some(len));
            assert_eq!(&out[..len], payload.as_slice());
        }
    }

    #[test]
    fn small_messages_pack_tighter_and_stay_fifo() {
        let (mut tx, mut rx) = message_queue(8, 2);
        for i in 0..4u8 {
            tx.post(&[i, i]).unwrap();
        }
        assert_eq!(tx.post(&[9]), Err(PostError::Full));
        for i in 0..4u8 {
            assert_eq!(rx.read().unwrap().to_vec(), vec![i, i]);
        }
    }

    #[test]
    fn empty_payload_round_trips() {
        let (mut tx, mut rx) = message_queue(4, 2);
        tx.post(&[]).unwrap();
        let msg = rx.read().unwrap();
        assert_eq!(msg.size(), 0);
        assert!(msg.to_vec().is_empty());
    }
}
