//! Fixed-capacity single-producer/single-consumer sample buffer.
//!
//! This is the transport underneath device output and every message queue in
//! the crate. [`sample_ring`] returns the two halves; each can be moved to a
//! different thread but neither can be cloned, so the SPSC discipline is
//! checked at compile time.
//!
//! Full and empty are told apart by rtrb's read/write positions, which run
//! modulo twice the capacity, so [`queued`](SampleConsumer::queued) is always in
//! `0..=capacity` and every slot is usable.

use rtrb::{Consumer, Producer, RingBuffer};

/// Create a ring buffer holding up to `capacity` samples.
pub fn sample_ring<T: Copy + Default>(capacity: usize) -> (SampleProducer<T>, SampleConsumer<T>) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (SampleProducer { inner: producer }, SampleConsumer { inner: consumer })
}

/// Writing half of a sample ring.
pub struct SampleProducer<T> {
    inner: Producer<T>,
}

impl<T: Copy + Default> SampleProducer<T> {
    /// Copy as much of `buf` as fits, wrapping around the end of storage.
    ///
    /// Returns the number of elements written. Unread data is never
    /// overwritten.
    pub fn write(&mut self, buf: &[T]) -> usize {
        let count = buf.len().min(self.inner.slots());
        if count == 0 {
            return 0;
        }
        // slots() was checked above, so the chunk request cannot fail
        let Ok(mut chunk) = self.inner.write_chunk(count) else {
            return 0;
        };
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&buf[..split]);
        second.copy_from_slice(&buf[split..count]);
        chunk.commit_all();
        count
    }

    /// Write all of `buf` or nothing.
    pub fn write_all(&mut self, buf: &[T]) -> bool {
        if self.inner.slots() < buf.len() {
            return false;
        }
        self.write(buf) == buf.len()
    }

    /// Elements written but not yet read.
    #[inline]
    pub fn queued(&self) -> usize {
        self.capacity() - self.inner.slots()
    }

    /// Elements that can be written right now.
    #[inline]
    pub fn free(&self) -> usize {
        self.inner.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.buffer().capacity()
    }

    /// True once the consumer half has been dropped.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }
}

/// Reading half of a sample ring.
pub struct SampleConsumer<T> {
    inner: Consumer<T>,
}

impl<T: Copy + Default> SampleConsumer<T> {
    /// Copy up to `out.len()` queued elements into `out`, oldest first.
    ///
    /// Returns how many were copied; the rest of `out` is left untouched.
    pub fn read(&mut self, out: &mut [T]) -> usize {
        let count = out.len().min(self.inner.slots());
        if count == 0 {
            return 0;
        }
        let Ok(chunk) = self.inner.read_chunk(count) else {
            return 0;
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..count].copy_from_slice(second);
        chunk.commit_all();
        count
    }

    /// Like [`read`](Self::read), but pads the remainder of `out` with
    /// `T::default()` (silence, for samples).
    pub fn read_or_silence(&mut self, out: &mut [T]) -> usize {
        let count = self.read(out);
        out[count..].fill(T::default());
        count
    }

    /// Elements available to read.
    #[inline]
    pub fn queued(&self) -> usize {
        self.inner.slots()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.buffer().capacity()
    }

    /// Drop everything currently queued.
    pub fn clear(&mut self) {
        let queued = self.inner.slots();
        if let Ok(chunk) = self.inner.read_chunk(queued) {
            chunk.commit_all();
        }
    }

    /// True once the producer half has been dropped.
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.inner.is_abandoned()
    }

    pub(crate) fn inner_mut(&mut self) -> &mut Consumer<T> {
        &mut self.inner
    }
}

impl<T> SampleProducer<T> {
    pub(crate) fn inner_mut(&mut self) -> &mut Producer<T> {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wraps_and_preserves_order() {
        let (mut tx, mut rx) = sample_ring::<f32>(4);
        assert_eq!(tx.write(&[1.0, 2.0, 3.0]), 3);

        let mut out = [0.0; 2];
        assert_eq!(rx.read(&mut out), 2);
        assert_eq!(out, [1.0, 2.0]);

        // crosses the end of storage
        assert_eq!(tx.write(&[4.0, 5.0, 6.0]), 3);
        assert_eq!(tx.queued(), 4);
        assert_eq!(tx.write(&[7.0]), 0);

        let mut out = [0.0; 8];
        assert_eq!(rx.read(&mut out), 4);
        assert_eq!(&out[..4], &[3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn full_capacity_is_usable() {
        let (mut tx, rx) = sample_ring::<u8>(3);
        assert_eq!(tx.write(&[1, 2, 3, 4]), 3);
        assert_eq!(rx.queued(), 3);
        assert_eq!(tx.free(), 0);
    }

    #[test]
    fn read_or_silence_pads() {
        let (mut tx, mut rx) = sample_ring::<f32>(8);
        tx.write(&[0.25, 0.5]);
        let mut out = [1.0; 4];
        assert_eq!(rx.read_or_silence(&mut out), 2);
        assert_eq!(out, [0.25, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn write_all_is_atomic() {
        let (mut tx, mut rx) = sample_ring::<u8>(4);
        assert!(tx.write_all(&[1, 2, 3]));
        assert!(!tx.write_all(&[4, 5]));
        assert_eq!(rx.queued(), 3);
        rx.clear();
        assert_eq!(rx.queued(), 0);
        assert!(tx.write_all(&[4, 5, 6, 7]));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Write(Vec<u16>),
        Read(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            proptest::collection::vec(any::<u16>(), 0..12).prop_map(Op::Write),
            (0usize..12).prop_map(Op::Read),
        ]
    }

    proptest! {
        #[test]
        fn reads_match_a_fifo_model(capacity in 1usize..16, ops in proptest::collection::vec(op(), 0..64)) {
            let (mut tx, mut rx) = sample_ring::<u16>(capacity);
            let mut model = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Op::Write(data) => {
                        let written = tx.write(&data);
                        prop_assert_eq!(written, data.len().min(capacity - model.len()));
                        model.extend(&data[..written]);
                    }
                    Op::Read(n) => {
                        let mut out = vec![0u16; n];
                        let read = rx.read(&mut out);
                        prop_assert_eq!(read, n.min(model.len()));
                        for sample in &out[..read] {
                            prop_assert_eq!(Some(*sample), model.pop_front());
                        }
                    }
                }
                prop_assert!(rx.queued() <= capacity);
                prop_assert_eq!(rx.queued(), model.len());
                prop_assert_eq!(tx.queued(), model.len());
            }
        }
    }
}
