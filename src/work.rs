//! Deferred work: realtime code hands blocking jobs to a non-realtime worker.
//!
//! Procedures are registered on the control side with [`WorkRunner::register`]
//! and identified by a [`WorkId`]. The audio side posts `[id][payload]` records
//! through a dedicated [message queue](crate::queue); the worker thread calls
//! [`WorkRunner::run`] periodically to execute them.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use trackcore::work::work_queue;
//!
//! let (mut scheduler, mut runner) = work_queue();
//! let total = Arc::new(AtomicUsize::new(0));
//! let seen = total.clone();
//! let id = runner.register(move |payload| {
//!     seen.fetch_add(payload.len(), Ordering::Relaxed);
//! });
//!
//! scheduler.schedule(id, &[1, 2, 3]).unwrap();
//! assert_eq!(runner.run(), 1);
//! assert_eq!(total.load(Ordering::Relaxed), 3);
//! ```

use tracing::warn;

use crate::error::{PostError, ScheduleError};
use crate::queue::{message_queue, MessageReceiver, MessageSender};

/// Largest payload a single work request can carry inline.
pub const WORK_DATA_CAPACITY: usize = 128;
/// Requests that can be pending at once.
pub const WORK_QUEUE_DEPTH: usize = 8;

const ID_LEN: usize = 2;

/// Handle to a registered procedure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WorkId(u16);

/// Create a scheduler/runner pair with the default capacity.
pub fn work_queue() -> (WorkScheduler, WorkRunner) {
    work_queue_with_depth(WORK_QUEUE_DEPTH)
}

pub fn work_queue_with_depth(depth: usize) -> (WorkScheduler, WorkRunner) {
    let (sender, receiver) = message_queue(ID_LEN + WORK_DATA_CAPACITY, depth);
    (
        WorkScheduler { sender, record: [0; ID_LEN + WORK_DATA_CAPACITY] },
        WorkRunner { receiver, procedures: Vec::new(), payload: Vec::with_capacity(WORK_DATA_CAPACITY) },
    )
}

/// Realtime end. Posting never allocates.
pub struct WorkScheduler {
    sender: MessageSender,
    record: [u8; ID_LEN + WORK_DATA_CAPACITY],
}

impl WorkScheduler {
    /// Queue `payload` for the procedure registered as `id`.
    pub fn schedule(&mut self, id: WorkId, payload: &[u8]) -> Result<(), ScheduleError> {
        if payload.len() > WORK_DATA_CAPACITY {
            return Err(ScheduleError::TooLarge { size: payload.len(), max: WORK_DATA_CAPACITY });
        }
        let len = ID_LEN + payload.len();
        self.record[..ID_LEN].copy_from_slice(&id.0.to_le_bytes());
        self.record[ID_LEN..len].copy_from_slice(payload);
        self.sender.post(&self.record[..len]).map_err(|err| match err {
            PostError::Full => ScheduleError::Full,
            PostError::TooLarge { size, max } => ScheduleError::TooLarge { size, max },
        })
    }
}

type Procedure = Box<dyn FnMut(&[u8]) + Send>;

/// Non-realtime end: owns the procedures and runs queued requests.
pub struct WorkRunner {
    receiver: MessageReceiver,
    procedures: Vec<Procedure>,
    payload: Vec<u8>,
}

impl WorkRunner {
    /// Register a procedure. Must happen before the audio side schedules it.
    pub fn register(&mut self, procedure: impl FnMut(&[u8]) + Send + 'static) -> WorkId {
        let id = WorkId(self.procedures.len() as u16);
        self.procedures.push(Box::new(procedure));
        id
    }

    /// Invoke every queued request in order, returning how many ran.
    pub fn run(&mut self) -> usize {
        let mut ran = 0;
        while let Some(msg) = self.receiver.read() {
            self.payload.clear();
            let (first, second) = msg.bytes();
            self.payload.extend_from_slice(first);
            self.payload.extend_from_slice(second);
            drop(msg);

            if self.payload.len() < ID_LEN {
                warn!(len = self.payload.len(), "dropping malformed work request");
                continue;
            }
            let id = u16::from_le_bytes([self.payload[0], self.payload[1]]) as usize;
            match self.procedures.get_mut(id) {
                Some(procedure) => {
                    procedure(&self.payload[ID_LEN..]);
                    ran += 1;
                }
                None => warn!(id, "dropping work request for unregistered procedure"),
            }
        }
        ran
    }

    /// True if requests are waiting.
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runs_requests_in_order_with_their_payloads() {
        let (mut scheduler, mut runner) = work_queue();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a_log = log.clone();
        let a = runner.register(move |p| a_log.lock().unwrap().push(("a", p.to_vec())));
        let b_log = log.clone();
        let b = runner.register(move |p| b_log.lock().unwrap().push(("b", p.to_vec())));

        scheduler.schedule(b, &[1]).unwrap();
        scheduler.schedule(a, &[2, 3]).unwrap();
        scheduler.schedule(b, &[]).unwrap();

        assert!(runner.has_pending());
        assert_eq!(runner.run(), 3);
        assert!(!runner.has_pending());
        assert_eq!(
            *log.lock().unwrap(),
            vec![("b", vec![1]), ("a", vec![2, 3]), ("b", vec![])]
        );
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (mut scheduler, mut runner) = work_queue();
        let id = runner.register(|_| {});
        assert_eq!(
            scheduler.schedule(id, &[0; WORK_DATA_CAPACITY + 1]),
            Err(ScheduleError::TooLarge { size: WORK_DATA_CAPACITY + 1, max: WORK_DATA_CAPACITY })
        );
        scheduler.schedule(id, &[0; WORK_DATA_CAPACITY]).unwrap();
        assert_eq!(runner.run(), 1);
    }

    #[test]
    fn full_queue_is_reported_and_recovers() {
        let (mut scheduler, mut runner) = work_queue_with_depth(2);
        let id = runner.register(|_| {});
        let big = [0u8; WORK_DATA_CAPACITY];
        scheduler.schedule(id, &big).unwrap();
        scheduler.schedule(id, &big).unwrap();
        assert_eq!(scheduler.schedule(id, &big), Err(ScheduleError::Full));

        assert_eq!(runner.run(), 2);
        scheduler.schedule(id, &big).unwrap();
    }

    #[test]
    fn unknown_procedures_are_skipped() {
        let (mut scheduler, mut runner) = work_queue();
        scheduler.schedule(WorkId(5), &[1]).unwrap();
        assert_eq!(runner.run(), 0);
    }
}
